use bytes::{BufMut, Bytes, BytesMut};

use super::packet::{markers, status};
use super::wire::{put_lenenc_bytes, put_lenenc_int, DecodeError, DecodeResult, PacketReader};

/// Longest error message put on the wire
pub const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// OK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub insert_id: u64,
    pub server_status: u16,
    pub warnings: u16,
    pub info: Bytes,
}

impl Default for OkPacket {
    fn default() -> Self {
        Self {
            affected_rows: 0,
            insert_id: 0,
            server_status: status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
            info: Bytes::new(),
        }
    }
}

impl OkPacket {
    pub fn decode(payload: &[u8]) -> DecodeResult<Self> {
        let mut r = PacketReader::new(payload);
        if r.u8()? != markers::OK {
            return Err(DecodeError::MalformedField("OK packet marker"));
        }

        Ok(Self {
            affected_rows: r.lenenc_int()?,
            insert_id: r.lenenc_int()?,
            server_status: r.u16()?,
            warnings: r.u16()?,
            info: Bytes::copy_from_slice(r.rest()),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.info.len());
        buf.put_u8(markers::OK);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.insert_id);
        buf.put_u16_le(self.server_status);
        buf.put_u16_le(self.warnings);
        buf.put_slice(&self.info);
        buf.freeze()
    }

    pub fn more_results(&self) -> bool {
        self.server_status & status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            message: message.into(),
        }
    }

    /// Generic proxy-side failure (`ER_UNKNOWN_ERROR`, state `07000`)
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::new(1105, "07000", message)
    }

    pub fn decode(payload: &[u8]) -> DecodeResult<Self> {
        let mut r = PacketReader::new(payload);
        if r.u8()? != markers::ERR {
            return Err(DecodeError::MalformedField("ERR packet marker"));
        }
        let error_code = r.u16()?;

        let sql_state = if r.peek() == Some(b'#') {
            r.skip(1)?;
            String::from_utf8_lossy(r.fixed_bytes(5)?).into_owned()
        } else {
            "HY000".to_string()
        };

        Ok(Self {
            error_code,
            sql_state,
            message: String::from_utf8_lossy(r.rest()).into_owned(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let message = truncate_message(&self.message);
        let mut buf = BytesMut::with_capacity(9 + message.len());

        buf.put_u8(markers::ERR);
        buf.put_u16_le(self.error_code);
        buf.put_u8(b'#');

        let mut state = [b'0'; 5];
        for (dst, src) in state.iter_mut().zip(self.sql_state.bytes()) {
            *dst = src;
        }
        buf.put_slice(&state);
        buf.put_slice(message.as_bytes());
        buf.freeze()
    }
}

fn truncate_message(message: &str) -> &str {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// EOF packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub server_status: u16,
}

impl EofPacket {
    pub fn decode(payload: &[u8]) -> DecodeResult<Self> {
        if !is_eof(payload) {
            return Err(DecodeError::MalformedField("EOF packet marker"));
        }
        let mut r = PacketReader::at(payload, 1);
        // 4.0 servers send a bare 0xfe
        if r.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self {
            warnings: r.u16()?,
            server_status: r.u16()?,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(markers::EOF);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.server_status);
        buf.freeze()
    }

    pub fn more_results(&self) -> bool {
        self.server_status & status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    pub fn cursor_exists(&self) -> bool {
        self.server_status & status::SERVER_STATUS_CURSOR_EXISTS != 0
    }
}

pub fn is_ok(payload: &[u8]) -> bool {
    payload.first() == Some(&markers::OK)
}

pub fn is_err(payload: &[u8]) -> bool {
    payload.first() == Some(&markers::ERR)
}

/// A 0xfe packet shorter than 9 bytes; longer ones are row data that starts
/// with an 8-byte length prefix
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&markers::EOF) && payload.len() < 9
}

/// MySQL column types used by synthesized result sets
pub mod column_type {
    pub const LONGLONG: u8 = 0x08;
    pub const VAR_STRING: u8 = 0xfd;
    pub const STRING: u8 = 0xfe;
}

/// Column definition of a synthesized result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: u8,
    pub charset: u16,
    pub length: u32,
    pub flags: u16,
    pub decimals: u8,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type::VAR_STRING,
            charset: 0x08,
            length: 32,
            flags: 0,
            decimals: 0,
        }
    }

    pub fn with_type(mut self, column_type: u8) -> Self {
        self.column_type = column_type;
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + self.name.len() * 2);
        put_lenenc_bytes(&mut buf, b"def");
        put_lenenc_bytes(&mut buf, b"");
        put_lenenc_bytes(&mut buf, b"");
        put_lenenc_bytes(&mut buf, b"");
        put_lenenc_bytes(&mut buf, self.name.as_bytes());
        put_lenenc_bytes(&mut buf, self.name.as_bytes());
        buf.put_u8(0x0c);
        buf.put_u16_le(self.charset);
        buf.put_u32_le(self.length);
        buf.put_u8(self.column_type);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.put_u16_le(0);
        buf.freeze()
    }
}

/// Text-protocol result set built by hooks and sent instead of a backend
/// response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Option<String>>) {
        self.rows.push(row);
    }

    /// Payloads in wire order: column count, definitions, EOF, rows, EOF
    pub fn encode(&self) -> Vec<Bytes> {
        let mut packets = Vec::with_capacity(self.columns.len() + self.rows.len() + 3);

        let mut count = BytesMut::with_capacity(9);
        put_lenenc_int(&mut count, self.columns.len() as u64);
        packets.push(count.freeze());

        packets.extend(self.columns.iter().map(Column::encode));

        let eof = EofPacket {
            warnings: 0,
            server_status: status::SERVER_STATUS_AUTOCOMMIT,
        }
        .encode();
        packets.push(eof.clone());

        for row in &self.rows {
            let mut buf = BytesMut::new();
            for value in row {
                match value {
                    Some(v) => put_lenenc_bytes(&mut buf, v.as_bytes()),
                    None => buf.put_u8(markers::NULL),
                }
            }
            packets.push(buf.freeze());
        }

        packets.push(eof);
        packets
    }
}
