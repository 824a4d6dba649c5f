use bytes::{BufMut, Bytes, BytesMut};

use super::packet::{capabilities::*, Command};
use super::wire::{put_lenenc_bytes, put_nul_string, DecodeError, DecodeResult, PacketReader};

/// Handshake protocol version spoken by every 4.1+ server
pub const PROTOCOL_VERSION: u8 = 0x0a;

/// Initial handshake (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub protocol_version: u8,
    pub server_version_str: String,
    /// `major * 10000 + minor * 100 + patch`
    pub server_version: u32,
    pub thread_id: u32,
    /// First 8 scramble bytes
    pub scramble_head: [u8; 8],
    /// Remaining scramble bytes, without the trailing NUL
    pub scramble_tail: Bytes,
    pub capabilities: u32,
    pub charset: u8,
    pub server_status: u16,
    pub auth_plugin_data_len: u8,
    pub auth_plugin_name: Option<String>,
}

impl AuthChallenge {
    /// Decode the handshake payload
    pub fn decode(payload: &[u8]) -> DecodeResult<Self> {
        let mut r = PacketReader::new(payload);

        let protocol_version = r.u8()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(DecodeError::MalformedField("handshake protocol version"));
        }

        let server_version_str = r.nul_string()?;
        let server_version = parse_server_version(&server_version_str)?;
        let thread_id = r.u32()?;

        let mut scramble_head = [0u8; 8];
        scramble_head.copy_from_slice(r.fixed_bytes(8)?);
        r.skip(1)?;

        let caps_lower = r.u16()? as u32;
        let charset = r.u8()?;
        let server_status = r.u16()?;
        let caps_upper = r.u16()? as u32;
        let capabilities = caps_lower | (caps_upper << 16);
        let auth_plugin_data_len = r.u8()?;
        r.skip(10)?;

        let mut scramble_tail = Bytes::new();
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = 13.max((auth_plugin_data_len as usize).saturating_sub(8));
            let raw = r.fixed_bytes(len.min(r.remaining()))?;
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            scramble_tail = Bytes::copy_from_slice(&raw[..end]);
        }

        let auth_plugin_name = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            let rest = r.rest();
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            Some(String::from_utf8_lossy(&rest[..end]).into_owned())
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            server_version_str,
            server_version,
            thread_id,
            scramble_head,
            scramble_tail,
            capabilities,
            charset,
            server_status,
            auth_plugin_data_len,
            auth_plugin_name,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.server_version_str.len());

        buf.put_u8(self.protocol_version);
        put_nul_string(&mut buf, self.server_version_str.as_bytes());
        buf.put_u32_le(self.thread_id);
        buf.put_slice(&self.scramble_head);
        buf.put_u8(0);

        buf.put_u16_le((self.capabilities & 0xFFFF) as u16);
        buf.put_u8(self.charset);
        buf.put_u16_le(self.server_status);
        buf.put_u16_le((self.capabilities >> 16) as u16);
        buf.put_u8(self.auth_plugin_data_len);
        buf.put_slice(&[0u8; 10]);

        if self.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            put_nul_string(&mut buf, &self.scramble_tail);
        }

        if let Some(name) = &self.auth_plugin_name {
            put_nul_string(&mut buf, name.as_bytes());
        }

        buf.freeze()
    }

    /// Full scramble the client hashes its password against
    pub fn scramble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.scramble_tail.len());
        buf.put_slice(&self.scramble_head);
        buf.put_slice(&self.scramble_tail);
        buf.freeze()
    }

    /// Drop capabilities the proxy cannot relay.
    ///
    /// Result sets are delimited by EOF packets, so the EOF-less protocol is
    /// switched off as well.
    pub fn clear_unsupported(&mut self) {
        self.capabilities &= !(UNSUPPORTED_CAPABILITIES | CLIENT_DEPRECATE_EOF);
    }
}

/// Parse `"5.0.45-Debian_1ubuntu3.3-log"` into `50045`
pub fn parse_server_version(version: &str) -> DecodeResult<u32> {
    fn leading_number(part: &str) -> Option<u32> {
        let end = part
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(part.len());
        part[..end].parse().ok()
    }

    let mut parts = version.splitn(3, '.');
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| p.parse::<u32>().ok());
    let patch = parts.next().and_then(leading_number);

    match (major, minor, patch) {
        (Some(major), Some(minor), Some(patch)) if minor < 100 && patch < 100 => {
            Ok(major * 10000 + minor * 100 + patch)
        }
        _ => Err(DecodeError::MalformedField("server version string")),
    }
}

/// Handshake response (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    /// Scrambled password as sent by the client
    pub auth_data: Bytes,
    /// Present when `CLIENT_CONNECT_WITH_DB` is set and the field was sent
    pub database: Option<String>,
    pub auth_plugin_name: Option<String>,
    /// Connection attributes and anything else after the known fields
    pub trailing: Bytes,
}

impl AuthResponse {
    pub fn decode(payload: &[u8]) -> DecodeResult<Self> {
        let mut r = PacketReader::new(payload);

        let capabilities = r.u32()?;
        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(DecodeError::MalformedField("pre-4.1 auth response"));
        }
        let max_packet_size = r.u32()?;
        let charset = r.u8()?;
        r.skip(23)?;

        let username = r.nul_string()?;

        let auth_data = if capabilities
            & (CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
            != 0
        {
            Bytes::copy_from_slice(r.lenenc_bytes()?)
        } else {
            Bytes::copy_from_slice(r.nul_bytes()?)
        };

        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
            Some(r.nul_string()?)
        } else {
            None
        };

        let auth_plugin_name = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            Some(r.nul_string()?)
        } else {
            None
        };

        let trailing = Bytes::copy_from_slice(r.rest());

        Ok(Self {
            capabilities,
            max_packet_size,
            charset,
            username,
            auth_data,
            database,
            auth_plugin_name,
            trailing,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.username.len() + self.auth_data.len());

        buf.put_u32_le(self.capabilities);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.charset);
        buf.put_slice(&[0u8; 23]);

        put_nul_string(&mut buf, self.username.as_bytes());

        if self.capabilities & (CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
            != 0
        {
            put_lenenc_bytes(&mut buf, &self.auth_data);
        } else {
            put_nul_string(&mut buf, &self.auth_data);
        }

        if let Some(db) = &self.database {
            put_nul_string(&mut buf, db.as_bytes());
        }
        if let Some(name) = &self.auth_plugin_name {
            put_nul_string(&mut buf, name.as_bytes());
        }
        buf.put_slice(&self.trailing);

        buf.freeze()
    }

    /// Default schema, with an empty name meaning none
    pub fn default_db(&self) -> &str {
        self.database.as_deref().unwrap_or("")
    }
}

/// `COM_CHANGE_USER` used to re-authenticate a pooled server connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeUser {
    pub username: String,
    pub auth_data: Bytes,
    pub database: String,
    pub charset: u8,
}

impl ChangeUser {
    /// Carry the client's credentials over to the pooled connection
    pub fn from_auth(auth: &AuthResponse) -> Self {
        Self {
            username: auth.username.clone(),
            auth_data: auth.auth_data.clone(),
            database: auth.default_db().to_string(),
            charset: auth.charset,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.username.len() + self.auth_data.len());

        buf.put_u8(Command::ChangeUser as u8);
        put_nul_string(&mut buf, self.username.as_bytes());
        buf.put_u8(self.auth_data.len() as u8);
        buf.put_slice(&self.auth_data);
        put_nul_string(&mut buf, self.database.as_bytes());
        buf.put_u16_le(self.charset as u16);

        buf.freeze()
    }
}
