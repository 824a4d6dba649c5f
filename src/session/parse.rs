//! Result-set completion tracking.
//!
//! MySQL responses carry no total length, so the end of a response has to be
//! inferred packet by packet from the command that is in flight.

use crate::protocol::{
    is_eof, is_err, is_ok, markers, Command, EofPacket, OkPacket, PacketReader, ProtocolError,
};

/// Sub-phase of a text or binary result set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    /// Waiting for OK, ERR, LOCAL INFILE request or the column count
    Init,
    /// Column definitions until EOF
    Field,
    /// Rows until EOF
    Result,
    /// Client is uploading a LOCAL INFILE
    LoadData,
    /// Upload finished, waiting for the server's verdict
    LoadDataEndData,
}

impl QueryPhase {
    fn name(self) -> &'static str {
        match self {
            QueryPhase::Init => "init",
            QueryPhase::Field => "field",
            QueryPhase::Result => "result",
            QueryPhase::LoadData => "load_data",
            QueryPhase::LoadDataEndData => "load_data_end",
        }
    }
}

/// Per-command state of the response currently being read
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    Idle,
    /// `COM_QUERY`, `COM_PROCESS_INFO`, `COM_STMT_EXECUTE`, `COM_STMT_FETCH`
    Query { command: Command, phase: QueryPhase },
    /// `COM_STMT_PREPARE`; `None` until the OK header announced the EOFs
    StmtPrepare { eofs_left: Option<u8> },
    FieldList,
    InitDb { db: String },
    ChangeUser {
        username: String,
        default_db: String,
        first_err_seen: bool,
    },
    BinlogDump,
    /// Commands the server never answers
    NoResponse { command: Command },
    /// Commands answered with exactly one packet
    Simple { command: Command },
}

/// Verdict on one server packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// The response is complete
    pub finished: bool,
    /// The packet goes to the client
    pub forward: bool,
}

impl Classification {
    const MORE: Self = Self {
        finished: false,
        forward: true,
    };
    const DONE: Self = Self {
        finished: true,
        forward: true,
    };
}

/// Settings that change classification
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext {
    pub server_version: u32,
    pub fix_bug_25371: bool,
}

impl ClassifyContext {
    /// Servers in this range send a second ERR for a failed COM_CHANGE_USER
    fn sends_duplicate_change_user_err(&self) -> bool {
        self.fix_bug_25371 && self.server_version > 50113 && self.server_version < 50118
    }
}

impl ParseState {
    /// State for a command packet about to be sent to the server
    pub fn for_command(payload: &[u8]) -> Self {
        let command = payload.first().copied().map(Command::from).unwrap_or(Command::Unknown);
        let body = payload.get(1..).unwrap_or_default();

        match command {
            Command::Query | Command::ProcessInfo | Command::StmtExecute => ParseState::Query {
                command,
                phase: QueryPhase::Init,
            },
            Command::StmtFetch => ParseState::Query {
                command,
                phase: QueryPhase::Result,
            },
            Command::StmtPrepare => ParseState::StmtPrepare { eofs_left: None },
            Command::FieldList => ParseState::FieldList,
            Command::InitDb => ParseState::InitDb {
                db: String::from_utf8_lossy(body).into_owned(),
            },
            Command::ChangeUser => {
                let (username, default_db) = parse_change_user(body);
                ParseState::ChangeUser {
                    username,
                    default_db,
                    first_err_seen: false,
                }
            }
            Command::BinlogDump | Command::BinlogDumpGtid => ParseState::BinlogDump,
            Command::Quit | Command::StmtClose | Command::StmtSendLongData => {
                ParseState::NoResponse { command }
            }
            _ => ParseState::Simple { command },
        }
    }

    pub fn command(&self) -> Option<Command> {
        match self {
            ParseState::Idle => None,
            ParseState::Query { command, .. }
            | ParseState::NoResponse { command }
            | ParseState::Simple { command } => Some(*command),
            ParseState::StmtPrepare { .. } => Some(Command::StmtPrepare),
            ParseState::FieldList => Some(Command::FieldList),
            ParseState::InitDb { .. } => Some(Command::InitDb),
            ParseState::ChangeUser { .. } => Some(Command::ChangeUser),
            ParseState::BinlogDump => Some(Command::BinlogDump),
        }
    }

    /// Whether the server sends anything back
    pub fn expects_response(&self) -> bool {
        !matches!(self, ParseState::Idle | ParseState::NoResponse { .. })
    }

    /// Client is uploading a LOCAL INFILE
    pub fn is_load_data(&self) -> bool {
        matches!(
            self,
            ParseState::Query {
                phase: QueryPhase::LoadData,
                ..
            }
        )
    }

    /// The client's upload ended with an empty packet
    pub fn load_data_finished(&mut self) {
        if let ParseState::Query { phase, .. } = self {
            if *phase == QueryPhase::LoadData {
                *phase = QueryPhase::LoadDataEndData;
            }
        }
    }

    /// Classify the next server packet of the response
    pub fn classify(
        &mut self,
        payload: &[u8],
        ctx: &ClassifyContext,
    ) -> Result<Classification, ProtocolError> {
        let first = payload.first().copied().unwrap_or(markers::OK);

        match self {
            ParseState::Query { command, phase } => classify_query(*command, phase, payload),

            ParseState::StmtPrepare { eofs_left } => match eofs_left {
                None if is_err(payload) => Ok(Classification::DONE),
                None if is_ok(payload) => {
                    let mut r = PacketReader::at(payload, 1);
                    let _stmt_id = r.u32()?;
                    let num_columns = r.u16()?;
                    let num_params = r.u16()?;
                    let expected = (num_columns > 0) as u8 + (num_params > 0) as u8;
                    *eofs_left = Some(expected);
                    Ok(Classification {
                        finished: expected == 0,
                        forward: true,
                    })
                }
                None => Err(unexpected(Command::StmtPrepare, "header", first)),
                Some(left) => {
                    if is_eof(payload) {
                        *left = left.saturating_sub(1);
                        if *left == 0 {
                            return Ok(Classification::DONE);
                        }
                    }
                    Ok(Classification::MORE)
                }
            },

            ParseState::FieldList => {
                if is_err(payload) || is_eof(payload) {
                    Ok(Classification::DONE)
                } else {
                    Ok(Classification::MORE)
                }
            }

            ParseState::InitDb { .. } => {
                if is_ok(payload) || is_err(payload) {
                    Ok(Classification::DONE)
                } else {
                    Err(unexpected(Command::InitDb, "result", first))
                }
            }

            ParseState::ChangeUser { first_err_seen, .. } => {
                if is_err(payload) {
                    if !ctx.sends_duplicate_change_user_err() {
                        return Ok(Classification::DONE);
                    }
                    if !*first_err_seen {
                        *first_err_seen = true;
                        return Ok(Classification::MORE);
                    }
                    // the duplicate: swallow it
                    return Ok(Classification {
                        finished: true,
                        forward: false,
                    });
                }
                if is_ok(payload) || is_eof(payload) {
                    Ok(Classification::DONE)
                } else {
                    Err(unexpected(Command::ChangeUser, "result", first))
                }
            }

            ParseState::BinlogDump => Ok(Classification::MORE),

            ParseState::Simple { .. } | ParseState::NoResponse { .. } => Ok(Classification::DONE),

            ParseState::Idle => Err(ProtocolError::UnexpectedPacket {
                command: "none",
                phase: "idle",
                byte: first,
            }),
        }
    }
}

fn classify_query(
    command: Command,
    phase: &mut QueryPhase,
    payload: &[u8],
) -> Result<Classification, ProtocolError> {
    let first = payload.first().copied().unwrap_or(markers::OK);

    match *phase {
        QueryPhase::Init => match first {
            markers::ERR => Ok(Classification::DONE),
            markers::OK => {
                let ok = OkPacket::decode(payload)?;
                Ok(Classification {
                    finished: !ok.more_results(),
                    forward: true,
                })
            }
            markers::NULL => {
                *phase = QueryPhase::LoadData;
                Ok(Classification::DONE)
            }
            markers::EOF if is_eof(payload) => Err(unexpected(command, phase.name(), first)),
            _ => {
                *phase = QueryPhase::Field;
                Ok(Classification::MORE)
            }
        },

        QueryPhase::Field => {
            if is_err(payload) {
                return Ok(Classification::DONE);
            }
            if !is_eof(payload) {
                return Ok(Classification::MORE);
            }
            let eof = EofPacket::decode(payload)?;
            if eof.cursor_exists() {
                return Ok(Classification::DONE);
            }
            *phase = QueryPhase::Result;
            Ok(Classification::MORE)
        }

        QueryPhase::Result => {
            if is_err(payload) {
                return Ok(Classification::DONE);
            }
            if !is_eof(payload) {
                // rows, including ones whose first field is 0x00 or NULL
                return Ok(Classification::MORE);
            }
            let eof = EofPacket::decode(payload)?;
            if eof.more_results() {
                *phase = QueryPhase::Init;
                return Ok(Classification::MORE);
            }
            Ok(Classification::DONE)
        }

        QueryPhase::LoadData => Err(unexpected(command, phase.name(), first)),

        QueryPhase::LoadDataEndData => {
            if is_ok(payload) || is_err(payload) {
                Ok(Classification::DONE)
            } else {
                Err(unexpected(command, phase.name(), first))
            }
        }
    }
}

fn unexpected(command: Command, phase: &'static str, byte: u8) -> ProtocolError {
    ProtocolError::UnexpectedPacket {
        command: command.name(),
        phase,
        byte,
    }
}

/// Username and schema out of a `COM_CHANGE_USER` body
fn parse_change_user(body: &[u8]) -> (String, String) {
    let mut r = PacketReader::new(body);
    let Ok(username) = r.nul_string() else {
        return (String::new(), String::new());
    };
    let default_db = r
        .u8()
        .and_then(|len| r.skip(len as usize))
        .and_then(|_| r.nul_string())
        .unwrap_or_default();
    (username, default_db)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::status::*;
    use crate::protocol::ChangeUser;

    fn ok(status: u16) -> Bytes {
        OkPacket {
            server_status: status,
            ..OkPacket::default()
        }
        .encode()
    }

    fn eof(status: u16) -> Bytes {
        EofPacket {
            warnings: 0,
            server_status: status,
        }
        .encode()
    }

    fn err() -> Bytes {
        crate::protocol::ErrPacket::proxy("boom").encode()
    }

    fn s(bytes: &'static [u8]) -> Bytes {
        Bytes::from_static(bytes)
    }

    fn ctx() -> ClassifyContext {
        ClassifyContext::default()
    }

    /// Index of the packet that finished the response
    fn finish_index(state: &mut ParseState, packets: &[Bytes]) -> Option<usize> {
        for (i, p) in packets.iter().enumerate() {
            if state.classify(p, &ctx()).unwrap().finished {
                return Some(i);
            }
        }
        None
    }

    #[test]
    fn test_query_ok_finishes() {
        let mut state = ParseState::for_command(b"\x03SET @a = 1");
        let c = state.classify(&ok(SERVER_STATUS_AUTOCOMMIT), &ctx()).unwrap();
        assert!(c.finished && c.forward);
    }

    #[test]
    fn test_query_ok_with_more_results_stays_init() {
        let mut state = ParseState::for_command(b"\x03CALL p()");
        let c = state.classify(&ok(SERVER_MORE_RESULTS_EXISTS), &ctx()).unwrap();
        assert!(!c.finished);
        assert_eq!(
            state,
            ParseState::Query {
                command: Command::Query,
                phase: QueryPhase::Init
            }
        );
        assert!(state.classify(&ok(0), &ctx()).unwrap().finished);
    }

    #[test]
    fn test_query_result_set_finishes_on_final_eof() {
        let mut state = ParseState::for_command(b"\x03SELECT a, b FROM t");
        let packets = vec![
            s(b"\x02"),
            s(b"\x03def\x00\x00\x00\x01a\x01a"),
            s(b"\x03def\x00\x00\x00\x01b\x01b"),
            eof(0),
            s(b"\x011\x012"),
            // first column NULL, then an empty string
            s(b"\xfb\x00"),
            eof(0),
        ];
        assert_eq!(finish_index(&mut state, &packets), Some(6));
    }

    #[test]
    fn test_long_0xfe_row_is_not_eof() {
        let mut state = ParseState::Query {
            command: Command::Query,
            phase: QueryPhase::Result,
        };
        let mut row = vec![0xfe, 1, 0, 0, 0, 0, 0, 0, 0];
        row.push(b'x');
        assert!(!state.classify(&row, &ctx()).unwrap().finished);
        assert!(state.classify(&eof(0), &ctx()).unwrap().finished);
    }

    #[test]
    fn test_multi_result_set_loops_to_init() {
        let mut state = ParseState::for_command(b"\x03SELECT 1; SELECT 2");
        let more = eof(SERVER_MORE_RESULTS_EXISTS);
        let last = eof(0);
        let packets = vec![
            s(b"\x01"),
            s(b"\x03def\x00\x00\x00\x011\x011"),
            last.clone(),
            s(b"\x011"),
            more,
            s(b"\x01"),
            s(b"\x03def\x00\x00\x00\x012\x012"),
            last.clone(),
            s(b"\x012"),
            last,
        ];
        assert_eq!(finish_index(&mut state, &packets), Some(9));
    }

    #[test]
    fn test_cursor_finishes_after_fields() {
        let mut state = ParseState::for_command(b"\x17\x01\x00\x00\x00\x01\x01\x00\x00\x00");
        let packets = vec![
            s(b"\x01"),
            s(b"\x03def\x00\x00\x00\x01a\x01a"),
            eof(SERVER_STATUS_CURSOR_EXISTS),
        ];
        assert_eq!(finish_index(&mut state, &packets), Some(2));
    }

    #[test]
    fn test_stmt_fetch_starts_in_rows() {
        let mut state = ParseState::for_command(b"\x1c\x01\x00\x00\x00\x0a\x00\x00\x00");
        assert!(!state.classify(b"\x00\x00\x01", &ctx()).unwrap().finished);
        assert!(state.classify(&eof(SERVER_STATUS_LAST_ROW_SENT), &ctx()).unwrap().finished);
    }

    #[test]
    fn test_eof_in_init_is_protocol_error() {
        let mut state = ParseState::for_command(b"\x03SELECT 1");
        assert!(matches!(
            state.classify(&eof(0), &ctx()),
            Err(ProtocolError::UnexpectedPacket {
                command: "COM_QUERY",
                phase: "init",
                byte: 0xfe
            })
        ));
    }

    #[test]
    fn test_truncated_ok_is_decode_error() {
        let mut state = ParseState::for_command(b"\x03SELECT 1");
        assert!(matches!(
            state.classify(b"\x00\x01", &ctx()),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_load_data_handoff() {
        let mut state = ParseState::for_command(b"\x03LOAD DATA LOCAL INFILE 'x' INTO TABLE t");
        let c = state.classify(b"\xfbx", &ctx()).unwrap();
        assert!(c.finished);
        assert!(state.is_load_data());

        // server must not speak during the upload
        assert!(state.clone().classify(&ok(0), &ctx()).is_err());

        state.load_data_finished();
        assert!(!state.is_load_data());
        assert!(state.classify(&ok(0), &ctx()).unwrap().finished);
    }

    #[test]
    fn test_load_data_end_rejects_other_packets() {
        let mut state = ParseState::Query {
            command: Command::Query,
            phase: QueryPhase::LoadDataEndData,
        };
        assert!(state.classify(b"\x01", &ctx()).is_err());
    }

    #[test]
    fn test_stmt_prepare_counts_eofs() {
        // 2 params, 1 column: two EOF-terminated blocks
        let mut state = ParseState::for_command(b"\x16SELECT ? + ?");
        let packets = vec![
            s(b"\x00\x01\x00\x00\x00\x01\x00\x02\x00\x00\x00\x00"),
            s(b"param"),
            s(b"param"),
            eof(0),
            s(b"column"),
            eof(0),
        ];
        assert_eq!(finish_index(&mut state, &packets), Some(5));

        // nothing announced: the header alone
        let mut state = ParseState::for_command(b"\x16DO 1");
        let header: &[u8] = b"\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00";
        assert!(state.classify(header, &ctx()).unwrap().finished);

        let mut state = ParseState::for_command(b"\x16bogus");
        assert!(state.classify(&err(), &ctx()).unwrap().finished);
    }

    #[test]
    fn test_field_list() {
        let mut state = ParseState::for_command(b"\x04t\x00");
        assert!(!state.classify(b"\x03def", &ctx()).unwrap().finished);
        assert!(state.classify(&eof(0), &ctx()).unwrap().finished);
    }

    #[test]
    fn test_single_packet_commands() {
        for cmd in [&b"\x09"[..], &b"\x0e"[..], &b"\x1f"[..]] {
            let mut state = ParseState::for_command(cmd);
            assert!(state.expects_response());
            assert!(state.classify(b"Uptime: 10", &ctx()).unwrap().finished);
        }
    }

    #[test]
    fn test_no_response_commands() {
        for cmd in [
            &b"\x01"[..],
            &b"\x19\x01\x00\x00\x00"[..],
            &b"\x18\x01\x00\x00\x00\x00\x00"[..],
        ] {
            assert!(!ParseState::for_command(cmd).expects_response());
        }
    }

    #[test]
    fn test_init_db() {
        let mut state = ParseState::for_command(b"\x02shop");
        assert_eq!(state, ParseState::InitDb { db: "shop".to_string() });
        assert!(state.classify(&ok(0), &ctx()).unwrap().finished);

        let mut state = ParseState::for_command(b"\x02shop");
        assert!(state.classify(b"\x05", &ctx()).is_err());
    }

    #[test]
    fn test_change_user_parses_identity() {
        let payload = ChangeUser {
            username: "bob".to_string(),
            auth_data: Bytes::from_static(&[9; 20]),
            database: "crm".to_string(),
            charset: 8,
        }
        .encode();
        match ParseState::for_command(&payload) {
            ParseState::ChangeUser {
                username,
                default_db,
                ..
            } => {
                assert_eq!(username, "bob");
                assert_eq!(default_db, "crm");
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_change_user_duplicate_err_workaround() {
        let buggy = ClassifyContext {
            server_version: 50115,
            fix_bug_25371: true,
        };
        let mut state = ParseState::for_command(b"\x11root\x00\x00\x00");
        let first = state.classify(&err(), &buggy).unwrap();
        assert_eq!(
            first,
            Classification {
                finished: false,
                forward: true
            }
        );
        let second = state.classify(&err(), &buggy).unwrap();
        assert_eq!(
            second,
            Classification {
                finished: true,
                forward: false
            }
        );
    }

    #[test]
    fn test_change_user_workaround_bounds() {
        for version in [50113, 50118, 50045] {
            let ctx = ClassifyContext {
                server_version: version,
                fix_bug_25371: true,
            };
            let mut state = ParseState::for_command(b"\x11root\x00\x00\x00");
            assert!(state.classify(&err(), &ctx).unwrap().finished, "version {}", version);
        }

        let disabled = ClassifyContext {
            server_version: 50115,
            fix_bug_25371: false,
        };
        let mut state = ParseState::for_command(b"\x11root\x00\x00\x00");
        assert!(state.classify(&err(), &disabled).unwrap().finished);
    }

    #[test]
    fn test_binlog_dump_never_finishes() {
        let mut state = ParseState::for_command(b"\x12\x04\x00\x00\x00\x00\x00");
        for _ in 0..10 {
            let c = state.classify(b"\x00event", &ctx()).unwrap();
            assert!(!c.finished && c.forward);
        }
        assert!(!state.classify(&eof(0), &ctx()).unwrap().finished);
    }
}
