use thiserror::Error;

use super::wire::DecodeError;

/// Protocol-level failure on one connection
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("unexpected packet 0x{byte:02x} for {command} in {phase}")]
    UnexpectedPacket {
        command: &'static str,
        phase: &'static str,
        byte: u8,
    },

    #[error("frame sequence broken: expected {expected}, got {got}")]
    Sequence { expected: u8, got: u8 },

    #[error("unsupported protocol: {0}")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
