pub mod codec;
pub mod error;
pub mod handshake;
pub mod packet;
pub mod response;
pub mod wire;

pub use codec::PacketCodec;
pub use error::ProtocolError;
pub use handshake::{parse_server_version, AuthChallenge, AuthResponse, ChangeUser};
pub use packet::{capabilities, markers, status, Command, Packet};
pub use response::{is_eof, is_err, is_ok, Column, EofPacket, ErrPacket, OkPacket, ResultSet};
pub use wire::{DecodeError, DecodeResult, PacketReader};
