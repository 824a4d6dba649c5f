use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::ProtocolError;
use super::packet::{read_header, Packet, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Payload collected from the frames of an overlong packet so far
#[derive(Debug)]
struct Continuation {
    first_id: u8,
    last_id: u8,
    payload: BytesMut,
}

/// MySQL packet assembler.
///
/// Turns raw socket bytes into complete logical packets. Bytes stay in the
/// caller's buffer until a whole frame is available, so partial reads never
/// lose state; frames of exactly `MAX_PACKET_SIZE` bytes are joined with the
/// frames that follow them.
#[derive(Debug, Default)]
pub struct PacketCodec {
    continuation: Option<Continuation>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Length of the frame currently being assembled, if its header arrived
    pub fn pending_len(&self, src: &BytesMut) -> Option<u32> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }
        Some(read_header([src[0], src[1], src[2], src[3]]).0)
    }

    /// Whether part of an overlong packet has been consumed already
    pub fn in_continuation(&self) -> bool {
        self.continuation.is_some()
    }

    pub fn reset(&mut self) {
        self.continuation = None;
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < PACKET_HEADER_SIZE {
                return Ok(None);
            }

            let (len, sequence_id) = read_header([src[0], src[1], src[2], src[3]]);
            let len = len as usize;
            if src.len() < PACKET_HEADER_SIZE + len {
                src.reserve(PACKET_HEADER_SIZE + len - src.len());
                return Ok(None);
            }

            src.advance(PACKET_HEADER_SIZE);
            let frame = src.split_to(len);

            let continuation = match self.continuation.take() {
                Some(mut cont) => {
                    let expected = cont.last_id.wrapping_add(1);
                    if sequence_id != expected {
                        return Err(ProtocolError::Sequence {
                            expected,
                            got: sequence_id,
                        });
                    }
                    cont.last_id = sequence_id;
                    cont.payload.unsplit(frame);
                    cont
                }
                None if len == MAX_PACKET_SIZE => Continuation {
                    first_id: sequence_id,
                    last_id: sequence_id,
                    payload: frame,
                },
                None => return Ok(Some(Packet::new(sequence_id, frame.freeze()))),
            };

            if len == MAX_PACKET_SIZE {
                self.continuation = Some(continuation);
                continue;
            }

            return Ok(Some(Packet::new(
                continuation.first_id,
                continuation.payload.freeze(),
            )));
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}
