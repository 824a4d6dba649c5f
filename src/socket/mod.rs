//! One side of a proxied connection: stream handle, packet assembly state,
//! outgoing queue and the identity the peer authenticated with.

mod address;
mod queue;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

use crate::protocol::{AuthChallenge, AuthResponse, Packet, PacketCodec, ProtocolError};

pub use address::{AddressError, AddressFamily, NetworkAddress, DEFAULT_MYSQL_PORT};
pub use queue::ByteQueue;

/// Who a socket is logged in as, and what the server told us about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketIdentity {
    pub username: String,
    pub default_db: String,
    pub scrambled_password: Bytes,
    pub thread_id: u32,
    pub server_version: u32,
}

#[derive(Debug, Default)]
pub struct Socket {
    stream: Option<Arc<TcpStream>>,
    recv: BytesMut,
    codec: PacketCodec,
    send: ByteQueue,
    /// Sequence id of the next packet read from or queued to this peer
    pub packet_id: u8,
    pub challenge: Option<AuthChallenge>,
    pub response: Option<AuthResponse>,
    pub identity: SocketIdentity,
    pub is_authed: bool,
}

impl Socket {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(Arc::new(stream)),
            ..Self::default()
        }
    }

    /// A socket without a stream; bytes are fed and drained by the caller
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn stream(&self) -> Option<&Arc<TcpStream>> {
        self.stream.as_ref()
    }

    pub fn recv_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.recv
    }

    pub fn send_queue_mut(&mut self) -> &mut ByteQueue {
        &mut self.send
    }

    /// Append received bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.recv.extend_from_slice(data);
    }

    /// Next complete logical packet, if one has arrived
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        let packet = self.codec.decode(&mut self.recv)?;
        if let Some(packet) = &packet {
            self.packet_id = packet.last_sequence_id().wrapping_add(1);
        }
        Ok(packet)
    }

    /// Frame a payload with the current sequence id and queue it
    pub fn queue_payload(&mut self, payload: Bytes) {
        let packet = Packet::new(self.packet_id, payload);
        self.packet_id = packet.last_sequence_id().wrapping_add(1);

        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        self.send.push(buf.freeze());
    }

    /// Forward a packet read from the other side, renumbered for this peer
    pub fn queue_packet(&mut self, packet: Packet) {
        self.queue_payload(packet.payload);
    }

    pub fn reset_packet_id(&mut self) {
        self.packet_id = 0;
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send.is_empty()
    }

    /// Drain queued bytes without a stream
    pub fn take_sent(&mut self) -> Bytes {
        self.send.take_all()
    }

    /// Nothing buffered in either direction and logged in
    pub fn is_idle_clean(&self) -> bool {
        self.is_authed
            && self.recv.is_empty()
            && self.send.is_empty()
            && !self.codec.in_continuation()
    }

    /// Drop buffered traffic, e.g. before the socket goes back to a pool
    pub fn discard_buffers(&mut self) {
        self.recv.clear();
        self.send.clear();
        self.codec.reset();
        self.packet_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_packet_updates_packet_id() {
        let mut socket = Socket::detached();
        socket.feed(&[0x01, 0x00, 0x00, 0x04, 0x0e]);
        let packet = socket.next_packet().unwrap().unwrap();
        assert_eq!(packet.sequence_id, 4);
        assert_eq!(socket.packet_id, 5);
        assert!(socket.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_queue_numbers_from_packet_id() {
        let mut socket = Socket::detached();
        socket.packet_id = 1;
        socket.queue_payload(Bytes::from_static(b"\x00\x00\x00\x02\x00\x00\x00"));
        socket.queue_packet(Packet::new(9, &b"\xfe\x00\x00\x02\x00"[..]));
        assert_eq!(socket.packet_id, 3);

        let sent = socket.take_sent();
        assert_eq!(sent[3], 1);
        assert_eq!(sent[4 + 7 + 3], 2);
        assert!(!socket.has_pending_send());
    }

    #[test]
    fn test_idle_clean() {
        let mut socket = Socket::detached();
        assert!(!socket.is_idle_clean());
        socket.is_authed = true;
        assert!(socket.is_idle_clean());
        socket.feed(b"\x01");
        assert!(!socket.is_idle_clean());
        socket.discard_buffers();
        assert!(socket.is_idle_clean());
    }
}
