use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// Send queue of fully framed packets.
///
/// A partial write advances into the head buffer, so a retried write starts
/// at the first unsent byte.
#[derive(Debug, Default)]
pub struct ByteQueue {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Drain everything into one buffer
    pub fn take_all(&mut self) -> Bytes {
        let len = self.len;
        self.copy_to_bytes(len)
    }
}

impl Buf for ByteQueue {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        self.chunks.front().map(|c| &c[..]).unwrap_or(&[])
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(cnt <= self.len, "advance past end of ByteQueue");
        self.len -= cnt;

        while cnt > 0 {
            let Some(head) = self.chunks.front_mut() else {
                break;
            };
            if cnt < head.len() {
                head.advance(cnt);
                break;
            }
            cnt -= head.len();
            self.chunks.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_len() {
        let mut queue = ByteQueue::new();
        assert!(queue.is_empty());
        queue.push(Bytes::from_static(b"abc"));
        queue.push(Bytes::new());
        queue.push(Bytes::from_static(b"de"));
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.chunk(), b"abc");
    }

    #[test]
    fn test_partial_advance_keeps_offset() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"hello"));
        queue.push(Bytes::from_static(b"world"));

        queue.advance(3);
        assert_eq!(queue.chunk(), b"lo");
        assert_eq!(queue.remaining(), 7);

        queue.advance(4);
        assert_eq!(queue.chunk(), b"rld");
        assert_eq!(&queue.take_all()[..], b"rld");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"x"));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.chunk(), b"");
    }
}
