use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use crate::protocol::Packet;

/// A query queued by a hook, sent to the backend ahead of or instead of the
/// client's own
#[derive(Debug, Clone)]
pub struct Injection {
    pub id: u32,
    /// Full command payload, command byte included
    pub query: Bytes,
    /// Hand the response to `read_query_result` instead of streaming it
    pub resultset_is_needed: bool,
    pub result: Vec<Packet>,
    pub queued_at: Instant,
    pub first_response_at: Option<Instant>,
    pub last_response_at: Option<Instant>,
}

impl Injection {
    pub fn new(id: u32, query: Bytes, resultset_is_needed: bool) -> Self {
        Self {
            id,
            query,
            resultset_is_needed,
            result: Vec::new(),
            queued_at: Instant::now(),
            first_response_at: None,
            last_response_at: None,
        }
    }

    /// Record one response packet's arrival, keeping it if needed
    pub fn record(&mut self, packet: &Packet, now: Instant) {
        self.first_response_at.get_or_insert(now);
        self.last_response_at = Some(now);
        if self.resultset_is_needed {
            self.result.push(packet.clone());
        }
    }

    /// Command byte of the injected query
    pub fn command(&self) -> Option<u8> {
        self.query.first().copied()
    }

    /// Time from queueing to the first response packet, in microseconds
    pub fn query_time_us(&self) -> Option<u64> {
        self.first_response_at
            .map(|t| t.saturating_duration_since(self.queued_at).as_micros() as u64)
    }

    /// Time from the first to the last response packet, in microseconds
    pub fn response_time_us(&self) -> Option<u64> {
        match (self.first_response_at, self.last_response_at) {
            (Some(first), Some(last)) => {
                Some(last.saturating_duration_since(first).as_micros() as u64)
            }
            _ => None,
        }
    }
}

/// FIFO of pending injections
#[derive(Debug, Default)]
pub struct InjectionQueue {
    queue: VecDeque<Injection>,
}

impl InjectionQueue {
    pub fn push_back(&mut self, injection: Injection) {
        self.queue.push_back(injection);
    }

    /// Queue ahead of everything else
    pub fn push_front(&mut self, injection: Injection) {
        self.queue.push_front(injection);
    }

    pub fn pop_front(&mut self) -> Option<Injection> {
        self.queue.pop_front()
    }

    pub fn front(&self) -> Option<&Injection> {
        self.queue.front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = InjectionQueue::default();
        queue.push_back(Injection::new(1, Bytes::from_static(b"\x03SELECT 1"), false));
        queue.push_back(Injection::new(2, Bytes::from_static(b"\x03SELECT 2"), false));
        queue.push_front(Injection::new(0, Bytes::from_static(b"\x03SELECT 0"), false));

        let ids: Vec<u32> = std::iter::from_fn(|| queue.pop_front()).map(|i| i.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_record_timestamps() {
        let mut injection = Injection::new(7, Bytes::from_static(b"\x03SELECT 1"), true);
        let t0 = injection.queued_at;
        injection.record(&Packet::new(1, &b"\x01"[..]), t0 + Duration::from_millis(2));
        injection.record(&Packet::new(2, &b"\xfe\x00\x00\x02\x00"[..]), t0 + Duration::from_millis(5));

        assert_eq!(injection.result.len(), 2);
        assert_eq!(injection.query_time_us(), Some(2_000));
        assert_eq!(injection.response_time_us(), Some(3_000));
        assert_eq!(injection.command(), Some(0x03));
    }

    #[test]
    fn test_result_not_kept_unless_needed() {
        let mut injection = Injection::new(1, Bytes::from_static(b"\x0e"), false);
        injection.record(&Packet::new(1, &b"\x00\x00\x00\x02\x00\x00\x00"[..]), Instant::now());
        assert!(injection.result.is_empty());
        assert!(injection.first_response_at.is_some());
    }
}
