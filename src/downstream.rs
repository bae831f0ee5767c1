//! Per-worker downstream state: the buffer ring (C3/C4) and the liveness gate it reads.
//!
//! Each [`Downstream`] is exclusively owned by one worker. The `alive` flag is the one piece
//! of state shared across workers; it is written only by the health loop and read here, so a
//! plain [`AtomicBool`] with `Relaxed` ordering is enough (see SPEC_FULL.md §5).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Number of ring slots per downstream.
pub const BUF_NUM: usize = 1024;
/// Capacity, in bytes, of a single ring slot. Chosen to stay under typical Ethernet MTU.
pub const BUF_SIZE: usize = 1450;

/// Shared liveness flag for one downstream, published by the health loop and consulted by
/// every worker's router. Cloning is cheap (`Arc`); all clones observe the same bit.
#[derive(Debug, Clone)]
pub struct AliveFlag(Arc<AtomicBool>);

impl AliveFlag {
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(AtomicBool::new(initial)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// A line that could not be appended without first rotating the ring, plus whatever the
/// rotation produced.
pub struct PushOutcome {
    /// Set when `push` had to drop the active buffer because the ring was still full after
    /// rotating (I4 back-pressure policy).
    pub dropped_bytes: Option<usize>,
    /// Set when this push caused the pipeline to go from empty to non-empty: the caller
    /// should start draining flush slots.
    pub pipeline_armed: bool,
}

/// One configured metric destination, owned by exactly one worker.
pub struct Downstream {
    pub id: usize,
    pub data_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub alive: AliveFlag,

    ring: Vec<Vec<u8>>,
    ring_len: Vec<usize>,
    active_idx: usize,
    flush_idx: usize,
    active_len: usize,

    pub last_flush_time: Instant,
    pub packet_count: u64,
    pub byte_count: u64,

    /// Pre-formatted `<prefix>.<host>-<port>.connections:1|c\n...` line, built once at
    /// startup (see telemetry.rs) instead of formatting into a fixed buffer per tick.
    pub telemetry_connection_line: String,
    pub traffic_metric_name: String,
    pub packets_metric_name: String,
}

impl Downstream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        data_addr: SocketAddr,
        health_addr: SocketAddr,
        alive: AliveFlag,
        telemetry_connection_line: String,
        traffic_metric_name: String,
        packets_metric_name: String,
    ) -> Self {
        Self {
            id,
            data_addr,
            health_addr,
            alive,
            ring: (0..BUF_NUM).map(|_| vec![0u8; BUF_SIZE]).collect(),
            ring_len: vec![0; BUF_NUM],
            active_idx: 0,
            flush_idx: 0,
            active_len: 0,
            last_flush_time: Instant::now(),
            packet_count: 0,
            byte_count: 0,
            telemetry_connection_line,
            traffic_metric_name,
            packets_metric_name,
        }
    }

    pub fn active_len(&self) -> usize {
        self.active_len
    }

    fn pipeline_empty(&self) -> bool {
        self.active_idx == self.flush_idx
    }

    /// Appends `line` to the active buffer, rotating first if it would not fit (I1-I4).
    pub fn push(&mut self, line: &[u8]) -> PushOutcome {
        let mut dropped_bytes = None;
        let mut pipeline_armed = false;

        if self.active_len + line.len() > BUF_SIZE {
            let was_empty = self.pipeline_empty();
            if let Some(dropped) = self.rotate() {
                dropped_bytes = Some(dropped);
            } else if was_empty {
                pipeline_armed = true;
            }
        }

        let start = self.active_len;
        self.ring[self.active_idx][start..start + line.len()].copy_from_slice(line);
        self.active_len += line.len();

        PushOutcome {
            dropped_bytes,
            pipeline_armed,
        }
    }

    /// Advances the active buffer to the next ring slot, publishing the now-full slot for
    /// sending. Returns `Some(dropped_byte_count)` if the ring was already full (I4): the
    /// current active buffer is discarded rather than overwriting a slot still awaiting send.
    pub fn rotate(&mut self) -> Option<usize> {
        let new_active = (self.active_idx + 1) % BUF_NUM;

        if self.ring_len[new_active] > 0 {
            let dropped = self.active_len;
            self.active_len = 0;
            return Some(dropped);
        }

        self.packet_count += 1;
        self.byte_count += self.active_len as u64;
        self.ring_len[self.active_idx] = self.active_len;
        self.active_idx = new_active;
        self.active_len = 0;

        None
    }

    /// Rotates only if there is unflushed data sitting in the active buffer; used by the
    /// periodic flush tick (C4) so an idle downstream isn't force-flushed every interval.
    pub fn rotate_if_pending(&mut self) -> Option<usize> {
        if self.active_len > 0 {
            self.rotate()
        } else {
            None
        }
    }

    /// Returns the next slot ready to be sent, without consuming it.
    pub fn peek_flush_slot(&self) -> Option<(&[u8], usize)> {
        if self.pipeline_empty() {
            return None;
        }
        Some((&self.ring[self.flush_idx], self.ring_len[self.flush_idx]))
    }

    /// Marks the current flush slot as sent and advances the flush pointer. Call this only
    /// after the datagram has actually been handed to the socket (successfully or not; the
    /// slot is consumed either way, matching the original's "don't retry" policy).
    pub fn advance_flush(&mut self) {
        self.ring_len[self.flush_idx] = 0;
        self.flush_idx = (self.flush_idx + 1) % BUF_NUM;
    }

    pub fn has_pending_flush(&self) -> bool {
        !self.pipeline_empty()
    }

    pub fn take_counters(&mut self) -> (u64, u64) {
        let counters = (self.packet_count, self.byte_count);
        self.packet_count = 0;
        self.byte_count = 0;
        counters
    }

    pub fn mark_down(&mut self) -> bool {
        let was_alive = self.alive.get();
        self.alive.set(false);
        // Open question #1: drop the active buffer on DOWN rather than let it linger.
        self.active_len = 0;
        was_alive
    }

    pub fn mark_up(&mut self) -> bool {
        let was_alive = self.alive.get();
        self.alive.set(true);
        !was_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_downstream() -> Downstream {
        Downstream::new(
            0,
            "127.0.0.1:9000".parse().unwrap(),
            "127.0.0.1:9100".parse().unwrap(),
            AliveFlag::new(true),
            String::new(),
            "test.traffic".to_string(),
            "test.packets".to_string(),
        )
    }

    #[test]
    fn push_accumulates_into_active_buffer() {
        let mut ds = test_downstream();
        ds.push(b"foo.bar:1|c\n");
        assert_eq!(ds.active_len(), 12);
        assert!(!ds.has_pending_flush());
    }

    #[test]
    fn overflow_rotates_and_arms_pipeline() {
        let mut ds = test_downstream();
        let line = vec![b'a'; BUF_SIZE - 10];
        ds.push(&line);
        assert!(!ds.has_pending_flush());

        let outcome = ds.push(&line);
        assert!(outcome.pipeline_armed);
        assert!(ds.has_pending_flush());

        let (slot, len) = ds.peek_flush_slot().unwrap();
        assert_eq!(len, BUF_SIZE - 10);
        assert_eq!(&slot[..len], &line[..]);
    }

    #[test]
    fn back_pressure_drops_active_buffer_when_ring_full() {
        let mut ds = test_downstream();
        // Fill every ring slot without ever draining via advance_flush.
        let line = vec![b'x'; BUF_SIZE];
        for _ in 0..BUF_NUM {
            ds.push(&line);
        }
        // One more push must overflow into a still-full slot and drop data.
        let outcome = ds.push(&line);
        assert!(outcome.dropped_bytes.is_some());
        assert_eq!(ds.active_len(), BUF_SIZE);
    }

    #[test]
    fn advance_flush_drains_one_slot_at_a_time() {
        let mut ds = test_downstream();
        let line = vec![b'a'; BUF_SIZE];
        ds.push(&line);
        ds.rotate();
        assert!(ds.has_pending_flush());

        ds.advance_flush();
        assert!(!ds.has_pending_flush());
    }

    #[test]
    fn mark_down_drops_active_buffer_and_clears_alive() {
        let mut ds = test_downstream();
        ds.push(b"foo.bar:1|c\n");
        assert!(ds.mark_down());
        assert_eq!(ds.active_len(), 0);
        assert!(!ds.alive.get());
    }

    #[test]
    fn mark_down_twice_reports_transition_only_once() {
        let mut ds = test_downstream();
        assert!(ds.mark_down());
        assert!(!ds.mark_down());
    }

    #[test]
    fn rotate_if_pending_is_noop_when_empty() {
        let mut ds = test_downstream();
        assert!(ds.rotate_if_pending().is_none());
        assert!(!ds.has_pending_flush());
    }

    #[test]
    fn counters_reset_on_take() {
        let mut ds = test_downstream();
        ds.push(b"foo.bar:1|c\n");
        ds.rotate();
        let (packets, bytes) = ds.take_counters();
        assert_eq!(packets, 1);
        assert_eq!(bytes, 12);
        assert_eq!(ds.take_counters(), (0, 0));
    }
}
