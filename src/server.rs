//! A sans-IO metric router.
//!
//! A [`Server`] owns one worker's slice of [`Downstream`] state (C3/C4) and the routing logic
//! (C2) that picks a downstream for each ingested line. It performs no I/O itself: callers feed
//! it datagrams and deadlines, and drain [`Command`]s describing the side effects the caller
//! should perform. This keeps the routing/buffering state machine deterministic and trivially
//! testable, while the IO shell (see `worker.rs`) owns every socket and timer.

use crate::downstream::{AliveFlag, Downstream};
use crate::hash::{sdbm_hash, select_downstream};
use crate::line_framer::frame_lines;
use crate::telemetry;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A side effect the IO shell must perform on behalf of the [`Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send `payload` to `addr` over this worker's egress UDP socket.
    SendDatagram { addr: SocketAddr, payload: Vec<u8> },
}

/// Construction parameters for one downstream, as resolved by the config loader.
pub struct DownstreamSpec {
    pub data_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub alive: AliveFlag,
    pub telemetry: telemetry::DownstreamTelemetryNames,
}

/// Sans-IO router core owned by a single worker.
pub struct Server {
    downstreams: Vec<Downstream>,
    commands: VecDeque<Command>,
    alive_gauge_name: String,
}

impl Server {
    pub fn new(specs: Vec<DownstreamSpec>, alive_gauge_name: String) -> Self {
        let downstreams = specs
            .into_iter()
            .enumerate()
            .map(|(id, spec)| {
                Downstream::new(
                    id,
                    spec.data_addr,
                    spec.health_addr,
                    spec.alive,
                    spec.telemetry.connection_line,
                    spec.telemetry.traffic_metric,
                    spec.telemetry.packets_metric,
                )
            })
            .collect();

        Self {
            downstreams,
            commands: VecDeque::new(),
            alive_gauge_name,
        }
    }

    pub fn downstream_count(&self) -> usize {
        self.downstreams.len()
    }

    pub fn downstream_health_addr(&self, id: usize) -> SocketAddr {
        self.downstreams[id].health_addr
    }

    pub fn downstream_data_addr(&self, id: usize) -> SocketAddr {
        self.downstreams[id].data_addr
    }

    pub fn downstream_alive_flag(&self, id: usize) -> AliveFlag {
        self.downstreams[id].alive.clone()
    }

    /// Pops the next pending side effect, if any.
    pub fn next_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    /// Frames `datagram` into metric lines (C1) and routes each through C2/C3.
    pub fn handle_datagram(&mut self, datagram: &[u8]) {
        let mut newly_armed = Vec::new();

        frame_lines(datagram, crate::downstream::BUF_SIZE, |line| {
            if let Some(idx) = Self::route_line(&mut self.downstreams, line) {
                newly_armed.push(idx);
            }
        });

        for idx in newly_armed {
            self.enqueue_if_armed(idx);
        }
    }

    /// Routes a single, already-validated line to a downstream, returning its index if the
    /// push just armed a previously idle pipeline (caller should offer a send).
    fn route_line(downstreams: &mut [Downstream], line: &[u8]) -> Option<usize> {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            tracing::warn!(
                line = %String::from_utf8_lossy(line),
                "invalid metric line: missing ':'"
            );
            return None;
        };

        let hash = sdbm_hash(&line[..colon]);
        let alive: Vec<bool> = downstreams.iter().map(|d| d.alive.get()).collect();

        let Some(idx) = select_downstream(hash, &alive) else {
            tracing::warn!("all downstreams are dead, dropping line");
            return None;
        };

        let outcome = downstreams[idx].push(line);
        if let Some(dropped) = outcome.dropped_bytes {
            tracing::warn!(
                downstream_id = idx,
                dropped,
                "previous flush is not completed, losing data"
            );
        }

        outcome.pipeline_armed.then_some(idx)
    }

    /// Enqueues a `SendDatagram` for `idx`'s current flush slot if one is waiting. Called right
    /// after a push/rotate that armed the pipeline, and again from [`Self::on_sent`] to keep
    /// draining while slots remain ready.
    fn enqueue_if_armed(&mut self, idx: usize) {
        if let Some((slot, len)) = self.downstreams[idx].peek_flush_slot() {
            self.commands.push_back(Command::SendDatagram {
                addr: self.downstreams[idx].data_addr,
                payload: slot[..len].to_vec(),
            });
        }
    }

    /// Call once the IO shell has actually dispatched the datagram for `downstream_id`
    /// (successfully or not — the original never retries a failed send either).
    pub fn on_sent(&mut self, downstream_id: usize, now: Instant) {
        self.downstreams[downstream_id].advance_flush();
        self.downstreams[downstream_id].last_flush_time = now;
        self.enqueue_if_armed(downstream_id);
    }

    /// Mirrors the shared `AliveFlag` the health loop (C5) publishes into each downstream's
    /// worker-local bookkeeping. `Downstream::mark_down` drops the worker's active buffer
    /// (Open Question #1 in DESIGN.md): the health loop only ever touches the shared bit, never
    /// a worker's `Downstream`, so each worker applies the current state to its own ring itself,
    /// every tick. The up/down transition is already logged by `health::run`, which owns it.
    fn sync_liveness(&mut self) {
        for ds in &mut self.downstreams {
            if ds.alive.get() {
                ds.mark_up();
            } else {
                ds.mark_down();
            }
        }
    }

    /// Periodic flush tick (C4): any downstream that has unflushed bytes sitting in its active
    /// buffer for longer than `flush_interval` gets rotated, bounding ingress-to-egress latency.
    pub fn flush_tick(&mut self, flush_interval: Duration, now: Instant) {
        self.sync_liveness();

        for idx in 0..self.downstreams.len() {
            let ds = &self.downstreams[idx];
            if ds.active_len() == 0 || now.duration_since(ds.last_flush_time) <= flush_interval {
                continue;
            }

            let was_idle = !ds.has_pending_flush();
            let dropped = self.downstreams[idx].rotate();
            if let Some(dropped) = dropped {
                tracing::warn!(
                    downstream_id = idx,
                    dropped,
                    "previous flush is not completed, losing data"
                );
            } else if was_idle {
                self.enqueue_if_armed(idx);
            }
        }
    }

    /// Self-telemetry tick (C6): injects connection/traffic/packet counters for every
    /// downstream plus one alive-count gauge, through the ordinary routing path.
    pub fn ping_tick(&mut self) {
        let mut alive_count = 0usize;

        for idx in 0..self.downstreams.len() {
            let (alive, connection_line, traffic_metric, packets_metric) = {
                let ds = &self.downstreams[idx];
                (
                    ds.alive.get(),
                    ds.telemetry_connection_line.clone(),
                    ds.traffic_metric_name.clone(),
                    ds.packets_metric_name.clone(),
                )
            };

            if alive {
                alive_count += 1;
                self.inject(connection_line.as_bytes());
            }

            let (packets, bytes) = self.downstreams[idx].take_counters();
            self.inject(telemetry::counter_line(&traffic_metric, bytes).as_bytes());
            self.inject(telemetry::counter_line(&packets_metric, packets).as_bytes());
        }

        let gauge = telemetry::gauge_line(&self.alive_gauge_name, alive_count);
        self.inject(gauge.as_bytes());
    }

    /// Feeds a synthetic line (self-telemetry) back through the ordinary routing path, exactly
    /// as if it had arrived on the ingress socket.
    fn inject(&mut self, line: &[u8]) {
        if let Some(idx) = Self::route_line(&mut self.downstreams, line) {
            self.enqueue_if_armed(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::AliveFlag;
    use crate::telemetry::DownstreamTelemetryNames;
    use std::time::Duration;

    fn spec(id: usize, alive: bool) -> DownstreamSpec {
        DownstreamSpec {
            data_addr: format!("127.0.0.1:{}", 9000 + id).parse().unwrap(),
            health_addr: format!("127.0.0.1:{}", 9100 + id).parse().unwrap(),
            alive: AliveFlag::new(alive),
            telemetry: DownstreamTelemetryNames::new("sr", 8125, "h", 8125),
        }
    }

    #[test]
    fn single_line_is_forwarded_as_one_command() {
        let mut server = Server::new(vec![spec(0, true)], "sr.h.healthy_downstreams".into());

        server.flush_tick(Duration::from_secs(0), Instant::now());
        server.handle_datagram(b"foo.bar:1|c\n");
        // A single small line never overflows the active buffer, so nothing is armed yet;
        // only the periodic flush (driven by the worker) produces a command.
        assert!(server.next_command().is_none());

        server.flush_tick(Duration::from_millis(0), Instant::now() + Duration::from_secs(1));
        let cmd = server.next_command().expect("flush produced a command");
        assert_eq!(
            cmd,
            Command::SendDatagram {
                addr: "127.0.0.1:9000".parse().unwrap(),
                payload: b"foo.bar:1|c\n".to_vec(),
            }
        );
    }

    #[test]
    fn overflow_immediately_arms_a_send() {
        let mut server = Server::new(vec![spec(0, true)], "sr.h.healthy_downstreams".into());
        let line = vec![b'a'; crate::downstream::BUF_SIZE - 10];
        let mut datagram = line.clone();
        datagram.push(b'\n');

        server.handle_datagram(&datagram);
        assert!(server.next_command().is_none());

        server.handle_datagram(&datagram);
        assert!(server.next_command().is_some());
    }

    #[test]
    fn dead_downstream_is_skipped() {
        let mut server = Server::new(
            vec![spec(0, false), spec(1, true)],
            "sr.h.healthy_downstreams".into(),
        );

        server.handle_datagram(b"metric.name:1|c\n");
        server.flush_tick(Duration::from_millis(0), Instant::now() + Duration::from_secs(1));

        let cmd = server.next_command().expect("routed to the alive downstream");
        assert_eq!(
            cmd,
            Command::SendDatagram {
                addr: "127.0.0.1:9001".parse().unwrap(),
                payload: b"metric.name:1|c\n".to_vec(),
            }
        );
    }

    #[test]
    fn ping_tick_emits_gauge_with_alive_count() {
        let mut server = Server::new(
            vec![spec(0, true), spec(1, false)],
            "sr.h-8125.healthy_downstreams".into(),
        );

        server.ping_tick();
        server.flush_tick(Duration::from_millis(0), Instant::now() + Duration::from_secs(1));

        let mut saw_gauge = false;
        while let Some(Command::SendDatagram { payload, .. }) = server.next_command() {
            let text = String::from_utf8(payload).unwrap();
            if text.contains("healthy_downstreams:1|g") {
                saw_gauge = true;
            }
        }
        assert!(saw_gauge);
    }

    #[test]
    fn invalid_line_without_colon_is_dropped() {
        let mut server = Server::new(vec![spec(0, true)], "sr.h.healthy_downstreams".into());
        server.handle_datagram(b"not-a-valid-metric\n");
        server.flush_tick(Duration::from_millis(0), Instant::now() + Duration::from_secs(1));
        assert!(server.next_command().is_none());
    }
}
