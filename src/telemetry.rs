//! Self-telemetry line construction (C6).
//!
//! The router describes its own forwarding behavior using the same StatsD wire format it
//! forwards, and routes those lines through the ordinary data path (see [`crate::server`]).
//! All metric *names* are built once at startup; only the counter values are formatted per
//! tick, so the hot path never allocates a name string.

use std::fmt::Write as _;

/// Per-downstream metric names, precomputed once from the configured `ping_prefix` and the
/// downstream's resolved host/port, mirroring `sr-init.c`'s `init_downstream` sprintf calls.
#[derive(Debug, Clone)]
pub struct DownstreamTelemetryNames {
    /// Full two-line `connections:1|c` block injected verbatim every tick the downstream is alive.
    pub connection_line: String,
    pub traffic_metric: String,
    pub packets_metric: String,
}

impl DownstreamTelemetryNames {
    pub fn new(ping_prefix: &str, worker_data_port: u16, host: &str, data_port: u16) -> Self {
        let metric_host = host.replace('.', "_");

        let connection_line = format!(
            "{ping_prefix}.{host}-{worker_data_port}-{metric_host}-{data_port}.connections:1|c\n\
             {ping_prefix}.{metric_host}-{data_port}.connections:1|c\n"
        );
        let traffic_metric = format!("{ping_prefix}.{metric_host}-{data_port}.traffic");
        let packets_metric = format!("{ping_prefix}.{metric_host}-{data_port}.packets");

        Self {
            connection_line,
            traffic_metric,
            packets_metric,
        }
    }
}

/// Name of the per-worker gauge reporting the live downstream count, e.g.
/// `myprefix.myhost-8126.healthy_downstreams`.
pub fn alive_gauge_name(ping_prefix: &str, hostname: &str, worker_data_port: u16) -> String {
    format!("{ping_prefix}.{hostname}-{worker_data_port}.healthy_downstreams")
}

/// Formats `<metric>:<count>|c\n`.
pub fn counter_line(metric: &str, count: u64) -> String {
    let mut line = String::with_capacity(metric.len() + 16);
    let _ = write!(line, "{metric}:{count}|c\n");
    line
}

/// Formats `<metric>:<count>|g\n`.
pub fn gauge_line(metric: &str, count: usize) -> String {
    let mut line = String::with_capacity(metric.len() + 16);
    let _ = write!(line, "{metric}:{count}|g\n");
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_line_contains_both_forms() {
        let names = DownstreamTelemetryNames::new("sr", 8126, "10.0.0.1", 8125);
        assert!(names
            .connection_line
            .contains("sr.10.0.0.1-8126-10_0_0_1-8125.connections:1|c\n"));
        assert!(names
            .connection_line
            .contains("sr.10_0_0_1-8125.connections:1|c\n"));
    }

    #[test]
    fn counter_line_formats_statsd_counter() {
        assert_eq!(counter_line("a.b.traffic", 42), "a.b.traffic:42|c\n");
    }

    #[test]
    fn gauge_line_formats_statsd_gauge() {
        assert_eq!(
            gauge_line("sr.host-8126.healthy_downstreams", 3),
            "sr.host-8126.healthy_downstreams:3|g\n"
        );
    }
}
