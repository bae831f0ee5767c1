//! Configuration file loading and validation (C8).
//!
//! The file format is the same flat `key=value`-per-line layout `sr-init.c`'s
//! `process_config_line` parses: blank lines and `#`-prefixed lines are ignored, unknown keys
//! are logged and skipped rather than rejected outright.

use crate::downstream::AliveFlag;
use crate::errors::ConfigError;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// One configured downstream, already resolved to concrete socket addresses.
///
/// Carries its own [`AliveFlag`], created once at config-load time so every worker's
/// [`crate::server::Server`] and the shared health-check task (see `health.rs`) clone the same
/// handle rather than looking one up by address.
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    pub host: String,
    pub data_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub alive: AliveFlag,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_port: u16,
    pub control_port: u16,
    pub threads_num: usize,
    pub flush_interval: Duration,
    pub health_check_interval: Duration,
    pub ping_interval: Duration,
    pub ping_prefix: String,
    pub log_level: LevelFilter,
    pub downstreams: Vec<DownstreamConfig>,
}

impl Config {
    /// Loads and validates the config file at `path`. Does not touch rlimits; call
    /// [`Config::fd_budget`] separately once the config is known to be well-formed, so callers
    /// can choose whether a low budget is fatal.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut builder = RawConfig::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(line, "ignoring malformed config line");
                continue;
            };

            builder.set(key.trim(), value.trim())?;
        }

        builder.finish()
    }

    /// Computes `floor((rlimit - 3 - 1 - downstreams - workers) / workers)`, the number of
    /// egress sockets each worker could afford if it dedicated one per downstream (see
    /// SPEC_FULL.md §5). This implementation always uses exactly one egress socket per worker
    /// regardless of the result, so the computation here is solely a startup admission check:
    /// if the budget would be negative, the configured topology cannot fit the process's file
    /// descriptor limit at all and startup should fail fast.
    pub fn fd_budget(&self, rlimit_cur: u64) -> Result<i64, ConfigError> {
        let downstreams = self.downstreams.len() as i64;
        let workers = self.threads_num as i64;

        let budget = (rlimit_cur as i64 - 3 - 1 - downstreams - workers) / workers.max(1);

        if budget < 1 {
            return Err(ConfigError::FdBudgetExhausted {
                rlimit: rlimit_cur,
                downstreams: self.downstreams.len(),
                workers: self.threads_num,
            });
        }

        Ok(budget)
    }
}

#[derive(Default)]
struct RawConfig {
    data_port: Option<u16>,
    control_port: Option<u16>,
    threads_num: Option<usize>,
    flush_interval: Option<f64>,
    health_check_interval: Option<f64>,
    ping_interval: Option<f64>,
    ping_prefix: Option<String>,
    log_level: Option<LevelFilter>,
    downstream: Option<String>,
}

impl RawConfig {
    fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "data_port" => self.data_port = Some(parse_value(key, value)?),
            "control_port" => self.control_port = Some(parse_value(key, value)?),
            "threads_num" => self.threads_num = Some(parse_value(key, value)?),
            "downstream_flush_interval" => self.flush_interval = Some(parse_value(key, value)?),
            "downstream_health_check_interval" => {
                self.health_check_interval = Some(parse_value(key, value)?)
            }
            "downstream_ping_interval" => self.ping_interval = Some(parse_value(key, value)?),
            "ping_prefix" => self.ping_prefix = Some(value.to_string()),
            "log_level" => self.log_level = Some(parse_log_level(value)?),
            "downstream" => self.downstream = Some(value.to_string()),
            _ => tracing::debug!(key, "ignoring unrecognized config key"),
        }

        Ok(())
    }

    fn finish(self) -> Result<Config, ConfigError> {
        let data_port = self.data_port.ok_or(ConfigError::MissingKey("data_port"))?;
        let control_port = self
            .control_port
            .ok_or(ConfigError::MissingKey("control_port"))?;
        let flush_interval = positive_duration(
            "downstream_flush_interval",
            self.flush_interval
                .ok_or(ConfigError::MissingKey("downstream_flush_interval"))?,
        )?;
        let health_check_interval = positive_duration(
            "downstream_health_check_interval",
            self.health_check_interval
                .ok_or(ConfigError::MissingKey("downstream_health_check_interval"))?,
        )?;
        let ping_interval = positive_duration(
            "downstream_ping_interval",
            self.ping_interval
                .ok_or(ConfigError::MissingKey("downstream_ping_interval"))?,
        )?;
        let ping_prefix = self
            .ping_prefix
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingKey("ping_prefix"))?;
        let downstream_str = self
            .downstream
            .ok_or(ConfigError::MissingKey("downstream"))?;

        let threads_num = self.threads_num.unwrap_or(1);
        if threads_num < 1 {
            return Err(ConfigError::InvalidValue {
                key: "threads_num",
                value: threads_num.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if data_port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "data_port",
                value: "0".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if control_port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "control_port",
                value: "0".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        let downstreams = parse_downstreams(&downstream_str)?;
        if downstreams.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "downstream",
                value: downstream_str,
                reason: "must list at least one downstream".to_string(),
            });
        }

        Ok(Config {
            data_port,
            control_port,
            threads_num,
            flush_interval,
            health_check_interval,
            ping_interval,
            ping_prefix,
            log_level: self.log_level.unwrap_or(LevelFilter::INFO),
            downstreams,
        })
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: format!("not a valid {}", std::any::type_name::<T>()),
    })
}

fn positive_duration(key: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    if !(secs > 0.0) {
        return Err(ConfigError::InvalidValue {
            key,
            value: secs.to_string(),
            reason: "must be a positive number of seconds".to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_log_level(value: &str) -> Result<LevelFilter, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        other => Err(ConfigError::InvalidValue {
            key: "log_level",
            value: other.to_string(),
            reason: "expected one of trace, debug, info, warn, error".to_string(),
        }),
    }
}

/// Parses `host:data_port:health_port,host:data_port:health_port,...`, resolving each host
/// once via the standard library resolver. Hostname resolution is treated as an external
/// concern: everything downstream of this function only ever sees resolved [`SocketAddr`]s.
fn parse_downstreams(raw: &str) -> Result<Vec<DownstreamConfig>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_one_downstream)
        .collect()
}

fn parse_one_downstream(entry: &str) -> Result<DownstreamConfig, ConfigError> {
    let mut parts = entry.splitn(3, ':');
    let (Some(host), Some(data_port), Some(health_port)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(ConfigError::MalformedDownstream(entry.to_string()));
    };

    let data_port: u16 = data_port
        .parse()
        .map_err(|_| ConfigError::MalformedDownstream(entry.to_string()))?;
    let health_port: u16 = health_port
        .parse()
        .map_err(|_| ConfigError::MalformedDownstream(entry.to_string()))?;

    let data_addr = resolve_one(host, data_port)?;
    let health_addr = resolve_one(host, health_port)?;

    Ok(DownstreamConfig {
        host: host.to_string(),
        data_addr,
        health_addr,
        // A downstream is presumed down until its first health probe succeeds, so routing
        // never picks an unchecked destination during the brief startup window.
        alive: AliveFlag::new(false),
    })
}

fn resolve_one(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| ConfigError::Resolve {
            host: host.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ConfigError::NoAddress {
            host: host.to_string(),
        })
}
