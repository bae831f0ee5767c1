//! TCP health checking (C5).
//!
//! One task per downstream, shared across workers: every `health_check_interval` it opens a
//! fresh TCP connection, sends the literal request `health`, and expects a response beginning
//! with `health: up\n`. `tokio::time::timeout` replaces the original's explicit
//! `{idle, connecting, sending, reading}` state machine — whatever probe hasn't finished by the
//! next tick is cancelled and the downstream is marked DOWN, exactly as
//! `ds_health_check_timer_cb` did by tearing down an in-flight watcher.

use crate::downstream::AliveFlag;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const HEALTH_CHECK_REQUEST: &[u8] = b"health";
const HEALTH_CHECK_UP_RESPONSE: &[u8] = b"health: up\n";
const HEALTH_CHECK_RESPONSE_BUF_SIZE: usize = 32;

/// Runs the health-check loop for one downstream until the process shuts down.
pub async fn run(downstream_id: usize, health_addr: SocketAddr, alive: AliveFlag, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match tokio::time::timeout(interval, probe_once(health_addr)).await {
            Ok(Ok(())) => {
                if !alive.get() {
                    alive.set(true);
                    tracing::debug!(downstream_id, %health_addr, "downstream is up");
                }
            }
            Ok(Err(reason)) => {
                if alive.get() {
                    alive.set(false);
                    tracing::debug!(downstream_id, %health_addr, %reason, "downstream is down");
                } else {
                    tracing::warn!(downstream_id, %health_addr, %reason, "health probe failed");
                }
            }
            Err(_elapsed) => {
                tracing::warn!(
                    downstream_id,
                    %health_addr,
                    "previous health check request was not completed, cancelling"
                );
                alive.set(false);
            }
        }
    }
}

/// One connect+send+recv exchange. Any failure is reported as a descriptive `String` rather
/// than via a typed error, since the only thing the caller ever does with it is log it.
async fn probe_once(health_addr: SocketAddr) -> Result<(), String> {
    let mut stream = TcpStream::connect(health_addr)
        .await
        .map_err(|e| format!("connect failed: {e}"))?;

    stream
        .write_all(HEALTH_CHECK_REQUEST)
        .await
        .map_err(|e| format!("send failed: {e}"))?;

    let mut buf = [0u8; HEALTH_CHECK_RESPONSE_BUF_SIZE];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| format!("recv failed: {e}"))?;

    if n == 0 {
        return Err("connection closed by peer".to_string());
    }

    if buf[..n].starts_with(HEALTH_CHECK_UP_RESPONSE) {
        Ok(())
    } else {
        Err(format!(
            "unexpected response: {:?}",
            String::from_utf8_lossy(&buf[..n])
        ))
    }
}
