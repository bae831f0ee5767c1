//! The IO shell driving one worker's event loop (C7).
//!
//! Each worker is a single-threaded cooperative event loop, the way the original bound one
//! `libev` loop per OS thread: no `.await` point here ever yields control except at the top of
//! the loop (waiting on `tokio::select!`) or while actually performing a send. All of the
//! decision-making (routing, buffering, back-pressure) lives in the sans-IO [`crate::server::Server`];
//! this module only performs the I/O that `Server` asks for.

use crate::config::Config;
use crate::server::{Command, DownstreamSpec, Server};
use crate::telemetry;
use anyhow::{Context, Result};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;

const MAX_DATAGRAM_SIZE: usize = 4096;

/// Binds a UDP socket with `SO_REUSEPORT` (where supported) so the kernel load-balances
/// ingress datagrams across every worker bound to the same port.
fn bind_reuseport(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, None).context("failed to create socket")?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {addr}"))?;

    UdpSocket::from_std(socket.into()).context("failed to hand socket to tokio")
}

/// Runs one worker to completion (never returns under normal operation). `worker_id` is used
/// only to disambiguate the self-telemetry gauge name (§4.6/§12), mirroring the original's
/// `data_port + k` naming trick for distinguishing workers sharing one ingress port.
pub async fn run(worker_id: usize, config: &Config, hostname: &str) -> Result<()> {
    let ingress_addr: SocketAddr = format!("0.0.0.0:{}", config.data_port).parse().unwrap();
    let ingress = bind_reuseport(ingress_addr)
        .with_context(|| format!("worker {worker_id}: failed to bind ingress socket"))?;
    let egress = UdpSocket::bind("0.0.0.0:0")
        .await
        .with_context(|| format!("worker {worker_id}: failed to bind egress socket"))?;

    let mut server = build_server(worker_id, config, hostname);

    let mut flush_ticker = tokio::time::interval(config.flush_interval);
    let mut ping_ticker = tokio::time::interval(config.ping_interval);
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    tracing::info!(worker_id, %ingress_addr, "worker listening");

    loop {
        tokio::select! {
            _ = flush_ticker.tick() => {
                server.flush_tick(config.flush_interval, Instant::now());
            }
            _ = ping_ticker.tick() => {
                server.ping_tick();
            }
            received = ingress.recv_from(&mut buf) => {
                match received {
                    Ok((len, _sender)) => server.handle_datagram(&buf[..len]),
                    Err(e) => tracing::warn!(worker_id, error = %e, "recv_from failed"),
                }
            }
        }

        while let Some(command) = server.next_command() {
            match command {
                Command::SendDatagram { addr, payload } => {
                    let downstream_id = find_downstream_id(&server, addr);
                    if let Err(e) = egress.send_to(&payload, addr).await {
                        tracing::warn!(worker_id, %addr, error = %e, "sendto() failed");
                    }
                    if let Some(id) = downstream_id {
                        server.on_sent(id, Instant::now());
                    }
                }
            }
        }
    }
}

/// The `Command::SendDatagram` carries the destination address but not the downstream index
/// (the IO shell has no business knowing ring internals); this small linear scan over a
/// handful of downstreams recovers it so [`Server::on_sent`] can advance the right ring.
fn find_downstream_id(server: &Server, addr: SocketAddr) -> Option<usize> {
    (0..server.downstream_count()).find(|&id| server.downstream_data_addr(id) == addr)
}

fn build_server(worker_id: usize, config: &Config, hostname: &str) -> Server {
    let worker_data_port = config.data_port + worker_id as u16;

    let specs = config
        .downstreams
        .iter()
        .map(|ds| DownstreamSpec {
            data_addr: ds.data_addr,
            health_addr: ds.health_addr,
            alive: ds.alive.clone(),
            telemetry: telemetry::DownstreamTelemetryNames::new(
                &config.ping_prefix,
                worker_data_port,
                &ds.host,
                ds.data_addr.port(),
            ),
        })
        .collect();

    let alive_gauge_name = telemetry::alive_gauge_name(&config.ping_prefix, hostname, worker_data_port);

    Server::new(specs, alive_gauge_name)
}
