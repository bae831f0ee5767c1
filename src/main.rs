//! Process entry point (C10): loads the config, checks the file-descriptor budget, spawns the
//! shared health-check tasks, the control server, and one OS thread per worker, then waits for
//! a shutdown signal.

use anyhow::{Context, Result};
use clap::Parser;
use statsd_router::config::Config;
use statsd_router::{control, health, worker};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Stateless UDP router for StatsD-style metrics.
#[derive(Parser)]
#[command(name = "statsd-router")]
struct Cli {
    /// Path to the router's config file.
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(config.log_level.into())
                .from_env_lossy(),
        )
        .init();

    let rlimit_cur = rlimit::getrlimit(rlimit::Resource::NOFILE)
        .context("failed to read the process file descriptor limit")?
        .0;
    config
        .fd_budget(rlimit_cur)
        .context("file descriptor budget check failed")?;

    let hostname = gethostname::gethostname().to_string_lossy().into_owned();

    let control_listener = TcpListener::bind(("0.0.0.0", config.control_port))
        .await
        .with_context(|| format!("failed to bind control port {}", config.control_port))?;
    tokio::spawn(async move {
        if let Err(e) = control::serve(control_listener).await {
            tracing::error!(error = %e, "control server exited with error");
        }
    });

    for (id, ds) in config.downstreams.iter().enumerate() {
        let health_addr = ds.health_addr;
        let alive = ds.alive.clone();
        let interval = config.health_check_interval;
        tokio::spawn(async move {
            health::run(id, health_addr, alive, interval).await;
        });
    }

    let mut worker_threads = Vec::with_capacity(config.threads_num);
    for worker_id in 0..config.threads_num {
        let config = config.clone();
        let hostname = hostname.clone();

        let handle = std::thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build worker runtime");

                if let Err(e) = rt.block_on(worker::run(worker_id, &config, &hostname)) {
                    tracing::error!(worker_id, error = %e, "worker exited with error");
                }
            })
            .with_context(|| format!("failed to spawn worker {worker_id}"))?;

        worker_threads.push(handle);
    }

    tracing::info!(
        threads_num = config.threads_num,
        downstreams = config.downstreams.len(),
        data_port = config.data_port,
        control_port = config.control_port,
        "statsd-router started"
    );

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received, exiting");

    Ok(())
}

/// Waits for Ctrl-C or, on Unix, SIGTERM. SIGHUP is logged and otherwise ignored: this router
/// never reloads its configuration at runtime (see SPEC_FULL.md §11).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return,
                _ = sigterm.recv() => return,
                _ = sighup.recv() => {
                    tracing::info!("received SIGHUP; configuration reload is not supported, ignoring");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
