#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # shellmux
//!
//! Subshell message-routing server for a kernel communication stack.
//!
//! Binds the public shell and stdin endpoints, starts the dispatcher event
//! loop and a worker task for the default subshell, and shuts everything
//! down through the in-band `stop` control command on SIGINT/SIGTERM.
//!
//! Additional subshells are created and destroyed at runtime through the
//! control-command channel (`add_subshell`/`remove_subshell`); each gets its
//! own internal duplex channel to the dispatcher and is driven by its own
//! worker task. What a kernel context *does* with the messages it reads is
//! outside this binary — the default worker here drains its streams and logs
//! them.
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, shutdown wiring
//! config.rs      — TOML + env-var configuration
//! wire.rs        — multipart frames, shell/control/stdin routing keys
//! protocol.rs    — kernel-message envelope, Codec seam
//! transport/
//!   framing.rs   — length-delimited multipart codec over TCP
//!   router.rs    — public endpoints with identity-routed replies
//!   duplex.rs    — in-process dispatcher<->worker channels
//! dispatch/
//!   mod.rs       — ShellDispatcher, subshell pool, control-command protocol
//! subshell/
//!   mod.rs       — SubshellWorker, FIFO queues, stdin round-trip
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info};

use shellmux::{
    Config, JsonCodec, ShellDispatcher, SubChannel, SubshellRegistry, SubshellWorker, WireMessage,
};

/// Subshell message-routing server for a kernel communication stack.
#[derive(Parser)]
#[command(name = "shellmux", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the routing server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("shellmux v{} starting", env!("CARGO_PKG_VERSION"));

    let codec = Arc::new(JsonCodec);

    // Outward publication channel. No IOPub machinery is wired in this
    // binary, so publications are drained and logged.
    let (iopub_tx, mut iopub_rx) = mpsc::unbounded_channel::<WireMessage>();
    let iopub_task = tokio::spawn(async move {
        while let Some(msg) = iopub_rx.recv().await {
            debug!(frames = msg.len(), "publication drained");
        }
    });

    let registry = SubshellRegistry::new(iopub_tx);
    let (mut dispatcher, mut control) = ShellDispatcher::bind(
        &config.server.ip,
        config.server.shell_port,
        config.server.stdin_port,
        registry.clone(),
        codec.clone(),
    )
    .await
    .expect("Failed to bind public endpoints");

    info!(
        "Listening on {}: shell={}, stdin={}",
        config.server.ip,
        dispatcher.shell_port(),
        dispatcher.stdin_port()
    );

    // Default subshell worker: drain streams until the stop broadcast.
    let poll_interval = Duration::from_millis(config.server.poll_interval_ms);
    let mut worker = SubshellWorker::connect(&registry, "", codec)
        .await
        .expect("Default subshell link missing");
    let worker_task = tokio::spawn(async move {
        loop {
            match worker.poll_channels(poll_interval).await {
                Some(SubChannel::Control) => {
                    if worker.read_controller().as_deref() == Some("stop") {
                        info!("default subshell received stop");
                        break;
                    }
                }
                Some(SubChannel::Shell) => {
                    if let Some(msg) = worker.read_shell() {
                        info!(msg_type = %msg.header.msg_type, "shell message received");
                    }
                }
                // A timeout means keep polling; a dead channel means the
                // dispatcher is gone and this task must wind down too.
                None => {
                    if worker.is_closed() {
                        info!("default subshell channel closed");
                        break;
                    }
                }
            }
        }
    });

    let dispatch_task = tokio::spawn(async move {
        dispatcher.run().await;
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };
    shutdown.await;

    info!("Shutting down...");
    let _ = control
        .request(WireMessage::from_str_frames(&["stop"]))
        .await;
    dispatch_task.await.ok();
    worker_task.await.ok();
    iopub_task.abort();
    info!("Goodbye");
}
