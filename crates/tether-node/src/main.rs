//! Tether Node - runs the reactor with optional workers and clustering.
//!
//! The node serves a small echo protocol on `--listen` and registers a
//! `ping` op-code so that master, workers and cluster peers can be checked
//! with each other's IPC.

mod echo;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tether_core::{
    Address, CallArgs, ListenOptions, OpcodeHandlers, Reactor, Repeat, Stage, TetherConfig,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Op-code answered by every process with its pid.
const PING: u32 = 1;

#[derive(Parser, Debug)]
#[command(name = "tether-node")]
#[command(about = "Evented reactor node with worker processes and cluster IPC")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker processes (0 = single process, negative = cores / n)
    #[arg(short, long, allow_hyphen_values = true)]
    workers: Option<i16>,

    /// Address for master/worker links (unix:// or tcp://)
    #[arg(long)]
    ipc_url: Option<String>,

    /// Cluster discovery port
    #[arg(long)]
    cluster_port: Option<u16>,

    /// Echo service address
    #[arg(short, long)]
    listen: Option<String>,

    /// Seconds between pings from every worker (0 disables)
    #[arg(long, default_value = "0")]
    ping_every: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = build_config(&args)?;
    info!(
        "Starting Tether node ({} workers, cluster {:?})",
        config.worker_count(),
        config.cluster_port
    );

    let mut reactor = Reactor::new(config).context("creating reactor")?;
    reactor.opcode_register(
        PING,
        OpcodeHandlers::new(|r, msg| {
            let pid = r.pid().to_string();
            if let Err(e) = r.reply(msg, pid.into_bytes(), true) {
                warn!("Ping reply failed: {}", e);
            }
        })
        .on_done(|_, reply| {
            info!(
                "Pong from pid {}",
                String::from_utf8_lossy(reply.payload())
            );
        }),
    )?;

    if let Some(listen) = &args.listen {
        let address = Address::parse(listen)?;
        reactor.listen(
            &address,
            echo::protocol(Duration::from_secs(30)),
            ListenOptions::default(),
        )?;
    }

    if args.ping_every > 0 {
        let every = Duration::from_secs(args.ping_every);
        reactor.on_stage(Stage::OnStart, move |r| {
            if r.is_master() && r.workers() > 0 {
                return;
            }
            r.run_every(
                every,
                Repeat::Forever,
                |r| {
                    if let Err(e) = r.call(CallArgs::opcode(PING).to_workers().to_cluster()) {
                        warn!("Ping failed: {}", e);
                    }
                    true
                },
                None,
            );
        });
    }

    reactor.start()?;
    info!("Tether node (pid {}) exited", std::process::id());
    Ok(())
}

/// Defaults, then the config file, then the environment, then the command
/// line.
fn build_config(args: &Args) -> Result<TetherConfig> {
    let config = match &args.config {
        Some(path) => TetherConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TetherConfig::default(),
    };
    let mut config = config.apply_env()?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(url) = &args.ipc_url {
        config.ipc_url = Some(url.clone());
    }
    if let Some(port) = args.cluster_port {
        config.cluster_port = Some(port);
    }
    config.validate()?;
    Ok(config)
}
