//! EmberKV Server Binary
//!
//! Recovers from the AOF, then serves the RESP protocol over TCP.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use emberkv::config::FsyncPolicy;
use emberkv::network::Server;
use emberkv::{Config, Engine};
use tracing_subscriber::{fmt, EnvFilter};

/// EmberKV Server
#[derive(Parser, Debug)]
#[command(name = "emberkv-server")]
#[command(about = "Sharded in-memory key-value store with an append-only file")]
#[command(version)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:6399")]
    listen: String,

    /// Append-only file path
    #[arg(long, default_value = "appendonly.aof")]
    appendfilename: PathBuf,

    /// Fsync policy: always, everysec or no
    #[arg(long, default_value = "everysec")]
    appendfsync: FsyncPolicy,

    /// Disable the append-only file
    #[arg(long)]
    no_appendonly: bool,

    /// Start empty instead of replaying the append-only file
    #[arg(long)]
    skip_load: bool,

    /// Rewrite the AOF as a snapshot preamble instead of plain commands
    #[arg(long)]
    use_preamble: bool,

    /// Number of logical databases
    #[arg(short, long, default_value = "16")]
    databases: usize,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1000")]
    max_connections: usize,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,emberkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("EmberKV Server v{}", emberkv::VERSION);
    tracing::info!("Listen address: {}", args.listen);

    let config = Config::builder()
        .listen_addr(&args.listen)
        .append_only(!args.no_appendonly)
        .append_filename(&args.appendfilename)
        .append_fsync(args.appendfsync)
        .load_on_startup(!args.skip_load)
        .use_snapshot_preamble(args.use_preamble)
        .databases(args.databases)
        .max_connections(args.max_connections)
        .build();

    // Replay completes inside open, before the listener exists
    let engine = match Engine::open(config.clone()) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(stats) = engine.replay_stats() {
        tracing::info!(
            "Recovered {} commands ({} skipped)",
            stats.commands_replayed,
            stats.payloads_skipped
        );
    }

    let server = match Server::bind(&config, Arc::clone(&engine)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            engine.close();
            std::process::exit(1);
        }
    };

    let result = server.run();
    engine.close();

    if let Err(e) = result {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Server stopped");
}
