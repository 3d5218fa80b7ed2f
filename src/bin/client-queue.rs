//! Inspection tool for on-disk client queues.
//!
//! `inspect` opens the journals read-only and prints per-bucket statistics.
//! It never writes to the data directory, so it is safe to point at the
//! journals of a running broker. Sweeping expired entries releases payload
//! references and is left to the broker process
//! ([`ClientQueueService::spawn_cleanup`](client_queue::core::ClientQueueService::spawn_cleanup)).

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use client_queue::config::Config;
use client_queue::core::{ClientQueuePersistence, InMemoryPayloadStore, LoggingDropService};
use client_queue::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "client-queue", version, about = "Client queue storage inspection")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long)]
    config: Option<String>,

    /// Override the data directory from the configuration.
    #[arg(long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print bucket, queue and journal statistics
    Inspect,
}

fn inspect(engine: &ClientQueuePersistence) -> anyhow::Result<()> {
    println!("{:>6} {:>8} {:>10} {:>10}", "bucket", "queues", "entries", "records");
    let mut totals = (0usize, 0usize);
    for bucket in 0..engine.bucket_count() {
        let summary = engine.bucket_summary(bucket)?;
        totals.0 += summary.queues;
        totals.1 += summary.entries;
        if summary.entries > 0 || summary.journal_records > 0 {
            println!(
                "{:>6} {:>8} {:>10} {:>10}",
                summary.index, summary.queues, summary.entries, summary.journal_records
            );
        }
    }
    println!("queues={} entries={}", totals.0, totals.1);
    println!(
        "qos0_bytes={} qos0_limit={} next_sequence={}",
        engine.governor().current(),
        engine.governor().limit(),
        engine.sequence().peek()
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir.into();
    }
    info!(data_dir = %config.data_dir.display(), "opening client queues read-only");

    // Nothing is released in read-only mode; the store is never consulted.
    let engine = ClientQueuePersistence::open_read_only(
        config,
        Arc::new(InMemoryPayloadStore::new()),
        Arc::new(LoggingDropService::new()),
    )?;
    match cli.command {
        Command::Inspect => inspect(&engine)?,
    }

    engine.close()?;
    Ok(())
}
