//! Demonstration binary: connects to a PostgreSQL logical replication slot
//! and prints each change event's envelope to stdout as JSON.
//!
//! Grounded on the source checker's `main.rs` (`tracing_subscriber`
//! `EnvFilter` setup, `spawn_blocking` bridge, ctrl-c driven shutdown),
//! rewired onto [`pgoutput_cdc::LogicalReplicationReader`] instead of the
//! source crate's `ReplicationServer`/`EventSink` pipeline.

use anyhow::Result;
use clap::Parser;
use pgoutput_cdc::{JsonIndent, ReplicationConfig, load_config_from_env};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "cdc-reader",
    about = "Streams PostgreSQL logical replication changes as CDC envelopes",
    version
)]
struct Args {
    /// Database host; falls back to DATABASE_URL/PGHOST if omitted.
    #[arg(long)]
    host: Option<String>,

    /// Database port; falls back to DATABASE_URL/PGPORT if omitted.
    #[arg(long)]
    port: Option<u16>,

    /// Database name; falls back to DATABASE_URL/PGDATABASE if omitted.
    #[arg(long)]
    database: Option<String>,

    /// Database user; falls back to DATABASE_URL/PGUSER if omitted.
    #[arg(long)]
    user: Option<String>,

    /// Replication slot name; defaults to SLOT_NAME env var, then "sub".
    #[arg(long)]
    slot: Option<String>,

    /// Publication name; defaults to PUB_NAME env var, then "pub".
    #[arg(long)]
    publication: Option<String>,

    /// Disable auto-acknowledge; the demo will acknowledge after printing
    /// each envelope instead.
    #[arg(long)]
    manual_ack: bool,

    /// JSON indent width for printed envelopes (0 = compact).
    #[arg(long, default_value_t = 2)]
    indent: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    info!(
        slot = %config.slot_name,
        publication = %config.publication_name,
        "starting logical replication reader"
    );

    let mut reader = pgoutput_cdc::LogicalReplicationReader::connect(config).await?;
    let indent = if args.indent == 0 {
        JsonIndent::Compact
    } else {
        JsonIndent::Spaces(args.indent)
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, stopping reader");
                reader.stop().await;
                break;
            }
            result = reader.recv() => {
                match result {
                    Ok(Some(envelope)) => {
                        match envelope.to_json(indent) {
                            Ok(json) => println!("{json}"),
                            Err(err) => warn!(error = %err, "failed to serialise envelope"),
                        }
                        if args.manual_ack {
                            if let Err(err) = reader.acknowledge() {
                                warn!(error = %err, "acknowledge failed");
                            }
                        }
                    }
                    Ok(None) => {
                        // Keepalive tick; nothing to print.
                    }
                    Err(err) => {
                        error!(error = %err, "reader stream ended");
                        break;
                    }
                }
            }
        }
    }

    info!("reader shut down");
    Ok(())
}

fn build_config(args: &Args) -> Result<ReplicationConfig> {
    let config = match load_config_from_env() {
        Ok(config) => config,
        Err(err) => {
            let host = args
                .host
                .clone()
                .ok_or_else(|| anyhow::anyhow!("missing --host and no DATABASE_URL/PGHOST set ({err})"))?;
            let database = args
                .database
                .clone()
                .ok_or_else(|| anyhow::anyhow!("missing --database and no DATABASE_URL/PGDATABASE set"))?;
            let user = args
                .user
                .clone()
                .ok_or_else(|| anyhow::anyhow!("missing --user and no DATABASE_URL/PGUSER set"))?;
            ReplicationConfig::new(
                host,
                args.port.unwrap_or(5432),
                database,
                user,
                std::env::var("PGPASSWORD").ok(),
                args.slot.clone().unwrap_or_else(|| "sub".to_string()),
                args.publication.clone().unwrap_or_else(|| "pub".to_string()),
            )?
        }
    };

    Ok(config.with_auto_acknowledge(!args.manual_ack))
}
