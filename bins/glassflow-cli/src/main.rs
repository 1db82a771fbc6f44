//! Pipeline runner CLI: loads a YAML `PipelineConfig`, creates it under a
//! `LocalOrchestrator`-backed `PipelineManager`, and drives it until
//! Ctrl-C — the same config-load/spawn/ctrl_c shutdown shape as the
//! teacher's `rde-cli`, generalized from one hardcoded source->sink run to
//! the manager's full create/stop lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use glassflow_bus::memory::MemoryBus;
use glassflow_bus::{KvStoreFactory, MemoryKvStoreFactory, StreamBus};
use glassflow_core::config::PipelineConfig;
use glassflow_manager::{MemoryStateStore, PipelineManager};
use glassflow_orchestrator::LocalOrchestrator;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the pipeline runner.
#[derive(Parser, Debug)]
#[command(name = "glassflow-cli")]
#[command(about = "Runs a Kafka -> (dedup) -> (join) -> ClickHouse pipeline from a YAML config")]
struct Args {
    /// Path to the pipeline YAML configuration file.
    #[arg(short, long)]
    pipeline: PathBuf,

    /// Pipeline identity to register it under; defaults to the file stem.
    #[arg(long)]
    id: Option<String>,

    /// Kafka bootstrap servers.
    #[arg(long, default_value = "localhost:9092")]
    brokers: String,

    /// ClickHouse HTTP endpoint.
    #[arg(long, default_value = "http://localhost:8123")]
    clickhouse_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let pipeline_id = args.id.clone().unwrap_or_else(|| {
        args.pipeline
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipeline".to_string())
    });

    let cfg: PipelineConfig = {
        let raw = std::fs::read_to_string(&args.pipeline).with_context(|| format!("reading {}", args.pipeline.display()))?;
        serde_yaml::from_str(&raw).context("parsing pipeline YAML")?
    };

    let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
    let kv_factory: Arc<dyn KvStoreFactory> = Arc::new(MemoryKvStoreFactory);
    let (orchestrator, failure_rx) = LocalOrchestrator::new(bus, kv_factory, args.brokers.clone(), args.clickhouse_url.clone());

    let store = Arc::new(MemoryStateStore::new());
    let manager = Arc::new(PipelineManager::new(store, Arc::new(orchestrator)));

    manager.clean_up_on_boot().await.context("clean up on boot")?;
    tokio::spawn(manager.clone().drain_failures(failure_rx));

    manager.create(pipeline_id.clone(), cfg).await.context("starting pipeline")?;
    tracing::info!(pipeline_id = %pipeline_id, "pipeline running, press Ctrl-C to stop");

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("received Ctrl-C, stopping pipeline");
    manager.stop(&pipeline_id).await.context("stopping pipeline")?;

    Ok(())
}
