//! The local pipeline orchestrator (§4.2): assembles a DAG of runners from a
//! `PipelineConfig`, provisions the bus streams and KV buffers it needs, and
//! drives Ingestor/Joiner/Sink runner lifecycles with startup rollback.
//!
//! Grounded on the teacher's `rde-cli::main` task-spawning shape (per-operator
//! `cancel.child_token()`, a `Vec` of join handles, Ctrl-C-driven shutdown),
//! generalized from one fixed source→transform→sink chain into a DAG
//! assembled from config and supervised for runtime (not just shutdown)
//! failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use glassflow_bus::dlq;
use glassflow_bus::{KvStore, KvStoreFactory, StreamBus};
use glassflow_core::config::{PipelineConfig, TableMapping};
use glassflow_core::model::{ComponentKind, ComponentState, ComponentStatus, Pipeline};
use glassflow_core::orchestrator::Orchestrator;
use glassflow_core::{CoreError, PipelineFailure, Runner, SchemaMapper};
use glassflow_ingest::{IngestorConfig, IngestorRunner};
use glassflow_join::{JoinerConfig, JoinerRunner};
use glassflow_sink::{SinkConfig, SinkRunner};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bounded grace for detecting a runner that fails during startup, before
/// the orchestrator decides it has started successfully (§5: "5s for
/// startup rollback").
const STARTUP_GRACE: Duration = Duration::from_secs(5);
/// Bounded grace for a graceful pipeline shutdown before force-terminating
/// a runner (§5: "default 30s for pipeline shutdown").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
/// DLQ channel buffer; generous enough that a burst of per-record faults
/// across every component of one pipeline never blocks a runner on send.
const DLQ_CHANNEL_CAPACITY: usize = 1024;

struct RunningPipeline {
    cancel: CancellationToken,
    runners: Vec<(ComponentKind, AbortHandle, oneshot::Receiver<()>)>,
    statuses: Arc<Mutex<HashMap<String, ComponentStatus>>>,
}

/// The local, in-process `Orchestrator` (§9 "Polymorphic orchestrator"):
/// one pipeline's runners live entirely inside this process, supervised by
/// Tokio tasks this orchestrator owns exclusively.
pub struct LocalOrchestrator {
    bus: Arc<dyn StreamBus>,
    kv_factory: Arc<dyn KvStoreFactory>,
    brokers: String,
    clickhouse_url: String,
    failure_tx: mpsc::UnboundedSender<PipelineFailure>,
    pipelines: Mutex<HashMap<String, RunningPipeline>>,
}

impl LocalOrchestrator {
    /// Builds the orchestrator and returns the receiver half of its runtime
    /// failure channel (§7): the manager drains this to learn when a
    /// component it cannot self-heal has failed, and marks the owning
    /// pipeline `Failed`.
    pub fn new(
        bus: Arc<dyn StreamBus>,
        kv_factory: Arc<dyn KvStoreFactory>,
        brokers: String,
        clickhouse_url: String,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineFailure>) {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        (
            Self {
                bus,
                kv_factory,
                brokers,
                clickhouse_url,
                failure_tx,
                pipelines: Mutex::new(HashMap::new()),
            },
            failure_rx,
        )
    }

    /// §4.2 steps 1-5: provisions bus/KV resources, computes the start
    /// order, and brings up every runner — rolling back already-started
    /// runners on the first failure.
    async fn assemble_and_start(&self, pipeline: &Pipeline) -> Result<RunningPipeline, CoreError> {
        let cfg = &pipeline.config;
        let pipeline_id = pipeline.id.clone();

        let dlq_channel = dlq::start(self.bus.clone(), DLQ_CHANNEL_CAPACITY);

        for source in &cfg.sources {
            let ttl = source
                .dedup
                .as_ref()
                .filter(|d| d.enabled)
                .map(|d| d.time_window.as_duration())
                .unwrap_or(Duration::from_secs(0));
            self.bus
                .ensure_stream(&source.output_stream_id(&pipeline_id), ttl)
                .await
                .map_err(|e| CoreError::ComponentStartupFailed(e.to_string()))?;
        }

        let (left_buffer, right_buffer) = match &cfg.join {
            Some(join) => {
                let left = join.left();
                let right = join.right();
                let window = left.time_window.as_duration().max(right.time_window.as_duration());
                self.bus
                    .ensure_stream(&join.output_stream_id(&pipeline_id), window)
                    .await
                    .map_err(|e| CoreError::ComponentStartupFailed(e.to_string()))?;
                let left_buf = self.kv_factory.create(&format!("{pipeline_id}-{}-buf", left.source_id));
                let right_buf = self.kv_factory.create(&format!("{pipeline_id}-{}-buf", right.source_id));
                (Some(left_buf), Some(right_buf))
            }
            None => (None, None),
        };

        let start_order = build_start_order(cfg)?;

        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let mut runners = Vec::with_capacity(start_order.len());

        for kind in &start_order {
            let runner = self.build_runner(kind, cfg, &pipeline_id, dlq_channel.clone(), left_buffer.clone(), right_buffer.clone())?;
            match self
                .spawn_runner(kind.clone(), runner, cancel.child_token(), statuses.clone(), pipeline_id.clone())
                .await
            {
                Ok(entry) => runners.push(entry),
                Err(e) => {
                    warn!(pipeline_id = %pipeline_id, component = %kind.label(), error = %e, "component startup failed, rolling back");
                    cancel.cancel();
                    for (rolled_kind, abort, done_rx) in runners {
                        if tokio::time::timeout(STARTUP_GRACE, done_rx).await.is_err() {
                            warn!(pipeline_id = %pipeline_id, component = %rolled_kind.label(), "rollback grace exceeded, aborting");
                            abort.abort();
                        }
                    }
                    return Err(CoreError::ComponentStartupFailed(format!("{}: {e}", kind.label())));
                }
            }
        }

        info!(pipeline_id = %pipeline_id, components = start_order.len(), "pipeline started");
        Ok(RunningPipeline { cancel, runners, statuses })
    }

    fn build_runner(
        &self,
        kind: &ComponentKind,
        cfg: &PipelineConfig,
        pipeline_id: &str,
        dlq_channel: dlq::DlqChannel,
        left_buffer: Option<Arc<dyn KvStore>>,
        right_buffer: Option<Arc<dyn KvStore>>,
    ) -> Result<Box<dyn Runner>, CoreError> {
        match kind {
            ComponentKind::Sink => {
                let sink_cfg = SinkConfig {
                    pipeline_id: pipeline_id.to_string(),
                    input_stream_id: cfg.sink.stream_id.clone(),
                    group_id: format!("{pipeline_id}-sink"),
                    batch: cfg.sink.batch.clone(),
                    clickhouse: cfg.sink.clickhouse.clone(),
                    clickhouse_url: self.clickhouse_url.clone(),
                };
                Ok(Box::new(SinkRunner::new(
                    sink_cfg,
                    self.bus.clone(),
                    cfg.sink.table_mapping.clone(),
                    dlq_channel,
                )))
            }
            ComponentKind::Joiner => {
                let join = cfg
                    .join
                    .as_ref()
                    .ok_or_else(|| CoreError::InvalidConfig("joiner requested without a join spec".to_string()))?;
                let left = join.left();
                let right = join.right();
                let window_ttl = left.time_window.as_duration().max(right.time_window.as_duration());
                let mapper = SchemaMapper::new(Some(join.clone()), cfg.sink.table_mapping.clone());
                let mapping_for_join: Vec<TableMapping> = mapper.mapping_for_join().into_iter().cloned().collect();
                let joiner_cfg = JoinerConfig {
                    pipeline_id: pipeline_id.to_string(),
                    left_stream_id: left.stream_id.clone(),
                    right_stream_id: right.stream_id.clone(),
                    left_source_id: left.source_id.clone(),
                    right_source_id: right.source_id.clone(),
                    left_key: left.join_key.clone(),
                    right_key: right.join_key.clone(),
                    window_ttl,
                    output_stream_id: join.output_stream_id(pipeline_id),
                    group_id: format!("{pipeline_id}-joiner"),
                    sweep_interval: Duration::ZERO,
                }
                .with_default_sweep();
                let left_buffer = left_buffer.ok_or_else(|| CoreError::ComponentStartupFailed("join enabled but left buffer not provisioned".to_string()))?;
                let right_buffer = right_buffer.ok_or_else(|| CoreError::ComponentStartupFailed("join enabled but right buffer not provisioned".to_string()))?;
                Ok(Box::new(JoinerRunner::new(
                    joiner_cfg,
                    self.bus.clone(),
                    left_buffer,
                    right_buffer,
                    mapping_for_join,
                    dlq_channel,
                )))
            }
            ComponentKind::Ingestor { source_id } => {
                let source = cfg
                    .sources
                    .iter()
                    .find(|s| &s.id == source_id)
                    .ok_or_else(|| CoreError::InvalidConfig(format!("unknown source id: {source_id}")))?
                    .clone();
                let ingest_cfg = IngestorConfig {
                    pipeline_id: pipeline_id.to_string(),
                    brokers: self.brokers.clone(),
                    source,
                };
                Ok(Box::new(IngestorRunner::new(ingest_cfg, self.bus.clone(), dlq_channel)))
            }
        }
    }

    /// Spawns one runner, races its first `STARTUP_GRACE` against an early
    /// failure, and — once past that window — hands its completion off to
    /// a watcher that updates `statuses` and reports unrecoverable runtime
    /// failures on the orchestrator's failure channel (§7).
    async fn spawn_runner(
        &self,
        kind: ComponentKind,
        mut runner: Box<dyn Runner>,
        cancel: CancellationToken,
        statuses: Arc<Mutex<HashMap<String, ComponentStatus>>>,
        pipeline_id: String,
    ) -> Result<(ComponentKind, AbortHandle, oneshot::Receiver<()>), CoreError> {
        let label = kind.label();
        let mut handle = tokio::spawn(async move { runner.run(cancel).await });

        let raced = tokio::select! {
            res = &mut handle => Some(res),
            _ = tokio::time::sleep(STARTUP_GRACE) => None,
        };
        if let Some(outcome) = &raced {
            if let Some(detail) = startup_failure_detail(outcome) {
                return Err(CoreError::ComponentStartupFailed(detail));
            }
        }

        statuses.lock().await.insert(
            label.clone(),
            ComponentStatus {
                component: kind.clone(),
                state: ComponentState::Running,
                last_error: None,
                updated_at: Utc::now(),
            },
        );

        let abort = handle.abort_handle();
        let (done_tx, done_rx) = oneshot::channel();
        let failure_tx = self.failure_tx.clone();
        let watcher_statuses = statuses.clone();
        let watcher_kind = kind.clone();
        let watcher_label = label.clone();

        tokio::spawn(async move {
            let result = handle.await;
            let (state, last_error) = match result {
                Ok(Ok(())) => (ComponentState::Stopped, None),
                Ok(Err(e)) => (ComponentState::Failed, Some(e.to_string())),
                Err(join_err) => (ComponentState::Failed, Some(format!("panicked: {join_err}"))),
            };
            let failed = matches!(state, ComponentState::Failed);
            watcher_statuses.lock().await.insert(
                watcher_label,
                ComponentStatus {
                    component: watcher_kind,
                    state,
                    last_error: last_error.clone(),
                    updated_at: Utc::now(),
                },
            );
            let _ = done_tx.send(());
            if failed {
                let _ = failure_tx.send(PipelineFailure {
                    pipeline_id,
                    detail: last_error.unwrap_or_default(),
                });
            }
        });

        Ok((kind, abort, done_rx))
    }

    async fn stop_internal(&self, pipeline_id: &str) -> Result<(), CoreError> {
        let running = self.pipelines.lock().await.remove(pipeline_id);
        let Some(running) = running else {
            // Idempotent: nothing running for this pipeline is a no-op, not
            // an error (§8 "repeated Stop ... is a no-op").
            return Ok(());
        };
        running.cancel.cancel();
        for (kind, abort, done_rx) in running.runners {
            if tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await.is_err() {
                warn!(pipeline_id, component = %kind.label(), "runner did not stop within grace period, force-terminating");
                abort.abort();
            }
        }
        Ok(())
    }
}

fn startup_failure_detail(outcome: &Result<Result<(), CoreError>, tokio::task::JoinError>) -> Option<String> {
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(join_err) => Some(format!("panicked: {join_err}")),
    }
}

/// Builds the component DAG and returns runners in start order: Sink →
/// (Joiner) → Ingestors (§4.2 step 4, "downstream consumers must be ready
/// to accept before producers publish"). The graph's own edges point in the
/// data-flow direction (ingestor → joiner → sink); start order is the
/// reverse of its topological order.
fn build_start_order(cfg: &PipelineConfig) -> Result<Vec<ComponentKind>, CoreError> {
    let mut graph = DiGraph::<ComponentKind, ()>::new();

    let sink_node = graph.add_node(ComponentKind::Sink);
    let terminal_node = if cfg.join.is_some() {
        let joiner_node = graph.add_node(ComponentKind::Joiner);
        graph.add_edge(joiner_node, sink_node, ());
        joiner_node
    } else {
        sink_node
    };

    for source in &cfg.sources {
        let node = graph.add_node(ComponentKind::Ingestor { source_id: source.id.clone() });
        graph.add_edge(node, terminal_node, ());
    }

    let order = toposort(&graph, None)
        .map_err(|cycle| CoreError::ComponentStartupFailed(format!("pipeline DAG has a cycle at node {:?}", cycle.node_id())))?;

    Ok(order.into_iter().rev().map(|idx| graph[idx].clone()).collect())
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn start(&self, pipeline: &Pipeline) -> Result<(), CoreError> {
        let running = self.assemble_and_start(pipeline).await?;
        self.pipelines.lock().await.insert(pipeline.id.clone(), running);
        Ok(())
    }

    async fn stop(&self, pipeline_id: &str) -> Result<(), CoreError> {
        self.stop_internal(pipeline_id).await
    }

    async fn resume(&self, pipeline: &Pipeline) -> Result<(), CoreError> {
        self.start(pipeline).await
    }

    async fn terminate(&self, pipeline_id: &str) -> Result<(), CoreError> {
        self.stop_internal(pipeline_id).await
    }

    async fn edit(&self, pipeline: &Pipeline) -> Result<(), CoreError> {
        // The manager only calls this while the pipeline is Stopped (§4.1),
        // so there is no running DAG to drain here; validate structurally
        // and let the following Resume perform the actual (re)start.
        pipeline.config.validate().map_err(CoreError::InvalidConfig)
    }

    async fn health(&self, pipeline_id: &str) -> HashMap<String, ComponentStatus> {
        match self.pipelines.lock().await.get(pipeline_id) {
            Some(running) => running.statuses.lock().await.clone(),
            None => HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glassflow_core::config::{
        BatchConfig, ClickHouseConfig, ConsumerGroupConfig, DurationSecs, InitialOffset, JoinSource, JoinSpec, Orientation, SinkSpec, SourceConfig,
        TableMapping,
    };

    fn single_source_cfg() -> PipelineConfig {
        PipelineConfig {
            name: "p".to_string(),
            sources: vec![SourceConfig {
                id: "s1".to_string(),
                topic_name: "t1".to_string(),
                dedup: None,
                consumer_group: ConsumerGroupConfig { group_id: "g1".to_string(), initial_offset: InitialOffset::Earliest },
                replicas: 1,
            }],
            join: None,
            sink: SinkSpec {
                stream_id: "p-t1".to_string(),
                batch: BatchConfig::default(),
                clickhouse: ClickHouseConfig { database: "db".to_string(), table: "tbl".to_string(), secure: false },
                table_mapping: vec![TableMapping {
                    source_id: "s1".to_string(),
                    source_field: "id".to_string(),
                    source_type: "string".to_string(),
                    destination_column: "id".to_string(),
                    destination_type: "String".to_string(),
                }],
            },
        }
    }

    fn joined_cfg() -> PipelineConfig {
        let mut cfg = single_source_cfg();
        cfg.sources.push(SourceConfig {
            id: "s2".to_string(),
            topic_name: "t2".to_string(),
            dedup: None,
            consumer_group: ConsumerGroupConfig { group_id: "g2".to_string(), initial_offset: InitialOffset::Earliest },
            replicas: 1,
        });
        cfg.join = Some(JoinSpec {
            sources: vec![
                JoinSource {
                    source_id: "s1".to_string(),
                    stream_id: "p-t1".to_string(),
                    join_key: "id".to_string(),
                    time_window: DurationSecs(3600),
                    orientation: Orientation::Left,
                },
                JoinSource {
                    source_id: "s2".to_string(),
                    stream_id: "p-t2".to_string(),
                    join_key: "id".to_string(),
                    time_window: DurationSecs(3600),
                    orientation: Orientation::Right,
                },
            ],
            output_stream_id: None,
        });
        cfg
    }

    #[test]
    fn start_order_without_join_is_sink_then_ingestor() {
        let order = build_start_order(&single_source_cfg()).unwrap();
        assert_eq!(order, vec![ComponentKind::Sink, ComponentKind::Ingestor { source_id: "s1".to_string() }]);
    }

    #[test]
    fn start_order_with_join_is_sink_then_joiner_then_ingestors() {
        let order = build_start_order(&joined_cfg()).unwrap();
        assert_eq!(order[0], ComponentKind::Sink);
        assert_eq!(order[1], ComponentKind::Joiner);
        assert_eq!(order.len(), 4);
        assert!(order[2..].iter().all(|k| matches!(k, ComponentKind::Ingestor { .. })));
    }
}
