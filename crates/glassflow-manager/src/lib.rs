//! The Pipeline Manager (§4.1): a process-wide registry guarded by a single
//! `std::sync::Mutex` (§5 "never blocking I/O" inside its critical
//! section), driving pipelines through the §4.8 state machine and the
//! `Orchestrator` it was constructed with.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use glassflow_core::config::PipelineConfig;
use glassflow_core::model::{Health, Pipeline, PipelineStatus};
use glassflow_core::state_machine::validate_transition;
use glassflow_core::{CoreError, Orchestrator, PipelineFailure};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// The external durable store for persisted pipeline records (§6). An
/// in-process `HashMap`-backed default (`MemoryStateStore`) is provided for
/// tests and single-node use; an external implementation adopts the same
/// `pipelines/<id>` JSON shape.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, pipeline: &Pipeline) -> Result<(), CoreError>;
    async fn get(&self, id: &str) -> Result<Option<Pipeline>, CoreError>;
    async fn delete(&self, id: &str) -> Result<(), CoreError>;
    async fn list(&self) -> Result<Vec<Pipeline>, CoreError>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    pipelines: tokio::sync::Mutex<HashMap<String, Pipeline>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, pipeline: &Pipeline) -> Result<(), CoreError> {
        self.pipelines.lock().await.insert(pipeline.id.clone(), pipeline.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Pipeline>, CoreError> {
        Ok(self.pipelines.lock().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<(), CoreError> {
        self.pipelines.lock().await.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Pipeline>, CoreError> {
        Ok(self.pipelines.lock().await.values().cloned().collect())
    }
}

/// Drives every pipeline through §4.8, persists via a `StateStore`, and
/// delegates component lifecycle to an `Orchestrator`. Holds the registry
/// lock only across synchronous lookups/mutations, never across an
/// orchestrator call or a persist (§5 locking discipline).
pub struct PipelineManager {
    registry: Mutex<HashMap<String, Pipeline>>,
    store: Arc<dyn StateStore>,
    orchestrator: Arc<dyn Orchestrator>,
}

impl PipelineManager {
    pub fn new(store: Arc<dyn StateStore>, orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            store,
            orchestrator,
        }
    }

    fn snapshot(&self, id: &str) -> Result<Pipeline, CoreError> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::PipelineNotExists(id.to_string()))
    }

    fn transition(&self, id: &str, to: PipelineStatus) -> Result<Pipeline, CoreError> {
        let mut registry = self.registry.lock().expect("registry poisoned");
        let pipeline = registry.get_mut(id).ok_or_else(|| CoreError::PipelineNotExists(id.to_string()))?;
        validate_transition(pipeline.status(), to)?;
        pipeline.health.set_status(to, Utc::now());
        Ok(pipeline.clone())
    }

    fn force_set(&self, id: &str, pipeline: Pipeline) {
        self.registry.lock().expect("registry poisoned").insert(id.to_string(), pipeline);
    }

    async fn persist(&self, pipeline: &Pipeline) -> Result<(), CoreError> {
        self.store.put(pipeline).await
    }

    /// §4.1 `Create`: reserves the id, starts the orchestrator, and on
    /// success transitions straight to `Running` (the local variant never
    /// rests at `Created`). A persistence failure after a successful
    /// orchestrator start rolls the orchestrator back and evicts the
    /// reservation rather than leaving an inconsistent record behind.
    pub async fn create(&self, id: impl Into<String>, cfg: PipelineConfig) -> Result<Pipeline, CoreError> {
        let id = id.into();
        cfg.validate().map_err(CoreError::InvalidConfig)?;

        {
            let registry = self.registry.lock().expect("registry poisoned");
            if registry.contains_key(&id) {
                return Err(CoreError::IdExists(id));
            }
        }

        let name = cfg.name.clone();
        let pipeline = Pipeline::new(id.clone(), name, cfg, Utc::now());
        self.force_set(&id, pipeline.clone());

        match self.orchestrator.start(&pipeline).await {
            Ok(()) => {
                let running = self.transition(&id, PipelineStatus::Running)?;
                if let Err(e) = self.persist(&running).await {
                    warn!(pipeline_id = %id, error = %e, "persistence failed after orchestrator start, rolling back");
                    let _ = self.orchestrator.stop(&id).await;
                    self.registry.lock().expect("registry poisoned").remove(&id);
                    return Err(e);
                }
                info!(pipeline_id = %id, "pipeline created and running");
                Ok(running)
            }
            Err(e) => {
                let failed = self.transition(&id, PipelineStatus::Failed)?;
                let _ = self.persist(&failed).await;
                Err(e)
            }
        }
    }

    /// §4.1 `Stop`, idempotent against repeats while already `Stopping` or
    /// `Stopped` (§8 round-trip property).
    pub async fn stop(&self, id: &str) -> Result<Pipeline, CoreError> {
        let current = self.snapshot(id)?.status();
        if matches!(current, PipelineStatus::Stopped | PipelineStatus::Stopping) {
            return self.snapshot(id);
        }

        let stopping = self.transition(id, PipelineStatus::Stopping)?;
        self.persist(&stopping).await?;

        match self.orchestrator.stop(id).await {
            Ok(()) => {
                let stopped = self.transition(id, PipelineStatus::Stopped)?;
                self.persist(&stopped).await?;
                Ok(stopped)
            }
            Err(e) => {
                let failed = self.transition(id, PipelineStatus::Failed)?;
                let _ = self.persist(&failed).await;
                Err(e)
            }
        }
    }

    /// §4.1 `Resume`. Legal from `Stopped` or `Paused` per §4.8; illegal
    /// sources are rejected by `transition`'s table check.
    pub async fn resume(&self, id: &str) -> Result<Pipeline, CoreError> {
        let resuming = self.transition(id, PipelineStatus::Resuming)?;
        self.persist(&resuming).await?;

        let pipeline = self.snapshot(id)?;
        match self.orchestrator.resume(&pipeline).await {
            Ok(()) => {
                let running = self.transition(id, PipelineStatus::Running)?;
                self.persist(&running).await?;
                Ok(running)
            }
            Err(e) => {
                let failed = self.transition(id, PipelineStatus::Failed)?;
                let _ = self.persist(&failed).await;
                Err(e)
            }
        }
    }

    /// §4.1 `Terminate`: the local variant always settles at `Stopped` on
    /// success — `Terminating -> Terminated` is reserved for an external
    /// orchestrator variant this crate does not implement (§9 open
    /// question b). `Terminating` has no `Failed` row in §4.8, so a
    /// reported orchestrator error is logged rather than transitioned;
    /// the teardown it performs is unconditional regardless.
    pub async fn terminate(&self, id: &str) -> Result<Pipeline, CoreError> {
        let current = self.snapshot(id)?.status();
        if current == PipelineStatus::Terminated {
            return Err(CoreError::PipelineNotExists(id.to_string()));
        }

        let terminating = self.transition(id, PipelineStatus::Terminating)?;
        self.persist(&terminating).await?;

        match self.orchestrator.terminate(id).await {
            Ok(()) => {
                let stopped = self.transition(id, PipelineStatus::Stopped)?;
                self.persist(&stopped).await?;
                Ok(stopped)
            }
            Err(e) => {
                error!(pipeline_id = %id, error = %e, "orchestrator terminate reported an error, forcing Stopped anyway");
                let stopped = self.transition(id, PipelineStatus::Stopped)?;
                let _ = self.persist(&stopped).await;
                Err(e)
            }
        }
    }

    /// Deletes a pipeline record outright (§3 "destroyed on
    /// terminate-then-delete"). Calls the orchestrator defensively first —
    /// a no-op if nothing is running — so a `Delete` that skipped
    /// `Terminate` still can't leave a runner behind; no separate
    /// `Stopped`-only precondition is enforced since §7 names no error kind
    /// for it.
    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        let _ = self.orchestrator.terminate(id).await;
        let existed = self.registry.lock().expect("registry poisoned").remove(id).is_some();
        if !existed {
            return Err(CoreError::PipelineNotExists(id.to_string()));
        }
        self.store.delete(id).await
    }

    /// §4.1 `Edit`: rejects unless `Stopped`.
    pub async fn edit(&self, id: &str, new_cfg: PipelineConfig) -> Result<Pipeline, CoreError> {
        new_cfg.validate().map_err(CoreError::InvalidConfig)?;
        let current = self.snapshot(id)?;
        if current.status() != PipelineStatus::Stopped {
            return Err(CoreError::PipelineNotStoppedForEdit(current.status()));
        }

        let mut updated = current;
        updated.config = new_cfg;
        self.orchestrator.edit(&updated).await?;

        {
            let mut registry = self.registry.lock().expect("registry poisoned");
            registry.insert(id.to_string(), updated.clone());
        }
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// Supplementary `Get` (§4.1 note): `Terminated` pipelines are hidden
    /// from normal reads even if still present in the registry.
    pub fn get(&self, id: &str) -> Result<Pipeline, CoreError> {
        let pipeline = self.snapshot(id)?;
        if pipeline.status() == PipelineStatus::Terminated {
            return Err(CoreError::PipelineNotExists(id.to_string()));
        }
        Ok(pipeline)
    }

    /// Supplementary `List`: all non-`Terminated` pipelines, oldest first.
    pub fn list(&self) -> Vec<Pipeline> {
        let registry = self.registry.lock().expect("registry poisoned");
        let mut pipelines: Vec<Pipeline> = registry.values().filter(|p| p.status() != PipelineStatus::Terminated).cloned().collect();
        pipelines.sort_by_key(|p| p.health.created_at);
        pipelines
    }

    /// Supplementary `Rename`: legal from any non-terminal state, mutates
    /// only `name`.
    pub async fn rename(&self, id: &str, name: impl Into<String>) -> Result<Pipeline, CoreError> {
        let name = name.into();
        let updated = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            let pipeline = registry.get_mut(id).ok_or_else(|| CoreError::PipelineNotExists(id.to_string()))?;
            if pipeline.status() == PipelineStatus::Terminated {
                return Err(CoreError::PipelineNotExists(id.to_string()));
            }
            pipeline.name = name;
            pipeline.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// Supplementary `Health`: live component statuses while the pipeline
    /// is actively driven by the orchestrator, else the last-persisted
    /// snapshot.
    pub async fn health(&self, id: &str) -> Result<Health, CoreError> {
        let pipeline = self.get(id)?;
        let mut health = pipeline.health.clone();
        if matches!(pipeline.status(), PipelineStatus::Running | PipelineStatus::Pausing | PipelineStatus::Resuming) {
            health.component_statuses = self.orchestrator.health(id).await;
        }
        Ok(health)
    }

    /// §4.1 `CleanUpOnBoot`: loads every persisted pipeline and, for any not
    /// already `Stopped`/`Failed`, forces it to `Stopped` — the local
    /// variant's runtime does not survive a process restart, so this is the
    /// one write to `overall_status` in this crate that bypasses
    /// `validate_transition` by design (crash recovery, not an operator
    /// transition).
    pub async fn clean_up_on_boot(&self) -> Result<(), CoreError> {
        let pipelines = self.store.list().await?;
        for mut pipeline in pipelines {
            if !matches!(pipeline.status(), PipelineStatus::Stopped | PipelineStatus::Failed) {
                let from = pipeline.status();
                pipeline.health.set_status(PipelineStatus::Stopped, Utc::now());
                info!(pipeline_id = %pipeline.id, from = ?from, "clean up on boot: forced to Stopped");
                self.persist(&pipeline).await?;
            }
            self.force_set(&pipeline.id.clone(), pipeline);
        }
        Ok(())
    }

    /// Supplementary `Pause`/`Unpause` (§9 open question b: this crate
    /// treats `Pausing`/`Paused` as distinct, reachable states). spec.md's
    /// §4.1 operation list doesn't name them, so these aren't part of the
    /// core's public operation set, but the local variant has no in-place
    /// suspend to offer — it reuses the same teardown/re-start the
    /// orchestrator already performs for `Stop`/`Resume`, only under a
    /// distinct status label an operator can tell apart from a deliberate
    /// stop.
    pub async fn pause(&self, id: &str) -> Result<Pipeline, CoreError> {
        let pausing = self.transition(id, PipelineStatus::Pausing)?;
        self.persist(&pausing).await?;

        match self.orchestrator.stop(id).await {
            Ok(()) => {
                let paused = self.transition(id, PipelineStatus::Paused)?;
                self.persist(&paused).await?;
                Ok(paused)
            }
            Err(e) => {
                let failed = self.transition(id, PipelineStatus::Failed)?;
                let _ = self.persist(&failed).await;
                Err(e)
            }
        }
    }

    pub async fn unpause(&self, id: &str) -> Result<Pipeline, CoreError> {
        let resuming = self.transition(id, PipelineStatus::Resuming)?;
        self.persist(&resuming).await?;

        let pipeline = self.snapshot(id)?;
        match self.orchestrator.resume(&pipeline).await {
            Ok(()) => {
                let running = self.transition(id, PipelineStatus::Running)?;
                self.persist(&running).await?;
                Ok(running)
            }
            Err(e) => {
                let failed = self.transition(id, PipelineStatus::Failed)?;
                let _ = self.persist(&failed).await;
                Err(e)
            }
        }
    }

    async fn mark_failed(&self, pipeline_id: &str, detail: &str) {
        let current = match self.snapshot(pipeline_id) {
            Ok(p) => p.status(),
            Err(_) => {
                warn!(pipeline_id, "runtime failure reported for unknown pipeline");
                return;
            }
        };
        if current == PipelineStatus::Failed {
            return;
        }
        match self.transition(pipeline_id, PipelineStatus::Failed) {
            Ok(failed) => {
                error!(pipeline_id, detail, "pipeline marked Failed after a runtime component failure");
                let _ = self.persist(&failed).await;
            }
            Err(e) => warn!(pipeline_id, error = %e, "could not transition to Failed for a runtime failure report"),
        }
    }

    /// Drains the orchestrator's `PipelineFailure` channel for the lifetime
    /// of the manager (§7: "runtime errors a runner cannot self-heal are
    /// reported on its error channel and result in the manager marking the
    /// pipeline Failed"). Callers spawn this as a background task.
    pub async fn drain_failures(self: Arc<Self>, mut failures: mpsc::UnboundedReceiver<PipelineFailure>) {
        while let Some(failure) = failures.recv().await {
            self.mark_failed(&failure.pipeline_id, &failure.detail).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glassflow_core::config::{BatchConfig, ClickHouseConfig, ConsumerGroupConfig, InitialOffset, SinkSpec, SourceConfig, TableMapping};
    use glassflow_core::model::ComponentStatus;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockOrchestrator {
        fail_start: AtomicBool,
    }

    #[async_trait]
    impl Orchestrator for MockOrchestrator {
        async fn start(&self, _pipeline: &Pipeline) -> Result<(), CoreError> {
            if self.fail_start.load(Ordering::SeqCst) {
                Err(CoreError::ComponentStartupFailed("boom".to_string()))
            } else {
                Ok(())
            }
        }
        async fn stop(&self, _pipeline_id: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn resume(&self, _pipeline: &Pipeline) -> Result<(), CoreError> {
            Ok(())
        }
        async fn terminate(&self, _pipeline_id: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn edit(&self, _pipeline: &Pipeline) -> Result<(), CoreError> {
            Ok(())
        }
        async fn health(&self, _pipeline_id: &str) -> HashMap<String, ComponentStatus> {
            HashMap::new()
        }
    }

    fn cfg() -> PipelineConfig {
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

    fn manager(fail_start: bool) -> PipelineManager {
        PipelineManager::new(
            Arc::new(MemoryStateStore::new()),
            Arc::new(MockOrchestrator { fail_start: AtomicBool::new(fail_start) }),
        )
    }

    #[tokio::test]
    async fn create_transitions_straight_to_running() {
        let m = manager(false);
        let p = m.create("p1", cfg()).await.unwrap();
        assert_eq!(p.status(), PipelineStatus::Running);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let m = manager(false);
        m.create("p1", cfg()).await.unwrap();
        let err = m.create("p1", cfg()).await.unwrap_err();
        assert!(matches!(err, CoreError::IdExists(_)));
    }

    #[tokio::test]
    async fn failed_orchestrator_start_marks_pipeline_failed() {
        let m = manager(true);
        let err = m.create("p1", cfg()).await.unwrap_err();
        assert!(matches!(err, CoreError::ComponentStartupFailed(_)));
        assert_eq!(m.get("p1").unwrap().status(), PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn edit_rejects_unless_stopped_then_succeeds() {
        let m = manager(false);
        m.create("p1", cfg()).await.unwrap();
        let err = m.edit("p1", cfg()).await.unwrap_err();
        assert!(matches!(err, CoreError::PipelineNotStoppedForEdit(_)));

        m.stop("p1").await.unwrap();
        let edited = m.edit("p1", cfg()).await.unwrap();
        assert_eq!(edited.status(), PipelineStatus::Stopped);
    }

    /// §8 round-trip property: "Edit(C) on a Stopped pipeline followed by
    /// Resume produces a Running pipeline whose config == C".
    #[tokio::test]
    async fn edit_then_resume_produces_a_running_pipeline_with_the_edited_config() {
        let m = manager(false);
        m.create("p1", cfg()).await.unwrap();
        m.stop("p1").await.unwrap();

        let mut new_config = cfg();
        new_config.name = "renamed-in-edit".to_string();
        let edited = m.edit("p1", new_config.clone()).await.unwrap();
        assert_eq!(edited.status(), PipelineStatus::Stopped);
        assert_eq!(edited.config, new_config);

        let resumed = m.resume("p1").await.unwrap();
        assert_eq!(resumed.status(), PipelineStatus::Running);
        assert_eq!(resumed.config, new_config);
    }

    #[tokio::test]
    async fn repeated_stop_is_a_noop() {
        let m = manager(false);
        m.create("p1", cfg()).await.unwrap();
        m.stop("p1").await.unwrap();
        let again = m.stop("p1").await.unwrap();
        assert_eq!(again.status(), PipelineStatus::Stopped);
    }

    #[tokio::test]
    async fn terminate_then_delete_then_recreate_round_trips() {
        let m = manager(false);
        m.create("p1", cfg()).await.unwrap();
        let terminated = m.terminate("p1").await.unwrap();
        assert_eq!(terminated.status(), PipelineStatus::Stopped);

        m.delete("p1").await.unwrap();
        assert!(matches!(m.get("p1").unwrap_err(), CoreError::PipelineNotExists(_)));

        let recreated = m.create("p1", cfg()).await.unwrap();
        assert_eq!(recreated.status(), PipelineStatus::Running);
    }

    #[tokio::test]
    async fn clean_up_on_boot_forces_non_terminal_pipelines_to_stopped() {
        let store = Arc::new(MemoryStateStore::new());
        let pipeline = Pipeline::new("p1".to_string(), "p".to_string(), cfg(), Utc::now());
        store.put(&pipeline).await.unwrap();

        let m = PipelineManager::new(store, Arc::new(MockOrchestrator { fail_start: AtomicBool::new(false) }));
        m.clean_up_on_boot().await.unwrap();
        assert_eq!(m.get("p1").unwrap().status(), PipelineStatus::Stopped);
    }

    #[tokio::test]
    async fn runtime_failure_marks_running_pipeline_failed() {
        let m = Arc::new(manager(false));
        m.create("p1", cfg()).await.unwrap();
        m.mark_failed("p1", "kafka connection dropped").await;
        assert_eq!(m.get("p1").unwrap().status(), PipelineStatus::Failed);
    }
}
