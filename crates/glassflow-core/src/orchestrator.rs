//! The `Orchestrator` capability (§4.2, §9 "Polymorphic orchestrator"): a
//! single trait the manager drives without ever branching on variant. This
//! crate only declares the contract; `glassflow-orchestrator` ships the
//! local, in-process implementation the rest of this workspace runs.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::{ComponentStatus, Pipeline};

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Assembles and starts the pipeline's DAG (§4.2 steps 1-4: DLQ stream,
    /// per-source output streams, join output stream and KV buffers, then
    /// runners in Sink → Joiner → Ingestors order). Any runner startup
    /// failure rolls back every already-started runner and returns
    /// `ComponentStartupFailed` (§4.2 step 5).
    async fn start(&self, pipeline: &Pipeline) -> Result<(), CoreError>;

    /// Gracefully stops every runner for `pipeline_id` within the §5
    /// shutdown grace period, then surrenders their bookkeeping.
    async fn stop(&self, pipeline_id: &str) -> Result<(), CoreError>;

    /// Restarts a previously stopped pipeline. Streams and KV stores are
    /// reused (not recreated) when their identity and TTL are unchanged,
    /// same as a fresh `start` — the local variant keeps no runtime state
    /// across a stop, so resuming and starting share one code path.
    async fn resume(&self, pipeline: &Pipeline) -> Result<(), CoreError>;

    /// Tears down every runner and surrenders pipeline resources.
    async fn terminate(&self, pipeline_id: &str) -> Result<(), CoreError>;

    /// Validates an edited config and, for a running DAG, drains/reconfigures/
    /// restarts affected runners (§4.2 edit semantics). The local variant's
    /// manager only invokes this while the pipeline is `Stopped` (§4.1), so
    /// in practice this is a structural re-validation; the subsequent
    /// `Resume` performs the actual (re)start.
    async fn edit(&self, pipeline: &Pipeline) -> Result<(), CoreError>;

    /// Live per-component health, keyed by `ComponentKind::label()`. Empty
    /// if the pipeline has no running orchestrator state (not started, or
    /// already stopped/terminated).
    async fn health(&self, pipeline_id: &str) -> HashMap<String, ComponentStatus>;
}

/// A runtime failure reported by a component the orchestrator could not
/// self-heal (§7: "reported on its error channel and result in the manager
/// marking the pipeline Failed"). The manager drains a channel of these to
/// implement that propagation without polling.
#[derive(Debug, Clone)]
pub struct PipelineFailure {
    pub pipeline_id: String,
    pub detail: String,
}
