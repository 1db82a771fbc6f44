//! The `Runner` capability every ingestor, joiner, and sink component
//! implements, generalizing the teacher's `Source`/`Transform`/`Sink` split
//! into a single trait: a runner owns its bus consumer(s)/publisher(s)
//! directly (§5 — components never share in-process channels with one
//! another) and drives itself to completion or cancellation.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::ComponentKind;

/// A running pipeline component. The orchestrator spawns one task per
/// `Runner` and holds its `JoinHandle` alongside a child `CancellationToken`,
/// the same bookkeeping shape the teacher's pipeline driver used for its
/// operator tasks.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Identifies this runner in `Health::component_statuses` and in logs.
    fn kind(&self) -> ComponentKind;

    /// Drives the runner until `cancel` fires or an unrecoverable error
    /// occurs. Per-record faults (schema/coercion/sink-reject/publish) are
    /// caught and routed to the DLQ inside `run`; they must never surface
    /// here. A returned `Err` means the component itself failed and the
    /// orchestrator should transition the pipeline to `Failed`.
    async fn run(&mut self, cancel: tokio_util::sync::CancellationToken) -> Result<(), CoreError>;
}
