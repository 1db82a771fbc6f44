//! Error taxonomy shared by every glassflow crate.
//!
//! This is the one error enum the rest of the workspace converts into via
//! `#[from]` / `.context()`, the way `rde_core::RdeError` anchored the
//! teacher's crates. Per-record faults (`PublishFailed`, `SinkReject`,
//! `SchemaMissingField`, `CoercionFailed`) are caught at the record boundary
//! by their runner and routed to the DLQ; they never propagate past that
//! point as a `CoreError` return.

use thiserror::Error;

/// Stable error kinds surfaced by the pipeline manager, orchestrator, and
/// runners. Every variant here is a kind named in the core's error taxonomy;
/// the `Display` impl is the advisory detail string, the variant name is the
/// stable kind.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Rejected at `Create`/`Edit` before any side effect.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Pipeline identity collision on `Create`.
    #[error("pipeline already exists: {0}")]
    IdExists(String),

    /// Lookup miss.
    #[error("pipeline does not exist: {0}")]
    PipelineNotExists(String),

    /// Illegal state transition per the §4.8 table.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: crate::model::PipelineStatus,
        to: crate::model::PipelineStatus,
    },

    /// `Edit` attempted while the pipeline is not `Stopped`.
    #[error("pipeline must be Stopped to edit, currently {0:?}")]
    PipelineNotStoppedForEdit(crate::model::PipelineStatus),

    /// A runner failed to start; the orchestrator has rolled back.
    #[error("component startup failed: {0}")]
    ComponentStartupFailed(String),

    /// Per-record: publish to the bus failed after exhausting retries.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Per-record: ClickHouse rejected the row.
    #[error("sink reject: {0}")]
    SinkReject(String),

    /// Per-record: a field required for dedup or mapping is missing.
    #[error("schema missing field: {0}")]
    SchemaMissingField(String),

    /// Per-record: a value could not be coerced to its destination type.
    #[error("coercion failed: {0}")]
    CoercionFailed(String),

    /// Infrastructure fault: the bus is unreachable after bounded retries.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// Infrastructure fault: the KV/state store is unreachable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The active orchestrator variant does not support this operation.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Catch-all for unexpected failures, preserving context like `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// The stable kind string, independent of the advisory detail in `Display`.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidConfig(_) => "InvalidConfig",
            CoreError::IdExists(_) => "IdExists",
            CoreError::PipelineNotExists(_) => "PipelineNotExists",
            CoreError::InvalidTransition { .. } => "InvalidTransition",
            CoreError::PipelineNotStoppedForEdit(_) => "PipelineNotStoppedForEdit",
            CoreError::ComponentStartupFailed(_) => "ComponentStartupFailed",
            CoreError::PublishFailed(_) => "PublishFailed",
            CoreError::SinkReject(_) => "SinkReject",
            CoreError::SchemaMissingField(_) => "SchemaMissingField",
            CoreError::CoercionFailed(_) => "CoercionFailed",
            CoreError::BusUnavailable(_) => "BusUnavailable",
            CoreError::StoreUnavailable(_) => "StoreUnavailable",
            CoreError::NotImplemented(_) => "NotImplemented",
            CoreError::Other(_) => "Other",
        }
    }

    /// Per-record faults are caught at the record boundary and routed to DLQ;
    /// this is used by runners to decide whether an error should become a
    /// pipeline-level `Failed` or a DLQ entry.
    pub fn is_per_record(&self) -> bool {
        matches!(
            self,
            CoreError::PublishFailed(_)
                | CoreError::SinkReject(_)
                | CoreError::SchemaMissingField(_)
                | CoreError::CoercionFailed(_)
        )
    }
}
