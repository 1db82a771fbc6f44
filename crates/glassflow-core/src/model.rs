//! Core data model: pipelines, records, KV entries, and DLQ messages.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;

/// The state variable of the pipeline lifecycle state machine (§4.8).
///
/// `Pausing`/`Paused` are kept distinct from `Stopping`/`Stopped` per the
/// open question in spec §9: this crate treats them as first-class,
/// independently reachable states with their own orchestrator calls. See
/// `DESIGN.md` for the rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStatus {
    Created,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Failed,
}

impl PipelineStatus {
    /// `Terminated` is terminal and hides the pipeline from normal reads.
    pub fn is_terminated(self) -> bool {
        matches!(self, PipelineStatus::Terminated)
    }
}

/// Per-runner health detail, folded into `Health::component_statuses`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub component: ComponentKind,
    pub state: ComponentState,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Which runner a `ComponentStatus` describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    Ingestor { source_id: String },
    Joiner,
    Sink,
}

impl ComponentKind {
    pub fn label(&self) -> String {
        match self {
            ComponentKind::Ingestor { source_id } => format!("ingestor:{source_id}"),
            ComponentKind::Joiner => "joiner".to_string(),
            ComponentKind::Sink => "sink".to_string(),
        }
    }
}

/// Runner-local lifecycle state; not validated against a transition table
/// (no externally visible contract), used for `Health()` and orchestrator
/// rollback bookkeeping only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentState {
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

/// The pipeline's health record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub overall_status: PipelineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub component_statuses: HashMap<String, ComponentStatus>,
}

impl Health {
    pub fn new(status: PipelineStatus, now: DateTime<Utc>) -> Self {
        Self {
            overall_status: status,
            created_at: now,
            updated_at: now,
            component_statuses: HashMap::new(),
        }
    }

    pub fn set_status(&mut self, status: PipelineStatus, now: DateTime<Utc>) {
        self.overall_status = status;
        self.updated_at = now;
    }
}

/// A pipeline: identity, config, and health. Created by the manager on
/// accept; mutated only through validated transitions; destroyed on
/// terminate-then-delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub config: PipelineConfig,
    pub health: Health,
}

impl Pipeline {
    pub fn new(id: String, name: String, config: PipelineConfig, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            config,
            health: Health::new(PipelineStatus::Created, now),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.health.overall_status
    }
}

/// `source_id` stamped on a joiner's merged output (§4.4): neither
/// constituent's own source id, since the merged record's lineage is both.
pub const JOINED_SOURCE_ID: &str = "joined";

/// Metadata carried alongside every record's opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    pub source_id: String,
    pub ingest_timestamp: DateTime<Utc>,
    pub delivery_id: String,
}

/// An opaque payload plus metadata (§3). The payload is carried as JSON
/// since every stage (dedup key extraction, join key projection, schema
/// coercion) needs named-field access; binary/Avro payloads are out of
/// scope for this core (the ingestor's JSON parsing boundary is where a
/// different wire format would be decoded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub payload: serde_json::Value,
    pub meta: RecordMeta,
}

impl Record {
    pub fn new(payload: serde_json::Value, source_id: impl Into<String>, delivery_id: impl Into<String>, ingest_timestamp: DateTime<Utc>) -> Self {
        Self {
            payload,
            meta: RecordMeta {
                source_id: source_id.into(),
                ingest_timestamp,
                delivery_id: delivery_id.into(),
            },
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }
}

/// A record routed to the dead-letter stream by any stage (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub pipeline_id: String,
    pub component: DlqComponent,
    /// Serialized as a base64 string on the wire per §6 (`"original": <opaque
    /// bytes, base64>`); held here as raw bytes for in-process use.
    #[serde(with = "base64_bytes")]
    pub original: Vec<u8>,
    pub error_kind: String,
    pub error_detail: String,
    pub failed_at: DateTime<Utc>,
}

/// (De)serializes a `Vec<u8>` as a base64 string, per §6's DLQ message
/// format (`"original": <opaque bytes, base64>`).
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlqComponent {
    Ingestor,
    Joiner,
    Sink,
}
