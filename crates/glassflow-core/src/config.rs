//! Pipeline configuration: the shape external callers hand the core (§6).
//!
//! Deserialized via `serde`/`serde_yaml`, mirroring how the teacher's
//! `rde_core::PipelineSpec` was loaded by `rde-cli` from a YAML file.
//! Recognized options and defaults match spec §6 exactly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Seconds-resolution duration with a plain numeric wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSecs(pub u64);

impl DurationSecs {
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl From<DurationSecs> for Duration {
    fn from(value: DurationSecs) -> Self {
        value.as_duration()
    }
}

fn default_dedup_window() -> DurationSecs {
    DurationSecs(3600) // 1h
}

fn default_batch_size() -> usize {
    1000
}

fn default_batch_delay() -> DurationSecs {
    DurationSecs(1) // 1s
}

fn default_initial_offset() -> InitialOffset {
    InitialOffset::Earliest
}

fn default_replicas() -> usize {
    1
}

/// Complete pipeline configuration, the blueprint an `Orchestrator` compiles
/// into a running DAG (§3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub join: Option<JoinSpec>,
    pub sink: SinkSpec,
}

impl PipelineConfig {
    /// Structural validation performed at `Create`/`Edit`, before any side
    /// effect (§7 `InvalidConfig`).
    pub fn validate(&self) -> Result<(), String> {
        if self.sources.is_empty() {
            return Err("pipeline must declare at least one source".to_string());
        }

        let mut seen_ids = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen_ids.insert(source.id.as_str()) {
                return Err(format!("duplicate source id: {}", source.id));
            }
        }

        if let Some(join) = &self.join {
            join.validate(&self.sources)?;
        } else if self.sources.len() != 1 {
            return Err("multiple sources require a join spec".to_string());
        }

        self.sink.validate()?;
        Ok(())
    }
}

/// A Kafka topic feeding into the pipeline (§3 "Source (ingestor topic)").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique identifier for this source, referenced by `JoinSource::source_id`.
    pub id: String,
    pub topic_name: String,
    #[serde(default)]
    pub dedup: Option<DedupConfig>,
    pub consumer_group: ConsumerGroupConfig,
    /// Fan-out replica count for this source's consumer group.
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

impl SourceConfig {
    pub fn output_stream_id(&self, pipeline_id: &str) -> String {
        format!("{pipeline_id}-{}", self.topic_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default)]
    pub enabled: bool,
    pub id_field: String,
    pub id_field_type: IdFieldType,
    #[serde(default = "default_dedup_window")]
    pub time_window: DurationSecs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdFieldType {
    String,
    Int,
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerGroupConfig {
    pub group_id: String,
    #[serde(default = "default_initial_offset")]
    pub initial_offset: InitialOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    Earliest,
    Latest,
}

/// Exactly two `JoinSource` entries, one `left` and one `right` (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub sources: Vec<JoinSource>,
    pub output_stream_id: Option<String>,
}

impl JoinSpec {
    pub fn validate(&self, sources: &[SourceConfig]) -> Result<(), String> {
        if self.sources.len() != 2 {
            return Err("join spec requires exactly two sources".to_string());
        }
        let lefts = self.sources.iter().filter(|s| s.orientation == Orientation::Left).count();
        let rights = self.sources.iter().filter(|s| s.orientation == Orientation::Right).count();
        if lefts != 1 || rights != 1 {
            return Err("join spec requires exactly one left and one right source".to_string());
        }
        for js in &self.sources {
            if !sources.iter().any(|s| s.id == js.source_id) {
                return Err(format!("join source '{}' does not reference a configured source", js.source_id));
            }
        }
        Ok(())
    }

    pub fn left(&self) -> &JoinSource {
        self.sources.iter().find(|s| s.orientation == Orientation::Left).expect("validated")
    }

    pub fn right(&self) -> &JoinSource {
        self.sources.iter().find(|s| s.orientation == Orientation::Right).expect("validated")
    }

    pub fn output_stream_id(&self, pipeline_id: &str) -> String {
        self.output_stream_id.clone().unwrap_or_else(|| format!("{pipeline_id}-joined"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSource {
    pub source_id: String,
    pub stream_id: String,
    pub join_key: String,
    pub time_window: DurationSecs,
    pub orientation: Orientation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Left,
    Right,
}

/// The sink's terminal stream, batching policy, ClickHouse target, and
/// column mapping (§3 "Sink spec").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    pub stream_id: String,
    #[serde(default)]
    pub batch: BatchConfig,
    pub clickhouse: ClickHouseConfig,
    pub table_mapping: Vec<TableMapping>,
}

impl SinkSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.table_mapping.is_empty() {
            return Err("sink requires at least one table mapping entry".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_batch_delay")]
    pub max_delay_time: DurationSecs,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_batch_size(),
            max_delay_time: default_batch_delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub secure: bool,
}

/// One ordered entry of the sink's column mapping; order is the order
/// `SchemaMapper::project` preserves in `sink_mapping` (§4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_id: String,
    pub source_field: String,
    pub source_type: String,
    pub destination_column: String,
    pub destination_type: String,
}
