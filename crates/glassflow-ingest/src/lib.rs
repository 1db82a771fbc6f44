//! The ingestor runner (§4.3): consumes one Kafka topic, applies optional
//! dedup, and publishes onto the component's output stream — grounded on
//! the teacher's `source_kafka::KafkaSource` consumer setup, generalized
//! from a raw `mpsc` forwarder into a `Runner` that talks to the bus
//! directly instead of an in-process channel (§5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use glassflow_bus::dlq::DlqChannel;
use glassflow_bus::StreamBus;
use glassflow_core::config::{IdFieldType, SourceConfig};
use glassflow_core::model::{ComponentKind, DlqComponent, DlqMessage, Record};
use glassflow_core::{CoreError, Runner};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::Message as _;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const MAX_PUBLISH_ATTEMPTS: u32 = 5;

/// Static configuration an `IngestorRunner` needs beyond what the bus/DLQ
/// handles already carry.
pub struct IngestorConfig {
    pub pipeline_id: String,
    pub brokers: String,
    pub source: SourceConfig,
}

pub struct IngestorRunner {
    config: IngestorConfig,
    bus: Arc<dyn StreamBus>,
    dlq: DlqChannel,
}

impl IngestorRunner {
    pub fn new(config: IngestorConfig, bus: Arc<dyn StreamBus>, dlq: DlqChannel) -> Self {
        Self { config, bus, dlq }
    }

    fn output_stream(&self) -> String {
        self.config.source.output_stream_id(&self.config.pipeline_id)
    }

    /// Extracts the dedup key from a JSON payload per `id_field`/`id_field_type`.
    /// When dedup is disabled, every record still gets a message-id — a
    /// fresh one per record, so it can never collide with another (§4.3
    /// "records are published with a fresh id").
    fn dedup_key(&self, payload: &serde_json::Value) -> Result<String, String> {
        let Some(dedup) = self.config.source.dedup.as_ref().filter(|d| d.enabled) else {
            return Ok(uuid::Uuid::new_v4().to_string());
        };

        let value = payload
            .get(&dedup.id_field)
            .ok_or_else(|| format!("missing dedup field: {}", dedup.id_field))?;

        let key = match dedup.id_field_type {
            IdFieldType::String => value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("dedup field {} is not a string", dedup.id_field))?,
            IdFieldType::Int => value
                .as_i64()
                .map(|n| n.to_string())
                .ok_or_else(|| format!("dedup field {} is not an integer", dedup.id_field))?,
            IdFieldType::Bytes => value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("dedup field {} is not a base64 string", dedup.id_field))?,
        };
        Ok(key)
    }

    async fn route_to_dlq(&self, original: Vec<u8>, error_kind: &str, error_detail: String) {
        let message = DlqMessage {
            pipeline_id: self.config.pipeline_id.clone(),
            component: DlqComponent::Ingestor,
            original,
            error_kind: error_kind.to_string(),
            error_detail,
            failed_at: Utc::now(),
        };
        if self.dlq.send(message).await.is_err() {
            warn!("dlq channel closed, dropping record");
        }
    }

    /// Publishes with exponential backoff (§ ingestor failure policy); on
    /// exhaustion routes to DLQ with `PublishFailed` and returns `Ok` (the
    /// record has been handled, just not the happy path).
    ///
    /// Wraps the parsed payload in a `Record` envelope before publishing —
    /// the joiner and sink both deserialize strictly as `Record`.
    async fn publish_with_retry(&self, payload: serde_json::Value, raw: Vec<u8>, message_id: String) -> bool {
        let stream = self.output_stream();
        let record = Record::new(payload, self.config.source.id.clone(), message_id.clone(), Utc::now());
        let wire = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.route_to_dlq(raw, "SchemaMissingField", format!("failed to encode record: {e}")).await;
                return false;
            }
        };
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            let result = self
                .bus
                .publish(&stream, wire.clone(), Some(message_id.as_str()))
                .await;
            match result {
                Ok(()) => return true,
                Err(e) if attempt < MAX_PUBLISH_ATTEMPTS => {
                    warn!(attempt, error = %e, "publish failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    self.route_to_dlq(raw, "PublishFailed", e.to_string()).await;
                    return false;
                }
            }
        }
        unreachable!("loop always returns")
    }
}

#[async_trait]
impl Runner for IngestorRunner {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Ingestor {
            source_id: self.config.source.id.clone(),
        }
    }

    async fn run(&mut self, cancel: CancellationToken) -> Result<(), CoreError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.source.consumer_group.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set(
                "auto.offset.reset",
                match self.config.source.consumer_group.initial_offset {
                    glassflow_core::config::InitialOffset::Earliest => "earliest",
                    glassflow_core::config::InitialOffset::Latest => "latest",
                },
            )
            .create()
            .map_err(|e| CoreError::ComponentStartupFailed(e.to_string()))?;

        consumer
            .subscribe(&[self.config.source.topic_name.as_str()])
            .map_err(|e| CoreError::ComponentStartupFailed(e.to_string()))?;

        info!(source = %self.config.source.id, topic = %self.config.source.topic_name, "ingestor started");

        let mut stream = consumer.stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => {
                    match next {
                        None => break,
                        Some(Err(e)) => warn!(error = %e, "kafka consume error"),
                        Some(Ok(message)) => {
                            let raw = message.payload().unwrap_or_default().to_vec();
                            let payload: serde_json::Value = match serde_json::from_slice(&raw) {
                                Ok(v) => v,
                                Err(e) => {
                                    self.route_to_dlq(raw, "SchemaMissingField", format!("invalid json: {e}")).await;
                                    let _ = consumer.commit_message(&message, CommitMode::Async);
                                    continue;
                                }
                            };

                            match self.dedup_key(&payload) {
                                Ok(message_id) => {
                                    self.publish_with_retry(payload, raw, message_id).await;
                                }
                                Err(detail) => {
                                    self.route_to_dlq(raw, "SchemaMissingField", detail).await;
                                }
                            }

                            let _ = consumer.commit_message(&message, CommitMode::Async);
                        }
                    }
                }
            }
        }

        info!(source = %self.config.source.id, "ingestor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glassflow_bus::memory::MemoryBus;
    use glassflow_bus::Consumer;
    use glassflow_core::config::{ConsumerGroupConfig, DedupConfig, InitialOffset};
    use serde_json::json;
    use std::time::Duration as StdDuration;

    fn source(dedup: Option<DedupConfig>) -> SourceConfig {
        SourceConfig {
            id: "emails".to_string(),
            topic_name: "emails".to_string(),
            dedup,
            consumer_group: ConsumerGroupConfig {
                group_id: "emails-cg".to_string(),
                initial_offset: InitialOffset::Earliest,
            },
            replicas: 1,
        }
    }

    fn runner(dedup: Option<DedupConfig>) -> (IngestorRunner, Arc<dyn StreamBus>) {
        let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
        let dlq = glassflow_bus::dlq::start(bus.clone(), 16);
        let config = IngestorConfig {
            pipeline_id: "p1".to_string(),
            brokers: "localhost:9092".to_string(),
            source: source(dedup),
        };
        (IngestorRunner::new(config, bus.clone(), dlq), bus)
    }

    #[test]
    fn dedup_disabled_assigns_a_fresh_id_to_every_record() {
        let (runner, _bus) = runner(None);
        let payload = json!({"id": 1});
        let first = runner.dedup_key(&payload).unwrap();
        let second = runner.dedup_key(&payload).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn dedup_enabled_extracts_the_configured_string_field() {
        let (runner, _bus) = runner(Some(DedupConfig {
            enabled: true,
            id_field: "message_id".to_string(),
            id_field_type: IdFieldType::String,
            time_window: glassflow_core::config::DurationSecs(3600),
        }));
        let payload = json!({"message_id": "abc-123", "body": "hi"});
        assert_eq!(runner.dedup_key(&payload).unwrap(), "abc-123");
    }

    #[test]
    fn dedup_enabled_extracts_the_configured_int_field() {
        let (runner, _bus) = runner(Some(DedupConfig {
            enabled: true,
            id_field: "seq".to_string(),
            id_field_type: IdFieldType::Int,
            time_window: glassflow_core::config::DurationSecs(3600),
        }));
        let payload = json!({"seq": 42});
        assert_eq!(runner.dedup_key(&payload).unwrap(), "42");
    }

    #[test]
    fn dedup_enabled_missing_field_is_an_error() {
        let (runner, _bus) = runner(Some(DedupConfig {
            enabled: true,
            id_field: "message_id".to_string(),
            id_field_type: IdFieldType::String,
            time_window: glassflow_core::config::DurationSecs(3600),
        }));
        let payload = json!({"body": "hi"});
        let err = runner.dedup_key(&payload).unwrap_err();
        assert!(err.contains("missing dedup field"));
    }

    #[test]
    fn dedup_enabled_wrong_type_is_an_error() {
        let (runner, _bus) = runner(Some(DedupConfig {
            enabled: true,
            id_field: "seq".to_string(),
            id_field_type: IdFieldType::Int,
            time_window: glassflow_core::config::DurationSecs(3600),
        }));
        let payload = json!({"seq": "not-a-number"});
        let err = runner.dedup_key(&payload).unwrap_err();
        assert!(err.contains("not an integer"));
    }

    #[tokio::test]
    async fn publish_with_retry_delivers_a_record_envelope_to_the_output_stream() {
        let (runner, bus) = runner(None);
        bus.ensure_stream(&runner.output_stream(), StdDuration::from_secs(3600))
            .await
            .unwrap();
        let mut consumer = bus.subscribe(&runner.output_stream(), "reader", 10).await.unwrap();

        let ok = runner
            .publish_with_retry(json!({"a": 1}), b"{\"a\":1}".to_vec(), "msg-1".to_string())
            .await;
        assert!(ok);

        let delivery = consumer.next().await.unwrap().unwrap();
        let record: glassflow_core::model::Record = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(record.payload, json!({"a": 1}));
        assert_eq!(record.meta.source_id, "emails");
        assert_eq!(record.meta.delivery_id, "msg-1");
    }

    #[tokio::test]
    async fn route_to_dlq_lands_on_the_pipeline_dlq_stream() {
        let (runner, bus) = runner(None);
        bus.ensure_stream("p1-DLQ", StdDuration::from_secs(7 * 24 * 3600))
            .await
            .unwrap();
        let mut consumer = bus.subscribe("p1-DLQ", "reader", 10).await.unwrap();

        runner
            .route_to_dlq(b"{\"bad\":true}".to_vec(), "SchemaMissingField", "missing field: id".to_string())
            .await;

        let delivery = consumer.next().await.unwrap().unwrap();
        let decoded: DlqMessage = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(decoded.error_kind, "SchemaMissingField");
        assert_eq!(decoded.pipeline_id, "p1");
    }
}
