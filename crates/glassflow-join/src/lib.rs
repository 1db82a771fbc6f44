//! The joiner runner (§4.4): a temporal two-stream equi-join over a KV
//! buffer with TTL windowing. Grounded on the teacher's `Transform::run`
//! loop shape (`rde_tx::Passthrough`), generalized to two input consumers
//! and the bus/KvStore contracts instead of a single `mpsc` channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use glassflow_bus::{Consumer, KvStore, StreamBus};
use glassflow_core::config::TableMapping;
use glassflow_core::model::{ComponentKind, DlqComponent, DlqMessage, Record, JOINED_SOURCE_ID};
use glassflow_core::{CoreError, Runner, SchemaMapper};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default interval for the proactive TTL sweeper (supplementary joiner
/// detail: "default 30s, configurable").
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const BUFFER_RETRY_ATTEMPTS: u32 = 3;
/// The joiner has no batch-size formula to hang a backpressure bound on
/// (unlike the sink, §4.5); a generous fixed ceiling keeps both sides'
/// consumer groups from growing unbounded while a partner is awaited.
const JOINER_MAX_ACK_PENDING: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// A record parked in a side's buffer, awaiting its partner or expiry. Its
/// bus delivery has not been acked yet — the ack is owed until it either
/// joins or expires (§4.4 step 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Parked {
    record: Record,
    delivery_id: String,
}

pub struct JoinerConfig {
    pub pipeline_id: String,
    pub left_stream_id: String,
    pub right_stream_id: String,
    pub left_source_id: String,
    pub right_source_id: String,
    pub left_key: String,
    pub right_key: String,
    pub window_ttl: Duration,
    pub output_stream_id: String,
    pub group_id: String,
    pub sweep_interval: Duration,
}

impl JoinerConfig {
    pub fn with_default_sweep(mut self) -> Self {
        if self.sweep_interval.is_zero() {
            self.sweep_interval = DEFAULT_SWEEP_INTERVAL;
        }
        self
    }
}

pub struct JoinerRunner {
    config: JoinerConfig,
    bus: Arc<dyn StreamBus>,
    left_buffer: Arc<dyn KvStore>,
    right_buffer: Arc<dyn KvStore>,
    mapping: Vec<TableMapping>,
    dlq: glassflow_bus::dlq::DlqChannel,
}

impl JoinerRunner {
    pub fn new(
        config: JoinerConfig,
        bus: Arc<dyn StreamBus>,
        left_buffer: Arc<dyn KvStore>,
        right_buffer: Arc<dyn KvStore>,
        mapping: Vec<TableMapping>,
        dlq: glassflow_bus::dlq::DlqChannel,
    ) -> Self {
        Self {
            config,
            bus,
            left_buffer,
            right_buffer,
            mapping,
            dlq,
        }
    }

    fn buffer(&self, side: Side) -> &Arc<dyn KvStore> {
        match side {
            Side::Left => &self.left_buffer,
            Side::Right => &self.right_buffer,
        }
    }

    fn key_field(&self, side: Side) -> &str {
        match side {
            Side::Left => &self.config.left_key,
            Side::Right => &self.config.right_key,
        }
    }

    fn source_id(&self, side: Side) -> &str {
        match side {
            Side::Left => &self.config.left_source_id,
            Side::Right => &self.config.right_source_id,
        }
    }

    fn merge(&self, left: &Record, right: &Record) -> Record {
        let mut payload = serde_json::Map::new();
        for entry in &self.mapping {
            let source_record = if entry.source_id == self.config.left_source_id {
                Some(left)
            } else if entry.source_id == self.config.right_source_id {
                Some(right)
            } else {
                None
            };
            if let Some(record) = source_record {
                if let Some(value) = record.field(&entry.source_field) {
                    payload.insert(entry.source_field.clone(), value.clone());
                }
            }
        }
        Record::new(
            serde_json::Value::Object(payload),
            JOINED_SOURCE_ID,
            uuid::Uuid::new_v4().to_string(),
            Utc::now(),
        )
    }

    async fn route_to_dlq(&self, original: &Record, detail: String) {
        let message = DlqMessage {
            pipeline_id: self.config.pipeline_id.clone(),
            component: DlqComponent::Joiner,
            original: serde_json::to_vec(original).unwrap_or_default(),
            error_kind: "SchemaMissingField".to_string(),
            error_detail: detail,
            failed_at: Utc::now(),
        };
        if self.dlq.send(message).await.is_err() {
            warn!("dlq channel closed, dropping record");
        }
    }

    /// Implements §4.4 steps 1-3 for one incoming record, including the
    /// same-key overwrite rule ("new record overwrites the old; the old
    /// record's ack is released").
    async fn handle_record(
        &self,
        side: Side,
        record: Record,
        delivery_id: String,
        own_consumer: &Mutex<Box<dyn Consumer>>,
        opposite_consumer: &Mutex<Box<dyn Consumer>>,
    ) {
        let key_field = self.key_field(side);
        let Some(raw_key) = record.field(key_field) else {
            self.route_to_dlq(&record, format!("missing join key field: {key_field}")).await;
            let _ = own_consumer.lock().await.ack(&delivery_id).await;
            return;
        };
        let key = raw_key.as_str().map(str::to_string).unwrap_or_else(|| raw_key.to_string());

        let opposite = self.buffer(side.opposite());
        match self.take_with_retry(opposite, &key).await {
            Ok(Some(bytes)) => {
                let Ok(partner) = serde_json::from_slice::<Parked>(&bytes) else {
                    warn!("corrupt buffer entry for key {key}, dropping");
                    return;
                };
                let (left, right) = match side {
                    Side::Left => (&record, &partner.record),
                    Side::Right => (&partner.record, &record),
                };
                let merged = self.merge(left, right);
                let payload = match serde_json::to_vec(&merged) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to encode merged record");
                        return;
                    }
                };
                if let Err(e) = self.bus.publish(&self.config.output_stream_id, payload, None).await {
                    warn!(error = %e, "failed to publish merged record, nak-ing");
                    let _ = own_consumer.lock().await.nak(&delivery_id).await;
                    return;
                }
                let _ = own_consumer.lock().await.ack(&delivery_id).await;
                let _ = opposite_consumer.lock().await.ack(&partner.delivery_id).await;
            }
            Ok(None) => {
                let parked = Parked { record, delivery_id };
                let bytes = match serde_json::to_vec(&parked) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "failed to encode parked record");
                        return;
                    }
                };
                let own = self.buffer(side);
                if let Ok(Some(old)) = self.take_with_retry(own, &key).await {
                    if let Ok(old_parked) = serde_json::from_slice::<Parked>(&old) {
                        let _ = own_consumer.lock().await.ack(&old_parked.delivery_id).await;
                    }
                }
                if let Err(e) = own.put(&key, bytes, self.config.window_ttl).await {
                    warn!(error = %e, "buffer write failed, nak-ing");
                    let _ = own_consumer.lock().await.nak(&parked.delivery_id).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "buffer read failed after retries, nak-ing");
                let _ = own_consumer.lock().await.nak(&delivery_id).await;
            }
        }
    }

    async fn take_with_retry(&self, buffer: &Arc<dyn KvStore>, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let mut last_err = None;
        for _ in 0..BUFFER_RETRY_ATTEMPTS {
            match buffer.take(key).await {
                Ok(v) => return Ok(v),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::StoreUnavailable("buffer read failed".to_string())))
    }

    /// Periodically sweeps both buffers, releasing acks for entries that
    /// expired without a partner (§4.4 step 4).
    async fn sweep_once(&self, own_consumer: &Mutex<Box<dyn Consumer>>, buffer: &Arc<dyn KvStore>) {
        match buffer.sweep_expired().await {
            Ok(expired) => {
                for (_, bytes) in expired {
                    if let Ok(parked) = serde_json::from_slice::<Parked>(&bytes) {
                        let _ = own_consumer.lock().await.ack(&parked.delivery_id).await;
                    }
                }
            }
            Err(e) => warn!(error = %e, "sweep failed"),
        }
    }
}

#[async_trait]
impl Runner for JoinerRunner {
    fn kind(&self) -> ComponentKind {
        ComponentKind::Joiner
    }

    async fn run(&mut self, cancel: CancellationToken) -> Result<(), CoreError> {
        self.bus
            .ensure_stream(&self.config.output_stream_id, self.config.window_ttl)
            .await?;

        let left_consumer = Mutex::new(
            self.bus
                .subscribe(&self.config.left_stream_id, &self.config.group_id, JOINER_MAX_ACK_PENDING)
                .await?,
        );
        let right_consumer = Mutex::new(
            self.bus
                .subscribe(&self.config.right_stream_id, &self.config.group_id, JOINER_MAX_ACK_PENDING)
                .await?,
        );

        let mut sweep_tick = tokio::time::interval(self.config.sweep_interval);
        info!(pipeline = %self.config.pipeline_id, "joiner started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sweep_tick.tick() => {
                    self.sweep_once(&left_consumer, &self.left_buffer).await;
                    self.sweep_once(&right_consumer, &self.right_buffer).await;
                }
                left = async { left_consumer.lock().await.next().await } => {
                    match left {
                        Ok(Some(delivery)) => {
                            if let Ok(record) = serde_json::from_slice::<Record>(&delivery.payload) {
                                self.handle_record(Side::Left, record, delivery.delivery_id, &left_consumer, &right_consumer).await;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => warn!(error = %e, "left consumer error"),
                    }
                }
                right = async { right_consumer.lock().await.next().await } => {
                    match right {
                        Ok(Some(delivery)) => {
                            if let Ok(record) = serde_json::from_slice::<Record>(&delivery.payload) {
                                self.handle_record(Side::Right, record, delivery.delivery_id, &right_consumer, &left_consumer).await;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => warn!(error = %e, "right consumer error"),
                    }
                }
            }
        }

        info!(pipeline = %self.config.pipeline_id, "joiner stopped");
        Ok(())
    }
}

/// Builds a `SchemaMapper` scoped to this joiner's mapping entries, for
/// callers that want `left_stream()`/`right_stream()` resolution alongside
/// the runner (the runner itself only needs the raw mapping vector).
pub fn schema_mapper(join: glassflow_core::config::JoinSpec, mapping: Vec<TableMapping>) -> SchemaMapper {
    SchemaMapper::new(Some(join), mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glassflow_bus::memory::{MemoryBus, MemoryKvStore};
    use serde_json::json;
    use std::time::Duration as StdDuration;

    /// Gives the runner's `bus.subscribe` calls time to register before the
    /// test starts publishing — the in-process bus fans out only to
    /// already-subscribed groups (§4.6 has no replayed log to catch up on).
    const SETTLE: StdDuration = StdDuration::from_millis(50);

    fn config(group_id: &str) -> JoinerConfig {
        JoinerConfig {
            pipeline_id: "p1".to_string(),
            left_stream_id: "p1-emails".to_string(),
            right_stream_id: "p1-users".to_string(),
            left_source_id: "emails".to_string(),
            right_source_id: "users".to_string(),
            left_key: "user_id".to_string(),
            right_key: "id".to_string(),
            window_ttl: StdDuration::from_secs(3600),
            output_stream_id: "p1-joined".to_string(),
            group_id: group_id.to_string(),
            sweep_interval: StdDuration::from_millis(20),
        }
    }

    fn mapping() -> Vec<TableMapping> {
        vec![
            TableMapping {
                source_id: "emails".to_string(),
                source_field: "user_id".to_string(),
                source_type: "int".to_string(),
                destination_column: "user_id".to_string(),
                destination_type: "Int64".to_string(),
            },
            TableMapping {
                source_id: "emails".to_string(),
                source_field: "email".to_string(),
                source_type: "string".to_string(),
                destination_column: "email".to_string(),
                destination_type: "String".to_string(),
            },
            TableMapping {
                source_id: "users".to_string(),
                source_field: "id".to_string(),
                source_type: "int".to_string(),
                destination_column: "id".to_string(),
                destination_type: "Int64".to_string(),
            },
            TableMapping {
                source_id: "users".to_string(),
                source_field: "name".to_string(),
                source_type: "string".to_string(),
                destination_column: "name".to_string(),
                destination_type: "String".to_string(),
            },
        ]
    }

    async fn spawn_runner(group_id: &str) -> (Arc<dyn StreamBus>, CancellationToken) {
        let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
        bus.ensure_stream("p1-emails", StdDuration::from_secs(3600)).await.unwrap();
        bus.ensure_stream("p1-users", StdDuration::from_secs(3600)).await.unwrap();
        bus.ensure_stream("p1-joined", StdDuration::from_secs(3600)).await.unwrap();

        let dlq = glassflow_bus::dlq::start(bus.clone(), 16);
        let left_buffer: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let right_buffer: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let mut runner = JoinerRunner::new(config(group_id), bus.clone(), left_buffer, right_buffer, mapping(), dlq);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            let _ = runner.run(child).await;
        });
        tokio::time::sleep(SETTLE).await;
        (bus, cancel)
    }

    async fn publish_json(bus: &Arc<dyn StreamBus>, stream: &str, payload: serde_json::Value, source_id: &str) {
        let record = Record::new(payload, source_id, uuid::Uuid::new_v4().to_string(), Utc::now());
        bus.publish(stream, serde_json::to_vec(&record).unwrap(), None).await.unwrap();
    }

    #[tokio::test]
    async fn matching_keys_on_opposite_sides_emit_exactly_one_merged_record() {
        let (bus, cancel) = spawn_runner("g1").await;
        let mut output = bus.subscribe("p1-joined", "test-reader", 100).await.unwrap();

        publish_json(&bus, "p1-emails", json!({"user_id": 123, "email": "a@x.com"}), "emails").await;
        publish_json(&bus, "p1-users", json!({"id": 123, "name": "J"}), "users").await;

        let delivery = tokio::time::timeout(StdDuration::from_secs(2), output.next())
            .await
            .expect("joiner should emit within timeout")
            .unwrap()
            .unwrap();
        let merged: Record = serde_json::from_slice(&delivery.payload).unwrap();
        // Invariant 4: the two constituents must agree on the join-key value
        // after projection.
        assert_eq!(merged.field("user_id").unwrap(), &json!(123));
        assert_eq!(merged.field("id").unwrap(), &json!(123));
        assert_eq!(merged.field("email").unwrap(), &json!("a@x.com"));
        assert_eq!(merged.field("name").unwrap(), &json!("J"));

        assert!(tokio::time::timeout(StdDuration::from_millis(100), output.next()).await.is_err(), "no second emission expected");
        cancel.cancel();
    }

    #[tokio::test]
    async fn unmatched_right_record_produces_no_output() {
        let (bus, cancel) = spawn_runner("g2").await;
        let mut output = bus.subscribe("p1-joined", "test-reader", 100).await.unwrap();

        publish_json(&bus, "p1-users", json!({"id": 456, "name": "Nobody"}), "users").await;

        assert!(
            tokio::time::timeout(StdDuration::from_millis(200), output.next()).await.is_err(),
            "an unmatched key must never emit a merged record"
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn same_side_duplicate_key_overwrites_the_unmatched_parked_entry() {
        let (bus, cancel) = spawn_runner("g3").await;
        let mut output = bus.subscribe("p1-joined", "test-reader", 100).await.unwrap();

        // Two emails for the same unmatched key 789; the second overwrites
        // the first (§4.4 ordering/tie-breaks).
        publish_json(&bus, "p1-emails", json!({"user_id": 789, "email": "b@x.com"}), "emails").await;
        publish_json(&bus, "p1-emails", json!({"user_id": 789, "email": "c@x.com"}), "emails").await;
        publish_json(&bus, "p1-users", json!({"id": 789, "name": "B"}), "users").await;

        let delivery = tokio::time::timeout(StdDuration::from_secs(2), output.next())
            .await
            .expect("joiner should emit within timeout")
            .unwrap()
            .unwrap();
        let merged: Record = serde_json::from_slice(&delivery.payload).unwrap();
        // Only the overwriting record ("c") survives; "b" was displaced and
        // never merges.
        assert_eq!(merged.field("email").unwrap(), &json!("c@x.com"));

        assert!(tokio::time::timeout(StdDuration::from_millis(100), output.next()).await.is_err(), "no second emission expected");
        cancel.cancel();
    }
}
