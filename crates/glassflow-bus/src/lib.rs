//! The `StreamBus`/`KvStore` contracts (§4.6) plus an in-process default
//! implementation, the way the teacher's `rde_core::Source`/`Sink` traits
//! are contracts satisfied by concrete `rde_io` adapters.

pub mod dlq;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use glassflow_core::CoreError;

/// One message handed to a consumer, awaiting ack/nak.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: String,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
}

/// A durable, named stream with per-stream message TTL and message-id
/// dedup, consumer groups with explicit ack/nak/extend (§4.6).
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Creates the stream if it doesn't already exist; idempotent.
    async fn ensure_stream(&self, stream_id: &str, message_ttl: Duration) -> Result<(), CoreError>;

    /// Publishes `payload` to `stream_id`. When `message_id` is `Some`, a
    /// publish carrying a message-id already seen within the stream's dedup
    /// window is silently accepted without producing a duplicate delivery.
    async fn publish(&self, stream_id: &str, payload: Vec<u8>, message_id: Option<&str>) -> Result<(), CoreError>;

    /// Opens (or resumes) a named consumer group on `stream_id`. `max_ack_pending`
    /// bounds how many deliveries this group may hold unacknowledged at once —
    /// the backpressure contract §4.5 hangs the sink's worker-pool sizing on
    /// (`workers × 2 × max_batch_size`, floored at `2 × max_batch_size`).
    /// `next()` blocks once the bound is reached until an outstanding delivery
    /// is ack'd or nak'd.
    async fn subscribe(&self, stream_id: &str, group_id: &str, max_ack_pending: usize) -> Result<Box<dyn Consumer>, CoreError>;
}

/// A consumer-group handle: pulls deliveries and resolves them with
/// ack/nak/extend.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Blocks until the next delivery is available or the stream is closed.
    async fn next(&mut self) -> Result<Option<Delivery>, CoreError>;

    /// Acknowledges successful processing; the delivery will not be redelivered.
    async fn ack(&self, delivery_id: &str) -> Result<(), CoreError>;

    /// Negatively acknowledges; the delivery becomes eligible for redelivery.
    async fn nak(&self, delivery_id: &str) -> Result<(), CoreError>;

    /// Extends the in-progress visibility window for a delivery still being worked.
    async fn extend(&self, delivery_id: &str) -> Result<(), CoreError>;
}

/// A per-entry-TTL key/value store with atomic read-modify-write (§4.6),
/// used by the joiner for its partner buffer and by dedup for seen-id sets.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Inserts or overwrites `key`, expiring after `ttl`.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CoreError>;

    /// Atomically reads and removes `key`, returning `None` if absent or
    /// already expired. This is the single operation the joiner's "check
    /// partner, remove if found" rule (§4.4) and dedup's "check-then-insert"
    /// rule (§4.2) both rely on for invariant 3 (KV operations race-free
    /// under concurrent ingestors).
    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;

    /// Sweeps and removes all entries past their expiry, returning each
    /// removed `(key, value)` pair so a caller parking acks against buffered
    /// entries (the joiner, §4.4) can release them. Drives watch-expiration
    /// (§4.6) for implementations that don't expire lazily on every read.
    async fn sweep_expired(&self) -> Result<Vec<(String, Vec<u8>)>, CoreError>;
}

/// Creates fresh `KvStore` instances, one per named buffer (§6: "one store
/// per join source, named `<pipeline_id>-<source_id>-buf`"). The
/// orchestrator holds one factory and calls it once per buffer it needs to
/// provision; an external durable KV implementation would satisfy this by
/// opening (or reusing) a named bucket instead of allocating in-process state.
pub trait KvStoreFactory: Send + Sync {
    fn create(&self, name: &str) -> std::sync::Arc<dyn KvStore>;
}

/// Default factory backing every named buffer with an independent
/// in-process `MemoryKvStore`.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStoreFactory;

impl KvStoreFactory for MemoryKvStoreFactory {
    fn create(&self, _name: &str) -> std::sync::Arc<dyn KvStore> {
        std::sync::Arc::new(memory::MemoryKvStore::new())
    }
}
