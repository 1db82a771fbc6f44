//! In-process default implementation of `StreamBus`/`KvStore`, sufficient
//! for single-node operation and for this workspace's own tests — the
//! durable bus itself is an external collaborator (§4.6); an external
//! adapter (NATS JetStream or similar) would satisfy the same traits.
//!
//! Streams fan delivery out to consumer groups via `tokio::sync::mpsc`
//! channels set up at `subscribe` time rather than replaying a retained
//! log, and `nak` requeues onto the same group's channel. This keeps the
//! store race-free under `tokio::sync::Mutex`-guarded maps without needing
//! a redelivery timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use glassflow_core::CoreError;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{Consumer, Delivery, StreamBus};

struct StreamState {
    ttl: Duration,
    dedup: HashMap<String, Instant>,
    groups: HashMap<String, mpsc::UnboundedSender<Delivery>>,
}

/// In-process `StreamBus`. Cloning shares the same underlying streams.
#[derive(Clone, Default)]
pub struct MemoryBus {
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamBus for MemoryBus {
    async fn ensure_stream(&self, stream_id: &str, message_ttl: Duration) -> Result<(), CoreError> {
        let mut streams = self.streams.lock().await;
        streams.entry(stream_id.to_string()).or_insert_with(|| StreamState {
            ttl: message_ttl,
            dedup: HashMap::new(),
            groups: HashMap::new(),
        });
        Ok(())
    }

    async fn publish(&self, stream_id: &str, payload: Vec<u8>, message_id: Option<&str>) -> Result<(), CoreError> {
        let mut streams = self.streams.lock().await;
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| CoreError::BusUnavailable(format!("stream not found: {stream_id}")))?;

        let now = Instant::now();
        stream.dedup.retain(|_, expiry| *expiry > now);

        if let Some(id) = message_id {
            if stream.dedup.contains_key(id) {
                return Ok(());
            }
            stream.dedup.insert(id.to_string(), now + stream.ttl);
        }

        let delivery = Delivery {
            delivery_id: Uuid::new_v4().to_string(),
            payload,
            message_id: message_id.map(str::to_string),
        };

        stream.groups.retain(|_, sender| {
            let delivery = delivery.clone();
            sender.send(delivery).is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, stream_id: &str, group_id: &str, max_ack_pending: usize) -> Result<Box<dyn Consumer>, CoreError> {
        let mut streams = self.streams.lock().await;
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| CoreError::BusUnavailable(format!("stream not found: {stream_id}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        stream.groups.insert(group_id.to_string(), tx.clone());

        Ok(Box::new(MemoryConsumer {
            requeue: tx,
            rx,
            inflight: Mutex::new(HashMap::new()),
            pending: Arc::new(Semaphore::new(max_ack_pending.max(1))),
        }))
    }
}

struct MemoryConsumer {
    requeue: mpsc::UnboundedSender<Delivery>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    inflight: Mutex<HashMap<String, (Delivery, OwnedSemaphorePermit)>>,
    /// Gates how many deliveries may be held unacked at once; `next()`
    /// acquires a permit before dequeuing and releases it on ack/nak,
    /// emulating the bus contract's `max_ack_pending` bound (§4.6).
    pending: Arc<Semaphore>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, CoreError> {
        let permit = self
            .pending
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| CoreError::BusUnavailable(e.to_string()))?;
        match self.rx.recv().await {
            Some(delivery) => {
                self.inflight
                    .lock()
                    .await
                    .insert(delivery.delivery_id.clone(), (delivery.clone(), permit));
                Ok(Some(delivery))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery_id: &str) -> Result<(), CoreError> {
        self.inflight.lock().await.remove(delivery_id);
        Ok(())
    }

    async fn nak(&self, delivery_id: &str) -> Result<(), CoreError> {
        let entry = self.inflight.lock().await.remove(delivery_id);
        if let Some((delivery, _permit)) = entry {
            let _ = self.requeue.send(delivery);
        }
        Ok(())
    }

    async fn extend(&self, _delivery_id: &str) -> Result<(), CoreError> {
        // No redelivery timer in this in-process store; extension is a no-op.
        Ok(())
    }
}

/// In-process `KvStore` backed by a single mutex-guarded map.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<Mutex<HashMap<String, (Vec<u8>, Instant)>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::KvStore for MemoryKvStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CoreError> {
        self.entries.lock().await.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some((value, expiry)) if expiry > Instant::now() => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    async fn sweep_expired(&self) -> Result<Vec<(String, Vec<u8>)>, CoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired_keys: Vec<String> = entries
            .iter()
            .filter(|(_, (_, expiry))| *expiry <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some((value, _)) = entries.remove(&key) {
                removed.push((key, value));
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KvStore;

    #[tokio::test]
    async fn publish_dedups_within_window() {
        let bus = MemoryBus::new();
        bus.ensure_stream("s", Duration::from_secs(60)).await.unwrap();
        let mut consumer = bus.subscribe("s", "g", 100).await.unwrap();
        bus.publish("s", b"a".to_vec(), Some("id-1")).await.unwrap();
        bus.publish("s", b"b".to_vec(), Some("id-1")).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"a");
    }

    #[tokio::test]
    async fn nak_requeues_the_delivery() {
        let bus = MemoryBus::new();
        bus.ensure_stream("s", Duration::from_secs(60)).await.unwrap();
        let mut consumer = bus.subscribe("s", "g", 100).await.unwrap();
        bus.publish("s", b"a".to_vec(), None).await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        consumer.nak(&delivery.delivery_id).await.unwrap();
        let redelivered = consumer.next().await.unwrap().unwrap();
        assert_eq!(redelivered.payload, b"a");
    }

    #[tokio::test]
    async fn kv_take_is_once_only() {
        let kv = MemoryKvStore::new();
        kv.put("k", b"v".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.take("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(kv.take("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn kv_sweep_removes_expired_entries() {
        let kv = MemoryKvStore::new();
        kv.put("k", b"v".to_vec(), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let removed = kv.sweep_expired().await.unwrap();
        assert_eq!(removed, vec![("k".to_string(), b"v".to_vec())]);
        assert_eq!(kv.take("k").await.unwrap(), None);
    }
}
