//! Dead-letter publishing: drains an `mpsc` channel of `DlqMessage`s onto a
//! per-pipeline DLQ stream via the bus, mirroring the teacher pack's
//! DSH SDK `Dlq` (spawn-a-task-and-hand-back-a-channel), generalized from a
//! direct Kafka producer to the `StreamBus` contract.

use std::sync::Arc;
use std::time::Duration;

use glassflow_core::model::DlqMessage;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::StreamBus;

/// One week, long enough for an operator to notice and drain the DLQ by hand.
const DLQ_MESSAGE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

pub type DlqChannel = mpsc::Sender<DlqMessage>;

/// Spawns the DLQ publisher task, returning a channel runners can send
/// `DlqMessage`s to. The task runs until the last sender is dropped.
pub fn start(bus: Arc<dyn StreamBus>, capacity: usize) -> DlqChannel {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(run(bus, rx));
    tx
}

async fn run(bus: Arc<dyn StreamBus>, mut rx: mpsc::Receiver<DlqMessage>) {
    info!("dlq publisher started");
    while let Some(message) = rx.recv().await {
        let stream_id = format!("{}-DLQ", message.pipeline_id);
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode dlq message, dropping");
                continue;
            }
        };

        if let Err(e) = bus.ensure_stream(&stream_id, DLQ_MESSAGE_TTL).await {
            error!(error = %e, stream = %stream_id, "failed to ensure dlq stream");
            continue;
        }
        if let Err(e) = bus.publish(&stream_id, payload, None).await {
            error!(error = %e, stream = %stream_id, "failed to publish dlq message");
        }
    }
    warn!("dlq publisher stopped: channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;
    use crate::Consumer;
    use chrono::Utc;
    use glassflow_core::model::DlqComponent;

    #[tokio::test]
    async fn routed_message_lands_on_the_pipeline_dlq_stream() {
        let bus: Arc<dyn StreamBus> = Arc::new(MemoryBus::new());
        bus.ensure_stream("p1-DLQ", DLQ_MESSAGE_TTL).await.unwrap();
        let mut consumer = bus.subscribe("p1-DLQ", "test", 100).await.unwrap();

        let tx = start(bus.clone(), 10);
        tx.send(DlqMessage {
            pipeline_id: "p1".to_string(),
            component: DlqComponent::Ingestor,
            original: b"{}".to_vec(),
            error_kind: "SchemaMissingField".to_string(),
            error_detail: "missing field: id".to_string(),
            failed_at: Utc::now(),
        })
        .await
        .unwrap();

        let delivery = consumer.next().await.unwrap().unwrap();
        let decoded: DlqMessage = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(decoded.pipeline_id, "p1");
        assert_eq!(decoded.error_kind, "SchemaMissingField");
    }
}
