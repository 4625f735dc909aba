use std::sync::Arc;

use tokio::sync::mpsc::Receiver;
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::{DataBrokerData, Record};

/// Applies records pushed by the directory stream until the sender side is dropped.
///
/// Each record takes the write lock on its own, so a check holding the read lock
/// delays the update rather than observing half of it.
pub async fn run_record_sync(data: Arc<RwLock<DataBrokerData>>, rx: Receiver<Record>) {
    let mut stream = ReceiverStream::new(rx);
    let mut applied = 0usize;
    let mut skipped = 0usize;

    while let Some(record) = stream.next().await {
        let (record_type, id, version) = (record.record_type, record.id.clone(), record.version);
        if data.write().await.update(record) {
            applied += 1;
            debug!(%record_type, %id, version, "applied streamed record");
        } else {
            skipped += 1;
        }
    }

    info!(applied, skipped, "directory record stream closed");
}
