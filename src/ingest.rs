//! Single-writer ingestion channel.
//!
//! Every producer pushes tagged records onto one shared channel; a single
//! writer task drains it and performs all store writes, so the file-backed
//! store never sees concurrent mutation. The stream ends with an explicit
//! `Shutdown` message sent by the orchestrator after all producers joined.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::records::Record;
use crate::store::Store;

/// Message envelope carried over the ingestion channel.
#[derive(Debug)]
pub enum IngestMessage {
    Record(Record),
    /// Termination signal understood only by the writer.
    Shutdown,
}

pub type IngestSender = mpsc::UnboundedSender<IngestMessage>;
pub type IngestReceiver = mpsc::UnboundedReceiver<IngestMessage>;

pub const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_millis(200);

pub fn channel() -> (IngestSender, IngestReceiver) {
    mpsc::unbounded_channel()
}

/// Spawn the writer task. It owns all store writes until it receives
/// `Shutdown` (or the channel closes), flushes its remaining batch and
/// returns the total number of persisted records.
pub fn spawn_writer(store: Store, rx: IngestReceiver) -> JoinHandle<Result<u64>> {
    tokio::spawn(writer_task(store, rx))
}

async fn writer_task(store: Store, mut rx: IngestReceiver) -> Result<u64> {
    let mut batch: Vec<Record> = Vec::with_capacity(BATCH_SIZE);
    let mut written = 0u64;

    let mut flush_timer = tokio::time::interval(FLUSH_INTERVAL);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(IngestMessage::Record(record)) => {
                    batch.push(record);
                    if batch.len() >= BATCH_SIZE {
                        written += flush(&store, &mut batch).await?;
                    }
                }
                Some(IngestMessage::Shutdown) | None => {
                    written += flush(&store, &mut batch).await?;
                    break;
                }
            },
            _ = flush_timer.tick() => {
                if !batch.is_empty() {
                    written += flush(&store, &mut batch).await?;
                }
            }
        }
    }

    tracing::info!(records = written, "ingestion writer stopped");
    Ok(written)
}

async fn flush(store: &Store, batch: &mut Vec<Record>) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }
    let count = batch.len() as u64;
    store.insert_batch(batch).await?;
    tracing::debug!(count, "flushed record batch");
    batch.clear();
    Ok(count)
}
