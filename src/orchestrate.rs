//! Run coordinator.
//!
//! Spawns one producer task per selected source (one per account for the
//! log service), a single writer draining the shared channel, and a
//! liveness display. Ctrl-C trips the cancellation token; producers observe
//! it at their next pagination or polling boundary.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Secrets};
use crate::error::{ExtractError, Result};
use crate::extract::{cloudwatch, gitlab, jira};
use crate::ingest::{self, IngestMessage, IngestSender};
use crate::records::Source;
use crate::store::Store;

struct Producer {
    name: String,
    done: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Run the selected sources to completion and return the number of records
/// the writer persisted.
pub async fn run(
    sources: &[Source],
    config: Arc<Config>,
    secrets: Arc<Secrets>,
    store: &Store,
    jira_export: &Path,
) -> Result<u64> {
    for source in sources {
        store.clear(*source).await?;
    }

    let (tx, rx) = ingest::channel();
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping extraction");
            ctrl_c.cancel();
        }
    });

    let mut producers = Vec::new();
    for source in sources {
        match source {
            Source::CloudWatch => {
                for account_id in config.account_ids() {
                    let config = config.clone();
                    let secrets = secrets.clone();
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    let id = account_id.clone();
                    producers.push(spawn_producer(
                        format!("cloudwatch[{account_id}]"),
                        async move { cloudwatch::run(id, config, secrets, tx, cancel).await },
                    ));
                }
            }
            Source::GitLab => {
                let config = config.clone();
                let secrets = secrets.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                producers.push(spawn_producer("gitlab".to_string(), async move {
                    gitlab::run(config, secrets, tx, cancel).await
                }));
            }
            Source::Jira => {
                let path: PathBuf = jira_export.to_path_buf();
                let tx: IngestSender = tx.clone();
                let cancel = cancel.clone();
                producers.push(spawn_producer("jira".to_string(), async move {
                    jira::run(&path, tx, cancel).await
                }));
            }
        }
    }

    let writer = ingest::spawn_writer(store.clone(), rx);

    watch_producers(&mut producers).await;

    let _ = tx.send(IngestMessage::Shutdown);
    drop(tx);

    writer
        .await
        .map_err(|e| ExtractError::Internal(format!("writer task panicked: {e}")))?
}

/// Wrap a producer future: failures are logged, never propagated, so one
/// failing source does not abort the others.
fn spawn_producer<F>(name: String, future: F) -> Producer
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let task_name = name.clone();
    let handle = tokio::spawn(async move {
        match future.await {
            Ok(()) => tracing::info!(producer = %task_name, "extraction finished"),
            Err(error) if error.is_cancellation() => {
                tracing::warn!(producer = %task_name, "extraction cancelled")
            }
            Err(error) => tracing::error!(producer = %task_name, %error, "extraction failed"),
        }
        flag.store(true, Ordering::SeqCst);
    });
    Producer { name, done, handle }
}

/// Show a spinner per producer until every producer task finished.
async fn watch_producers(producers: &mut Vec<Producer>) {
    let display = MultiProgress::new();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());

    let mut bars = Vec::new();
    for producer in producers.iter() {
        let bar = display.add(ProgressBar::new_spinner());
        bar.set_style(style.clone());
        bar.set_message(producer.name.clone());
        bar.enable_steady_tick(Duration::from_millis(120));
        bars.push(bar);
    }

    loop {
        let mut all_done = true;
        for (producer, bar) in producers.iter().zip(&bars) {
            if producer.done.load(Ordering::SeqCst) {
                if !bar.is_finished() {
                    bar.finish_with_message(format!("{} +", producer.name));
                }
            } else {
                all_done = false;
            }
        }
        if all_done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    for producer in producers.drain(..) {
        if let Err(error) = producer.handle.await {
            tracing::error!(producer = %producer.name, %error, "producer task panicked");
        }
    }
}
