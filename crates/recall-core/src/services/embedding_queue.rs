//! Background embedding generation.
//!
//! Memory writes enqueue an [`EmbeddingJob`] and return right away. A single
//! worker task embeds the content, stores the vector and records the
//! embedding id on the memory. Failures never reach the caller; they are
//! logged under the `recall::embedding_jobs` target and counted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use recall_models::{MemoryRecord, MemoryType};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use super::index::{EmbeddingIndex, PointMetadata};
use crate::db::{self, DbPool};

/// Log target for everything the worker does.
pub const JOB_LOG_TARGET: &str = "recall::embedding_jobs";

/// Embed one memory and attach the resulting id.
#[derive(Debug, Clone)]
pub struct EmbeddingJob {
    pub tenant_id: String,
    pub memory_id: String,
    pub user_id: String,
    pub memory_type: MemoryType,
    pub subject: Option<String>,
    pub content: String,
    /// Point describing an older version of the content, removed once the
    /// new one is attached
    pub replaces: Option<String>,
}

impl EmbeddingJob {
    pub fn for_record(record: &MemoryRecord) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            memory_id: record.id.clone(),
            user_id: record.user_id.clone(),
            memory_type: record.memory_type,
            subject: record.subject.clone(),
            content: record.content.clone(),
            replaces: None,
        }
    }

    pub fn replacing(mut self, embedding_id: Option<String>) -> Self {
        self.replaces = embedding_id;
        self
    }
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn finish_one(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingQueue {
    tx: mpsc::UnboundedSender<EmbeddingJob>,
    pending: Arc<Pending>,
}

impl EmbeddingQueue {
    /// Spawn the worker. It stops once every queue handle is dropped.
    pub fn start(index: EmbeddingIndex, db: DbPool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Pending::default());

        tokio::spawn(run_worker(rx, index, db, pending.clone()));
        info!(target: JOB_LOG_TARGET, "Embedding worker started");

        Self { tx, pending }
    }

    /// Queue a job. Never blocks.
    pub fn enqueue(&self, job: EmbeddingJob) {
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            self.pending.finish_one();
            warn!(
                target: JOB_LOG_TARGET,
                tenant_id = %job.tenant_id,
                memory_id = %job.memory_id,
                "Embedding worker is gone, job dropped"
            );
            metrics::counter!("recall_embedding_job_failures_total", "stage" => "enqueue")
                .increment(1);
        }
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    /// Resolve once every job queued so far has been processed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<EmbeddingJob>,
    index: EmbeddingIndex,
    db: DbPool,
    pending: Arc<Pending>,
) {
    while let Some(job) = rx.recv().await {
        process(&index, &db, job).await;
        pending.finish_one();
    }
    info!(target: JOB_LOG_TARGET, "Embedding worker stopped");
}

async fn process(index: &EmbeddingIndex, db: &DbPool, job: EmbeddingJob) {
    let metadata = PointMetadata {
        user_id: job.user_id.clone(),
        memory_type: job.memory_type,
        subject: job.subject.clone(),
    };

    let embedding_id = index
        .embed_and_store(&job.tenant_id, &job.memory_id, &job.content, &metadata)
        .await;

    let current = match db::get_memory(db, &job.memory_id).await {
        Ok(record) => record,
        Err(e) => {
            warn!(
                target: JOB_LOG_TARGET,
                tenant_id = %job.tenant_id,
                memory_id = %job.memory_id,
                error = %e,
                "Memory lookup failed, discarding embedding"
            );
            metrics::counter!("recall_embedding_job_failures_total", "stage" => "lookup")
                .increment(1);
            index.delete(&job.tenant_id, &embedding_id).await;
            return;
        }
    };

    // Deleted while queued: the point would only describe a forgotten fact
    if current.is_deleted {
        debug!(
            target: JOB_LOG_TARGET,
            memory_id = %job.memory_id,
            "Memory deleted before embedding was attached"
        );
        index.delete(&job.tenant_id, &embedding_id).await;
        return;
    }

    if let Err(e) = db::set_embedding_id(db, &job.tenant_id, &job.memory_id, &embedding_id).await {
        warn!(
            target: JOB_LOG_TARGET,
            tenant_id = %job.tenant_id,
            memory_id = %job.memory_id,
            error = %e,
            "Failed to attach embedding id"
        );
        metrics::counter!("recall_embedding_job_failures_total", "stage" => "attach")
            .increment(1);
        index.delete(&job.tenant_id, &embedding_id).await;
        return;
    }

    let stale: Vec<String> = job
        .replaces
        .into_iter()
        .chain(current.embedding_id)
        .filter(|id| *id != embedding_id)
        .collect();
    index.delete_many(&job.tenant_id, stale).await;

    debug!(
        target: JOB_LOG_TARGET,
        tenant_id = %job.tenant_id,
        memory_id = %job.memory_id,
        embedding_id = %embedding_id,
        "Embedding attached"
    );
}
