//! Cache worker pool
//!
//! Bounded pool that writes freshly computed manifests to L2 and L3 off the
//! request path. Enqueue never blocks: a full queue drops the job and the next
//! read recomputes. Failed jobs are retried with linear backoff.

use crate::cache::{CacheKey, PermissionCache};
use crate::config::WorkerConfig;
use crate::error::{AuthzError, Result};
use crate::manifest::PermissionManifest;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// One L2+L3 population request
#[derive(Debug, Clone)]
pub struct CacheJob {
    pub key: CacheKey,
    pub manifest: Arc<PermissionManifest>,
    /// Cache generation observed before the manifest was computed
    pub generation: u64,
    pub retry_count: u32,
}

impl CacheJob {
    pub fn new(key: CacheKey, manifest: Arc<PermissionManifest>, generation: u64) -> Self {
        Self {
            key,
            manifest,
            generation,
            retry_count: 0,
        }
    }
}

/// Worker pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub enqueued: u64,
    pub processed: u64,
    pub retried: u64,
    /// Rejected because the queue was full or the pool stopped
    pub dropped: u64,
    /// Gave up after the last retry
    pub failed: u64,
    /// Skipped because the key was invalidated after the job was created
    pub stale: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every worker task
struct Shared {
    cache: Arc<PermissionCache>,
    config: WorkerConfig,
    sender: mpsc::Sender<CacheJob>,
    receiver: Mutex<mpsc::Receiver<CacheJob>>,
    shutdown: CancellationToken,
    counters: Counters,
}

/// Bounded pool of cache-population workers
pub struct CacheWorkerPool {
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

impl CacheWorkerPool {
    /// Spawn `config.workers` workers on the current runtime
    pub fn start(config: WorkerConfig, cache: Arc<PermissionCache>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let workers = config.workers;

        let shared = Arc::new(Shared {
            cache,
            config,
            sender,
            receiver: Mutex::new(receiver),
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
        });

        let tracker = TaskTracker::new();
        for id in 0..workers {
            tracker.spawn(run_worker(id, shared.clone()));
        }
        tracker.close();

        info!(workers, "cache worker pool started");

        Self { shared, tracker }
    }

    /// Queue a job without waiting; false when it was dropped
    pub fn enqueue(&self, job: CacheJob) -> bool {
        if self.shared.shutdown.is_cancelled() {
            Counters::bump(&self.shared.counters.dropped);
            debug!(user_id = %job.key.user_id, "worker pool stopped, dropping cache job");
            return false;
        }

        match self.shared.sender.try_send(job) {
            Ok(()) => {
                Counters::bump(&self.shared.counters.enqueued);
                true
            }
            Err(TrySendError::Full(job)) => {
                Counters::bump(&self.shared.counters.dropped);
                warn!(
                    user_id = %job.key.user_id,
                    organization_id = %job.key.organization_id,
                    "cache job queue full, dropping job"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                Counters::bump(&self.shared.counters.dropped);
                false
            }
        }
    }

    /// Signal shutdown and wait up to `deadline` for workers to drain
    ///
    /// Safe to call more than once.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.shared.shutdown.cancel();
        self.tracker.close();

        tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .map_err(|_| AuthzError::Timeout("cache workers did not drain before the deadline".into()))?;

        info!("cache worker pool stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.is_cancelled()
    }

    /// Jobs waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.shared.sender.max_capacity() - self.shared.sender.capacity()
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.counters.snapshot()
    }
}

impl Drop for CacheWorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn run_worker(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "cache worker started");

    loop {
        let job = {
            let mut receiver = shared.receiver.lock().await;
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => None,
                job = receiver.recv() => job,
            }
        };
        match job {
            Some(job) => process(&shared, job, true).await,
            None => break,
        }
    }

    // Drain what is already queued, without retries
    loop {
        let next = shared.receiver.lock().await.try_recv();
        match next {
            Ok(job) => process(&shared, job, false).await,
            Err(_) => break,
        }
    }

    debug!(worker = id, "cache worker exited");
}

async fn process(shared: &Shared, mut job: CacheJob, retry: bool) {
    if !shared.cache.is_current(&job.key, job.generation) {
        Counters::bump(&shared.counters.stale);
        debug!(
            user_id = %job.key.user_id,
            organization_id = %job.key.organization_id,
            "cache key invalidated since job was queued, skipping"
        );
        return;
    }

    let cached = job.manifest.to_cached();
    let outcome = tokio::time::timeout(
        shared.config.job_timeout,
        shared
            .cache
            .set_shared(&job.key, &cached, shared.config.cache_ttl),
    )
    .await;

    let failure = match outcome {
        Ok(Ok(())) => {
            Counters::bump(&shared.counters.processed);
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", shared.config.job_timeout),
    };

    if !retry || job.retry_count >= shared.config.max_retries {
        Counters::bump(&shared.counters.failed);
        error!(
            user_id = %job.key.user_id,
            organization_id = %job.key.organization_id,
            retries = job.retry_count,
            error = %failure,
            "cache job failed"
        );
        return;
    }

    job.retry_count += 1;
    Counters::bump(&shared.counters.retried);
    let delay = shared.config.retry_base_delay * job.retry_count;
    warn!(
        user_id = %job.key.user_id,
        organization_id = %job.key.organization_id,
        attempt = job.retry_count,
        ?delay,
        error = %failure,
        "cache job failed, retrying"
    );

    tokio::select! {
        _ = shared.shutdown.cancelled() => {
            Counters::bump(&shared.counters.failed);
            return;
        }
        _ = tokio::time::sleep(delay) => {}
    }

    match shared.sender.try_send(job) {
        Ok(()) => {}
        Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
            Counters::bump(&shared.counters.dropped);
            error!(
                user_id = %job.key.user_id,
                organization_id = %job.key.organization_id,
                "cache job queue full on retry, dropping job"
            );
        }
    }
}
