//! Deferred-retry queue for requests that exhausted every vendor.
//!
//! Short estimated waits block the caller inline on a completion handle;
//! long waits hand back a job id for polling. A debounced timer drives FIFO
//! drain passes that re-enter the router's attempt loop.

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::StateStore;
use crate::types::{Capability, Vendor};

/// Pause between drained jobs so a vendor that just recovered is not hit by
/// a thundering herd.
const INTER_JOB_PAUSE_MS: u64 = 50;
/// How long completed async results stay pollable in memory.
const RESULT_RETENTION_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_size: usize,
    pub timeout_ms: i64,
    pub async_threshold_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            timeout_ms: 30_000,
            async_threshold_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Error,
    Expired,
}

/// The persistable part of a queued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub estimated_wait_ms: u64,
    pub capability: Capability,
    pub requested_model: String,
    pub body: Value,
}

impl JobRecord {
    /// Rebuild a record from the store's hash fields. Any missing or
    /// malformed field drops the record.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            id: fields.get("id")?.parse().ok()?,
            created_at: DateTime::parse_from_rfc3339(fields.get("created_at")?)
                .ok()?
                .with_timezone(&Utc),
            timeout_at: DateTime::parse_from_rfc3339(fields.get("timeout_at")?)
                .ok()?
                .with_timezone(&Utc),
            estimated_wait_ms: fields.get("estimated_wait_ms")?.parse().ok()?,
            capability: Capability::from_str(fields.get("capability")?).ok()?,
            requested_model: fields.get("requested_model")?.clone(),
            body: serde_json::from_str(fields.get("body")?).ok()?,
        })
    }
}

/// Terminal error stored on a job and surfaced to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn timeout() -> Self {
        Self {
            status: 408,
            code: "queue_timeout".to_string(),
            message: "request timed out waiting for an available provider".to_string(),
        }
    }
}

/// What a successful drain attempt produced.
#[derive(Debug, Clone)]
pub struct DrainedResponse {
    pub vendor: Vendor,
    pub vendor_model: String,
    pub body: Value,
}

/// Outcome of one drain attempt for one job.
pub enum DrainError {
    /// Every candidate is still unavailable; retry no earlier than this.
    Exhausted { retry_at: DateTime<Utc> },
    /// Terminal failure; the job ends in `error`.
    Failed(JobError),
}

/// The work handed to the injected drain callback.
pub struct QueuedRequest {
    pub capability: Capability,
    pub requested_model: String,
    pub body: Value,
    pub signal: CancellationToken,
}

/// Injected after construction to break the router-queue dependency cycle.
pub type DrainFn = Arc<
    dyn Fn(QueuedRequest) -> BoxFuture<'static, Result<DrainedResponse, DrainError>>
        + Send
        + Sync,
>;

pub enum EnqueueOutcome {
    /// The caller was blocked inline and the wait is over.
    Sync(Result<DrainedResponse, JobError>),
    /// The job was parked; the caller polls.
    Async { job_id: Uuid, estimated_wait_ms: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
}

#[derive(Debug)]
pub enum PollResult {
    Pending { estimated_wait_ms: u64 },
    Done(Value),
    Error(JobError),
    Expired,
    NotFound,
}

struct Job {
    record: JobRecord,
    status: JobStatus,
    result: Option<Value>,
    error: Option<JobError>,
    /// Present only for inline (sync) callers; cannot cross processes.
    waiter: Option<oneshot::Sender<Result<DrainedResponse, JobError>>>,
    /// True when the job lives in the shared store's pending list and will
    /// be claimed from there.
    persisted: bool,
}

enum Attempt {
    Done(DrainedResponse),
    Failed(JobError),
    Expired,
    Retry { retry_at: DateTime<Utc> },
}

pub struct RequestQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
    drain_fn: RwLock<Option<DrainFn>>,
    timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    timer_gen: AtomicU64,
    drain_lock: AsyncMutex<()>,
    store: Option<Arc<StateStore>>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>, store: Option<Arc<StateStore>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            drain_fn: RwLock::new(None),
            timer: Mutex::new(None),
            timer_gen: AtomicU64::new(0),
            drain_lock: AsyncMutex::new(()),
            store,
        })
    }

    /// Inject the drain callback. Must happen before the first enqueue.
    pub fn set_drain_fn(&self, f: DrainFn) {
        *self.drain_fn.write().unwrap() = Some(f);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// If a previous instance left work in the shared store, start draining
    /// it right away.
    pub async fn resume_from_store(self: &Arc<Self>) {
        let Some(store) = &self.store else { return };
        let pending = store.pending_count().await;
        if pending > 0 {
            tracing::info!(pending, "resuming queued jobs from store");
            self.schedule_processing(0);
        }
    }

    /// Park a request that exhausted its fallback chain. Short waits block
    /// the caller inline; long waits return a pollable job id.
    pub async fn enqueue(
        self: &Arc<Self>,
        capability: Capability,
        requested_model: &str,
        estimated_wait_ms: u64,
        body: Value,
    ) -> Result<EnqueueOutcome, QueueError> {
        let now = self.clock.now();
        let record = JobRecord {
            id: Uuid::new_v4(),
            created_at: now,
            timeout_at: now + Duration::milliseconds(self.config.timeout_ms),
            estimated_wait_ms,
            capability,
            requested_model: requested_model.to_string(),
            body,
        };

        let sync = estimated_wait_ms <= self.config.async_threshold_ms;
        let persisted = !sync && self.store.is_some();

        let rx = {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.len() >= self.config.max_size {
                return Err(QueueError::Full);
            }
            let (waiter, rx) = if sync {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            jobs.insert(
                record.id,
                Job {
                    record: record.clone(),
                    status: JobStatus::Pending,
                    result: None,
                    error: None,
                    waiter,
                    persisted,
                },
            );
            rx
        };

        if persisted {
            if let Some(store) = &self.store {
                if let Err(err) = store.push_job(&record).await {
                    // Degrade to local-only processing for this job.
                    tracing::debug!(%err, job = %record.id, "queue persist failed");
                    if let Some(job) = self.jobs.lock().unwrap().get_mut(&record.id) {
                        job.persisted = false;
                    }
                }
            }
        }

        tracing::info!(
            job = %record.id,
            model = requested_model,
            estimated_wait_ms,
            mode = if sync { "sync" } else { "async" },
            "request queued"
        );
        self.schedule_processing(estimated_wait_ms as i64);

        let Some(rx) = rx else {
            return Ok(EnqueueOutcome::Async {
                job_id: record.id,
                estimated_wait_ms,
            });
        };

        // Inline path: hold the caller until the drain resolves us or the
        // job budget runs out.
        let budget = (record.timeout_at - self.clock.now())
            .to_std()
            .unwrap_or_default();
        let outcome = match tokio::time::timeout(budget, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(JobError::timeout()),
        };
        self.jobs.lock().unwrap().remove(&record.id);
        Ok(EnqueueOutcome::Sync(outcome))
    }

    /// Job status for pollers. Falls back to the shared store for jobs
    /// drained by another instance.
    pub async fn poll(&self, id: Uuid) -> PollResult {
        let now = self.clock.now();
        let local = {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(&id) {
                None => None,
                Some(job) => {
                    if job.status == JobStatus::Pending && now > job.record.timeout_at {
                        job.status = JobStatus::Expired;
                    }
                    Some(match job.status {
                        JobStatus::Pending | JobStatus::Processing => PollResult::Pending {
                            estimated_wait_ms: job.record.estimated_wait_ms,
                        },
                        JobStatus::Done => {
                            PollResult::Done(job.result.clone().unwrap_or(Value::Null))
                        }
                        JobStatus::Error => PollResult::Error(
                            job.error.clone().unwrap_or_else(JobError::timeout),
                        ),
                        JobStatus::Expired => PollResult::Expired,
                    })
                }
            }
        };

        match local {
            Some(PollResult::Pending { estimated_wait_ms }) => {
                // Another instance may have finished it already.
                if let Some(found) = self.poll_store(id).await {
                    return found;
                }
                PollResult::Pending { estimated_wait_ms }
            }
            Some(result) => result,
            None => self.poll_store(id).await.unwrap_or(PollResult::NotFound),
        }
    }

    async fn poll_store(&self, id: Uuid) -> Option<PollResult> {
        let store = self.store.as_ref()?;
        let envelope = store.load_result(id).await?;
        let status = envelope.get("status").and_then(Value::as_str)?;
        match status {
            "done" => Some(PollResult::Done(envelope.get("body").cloned()?)),
            "error" => {
                let error = envelope
                    .get("error")
                    .and_then(|e| serde_json::from_value(e.clone()).ok())
                    .unwrap_or_else(JobError::timeout);
                Some(PollResult::Error(error))
            }
            "expired" => Some(PollResult::Expired),
            _ => None,
        }
    }

    /// Debounce the drain timer: any pending timer is cancelled and replaced.
    /// Negative delays are clamped to zero.
    pub fn schedule_processing(self: &Arc<Self>, delay_ms: i64) {
        let delay = delay_ms.max(0) as u64;
        let generation = self.timer_gen.fetch_add(1, Ordering::Relaxed) + 1;
        let queue = Arc::clone(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            // Release our own slot before draining so a reschedule from
            // inside the pass cannot abort the running pass.
            {
                let mut timer = queue.timer.lock().unwrap();
                if matches!(&*timer, Some((generation_held, _)) if *generation_held == generation) {
                    *timer = None;
                }
            }
            queue.drain().await;
        });

        let mut timer = self.timer.lock().unwrap();
        if let Some((_, old)) = timer.replace((generation, handle)) {
            old.abort();
        }
    }

    /// One drain pass. Serialized per instance: overlapping passes queue up
    /// behind the lock.
    pub async fn drain(self: &Arc<Self>) {
        let _guard = self.drain_lock.lock().await;
        let Some(drain_fn) = self.drain_fn.read().unwrap().clone() else {
            tracing::debug!("drain requested before callback injection");
            return;
        };

        // Local jobs first (sync always, async when no store is configured),
        // FIFO by creation time.
        let mut local: Vec<(DateTime<Utc>, Uuid)> = {
            let jobs = self.jobs.lock().unwrap();
            jobs.values()
                .filter(|j| j.status == JobStatus::Pending && !j.persisted)
                .map(|j| (j.record.created_at, j.record.id))
                .collect()
        };
        local.sort();

        let mut first = true;
        for (_, id) in local {
            if !first {
                tokio::time::sleep(std::time::Duration::from_millis(INTER_JOB_PAUSE_MS)).await;
            }
            first = false;
            self.run_local_job(id, &drain_fn).await;
        }

        // Then claim shared jobs; the atomic pop means each is drained by
        // exactly one instance.
        if let Some(store) = self.store.clone() {
            while let Some(record) = store.pop_job().await {
                if !first {
                    tokio::time::sleep(std::time::Duration::from_millis(INTER_JOB_PAUSE_MS)).await;
                }
                first = false;
                self.run_shared_job(record, &store, &drain_fn).await;
            }
        }
    }

    async fn run_local_job(self: &Arc<Self>, id: Uuid, drain_fn: &DrainFn) {
        let Some(record) = ({
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(&id) {
                Some(job) if job.status == JobStatus::Pending => {
                    job.status = JobStatus::Processing;
                    Some(job.record.clone())
                }
                _ => None,
            }
        }) else {
            return;
        };

        match self.attempt(&record, drain_fn).await {
            Attempt::Done(resp) => self.finish_local(id, Ok(resp)),
            Attempt::Failed(err) => self.finish_local(id, Err(err)),
            Attempt::Expired => self.expire_local(id),
            Attempt::Retry { retry_at } => {
                if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
                    job.status = JobStatus::Pending;
                }
                let delay =
                    (retry_at.min(record.timeout_at) - self.clock.now()).num_milliseconds();
                self.schedule_processing(delay);
            }
        }
    }

    async fn run_shared_job(
        self: &Arc<Self>,
        record: JobRecord,
        store: &Arc<StateStore>,
        drain_fn: &DrainFn,
    ) {
        let id = record.id;
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
            job.status = JobStatus::Processing;
        }

        match self.attempt(&record, drain_fn).await {
            Attempt::Done(resp) => {
                store.spawn_save_result(
                    id,
                    &serde_json::json!({"status": "done", "body": resp.body}),
                );
                self.settle_shared(id, JobStatus::Done, Some(resp.body), None);
            }
            Attempt::Failed(err) => {
                store.spawn_save_result(id, &serde_json::json!({"status": "error", "error": err}));
                self.settle_shared(id, JobStatus::Error, None, Some(err));
            }
            Attempt::Expired => {
                store.spawn_save_result(id, &serde_json::json!({"status": "expired"}));
                self.settle_shared(id, JobStatus::Expired, None, None);
            }
            Attempt::Retry { retry_at } => {
                // Put it back for any instance to claim later.
                if let Err(err) = store.push_job(&record).await {
                    tracing::debug!(%err, job = %id, "requeue failed, keeping job local");
                    if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
                        job.status = JobStatus::Pending;
                        job.persisted = false;
                    }
                } else if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
                    job.status = JobStatus::Pending;
                }
                let delay =
                    (retry_at.min(record.timeout_at) - self.clock.now()).num_milliseconds();
                self.schedule_processing(delay);
            }
        }
    }

    /// Run one job through the drain callback with the remaining time budget
    /// as a hard bound.
    async fn attempt(&self, record: &JobRecord, drain_fn: &DrainFn) -> Attempt {
        let now = self.clock.now();
        if now > record.timeout_at {
            return Attempt::Expired;
        }
        let remaining = (record.timeout_at - now).to_std().unwrap_or_default();

        // Queued execution is always unary: a stored stream could not be
        // re-polled later.
        let mut body = record.body.clone();
        if body.get("stream").is_some() {
            body["stream"] = Value::Bool(false);
        }

        let signal = CancellationToken::new();
        let request = QueuedRequest {
            capability: record.capability,
            requested_model: record.requested_model.clone(),
            body,
            signal: signal.clone(),
        };

        match tokio::time::timeout(remaining, drain_fn(request)).await {
            Ok(Ok(resp)) => Attempt::Done(resp),
            Ok(Err(DrainError::Exhausted { retry_at })) => Attempt::Retry { retry_at },
            Ok(Err(DrainError::Failed(err))) => Attempt::Failed(err),
            Err(_) => {
                signal.cancel();
                Attempt::Expired
            }
        }
    }

    fn finish_local(&self, id: Uuid, result: Result<DrainedResponse, JobError>) {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else { return };

        if let Some(waiter) = job.waiter.take() {
            // Sync caller: hand over the result; the enqueue side owns
            // removal of the entry.
            let _ = waiter.send(result);
            return;
        }

        match result {
            Ok(resp) => {
                job.status = JobStatus::Done;
                job.result = Some(resp.body);
            }
            Err(err) => {
                job.status = JobStatus::Error;
                job.error = Some(err);
            }
        }
        drop(jobs);
        self.evict_later(id);
    }

    fn expire_local(&self, id: Uuid) {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else { return };
        job.status = JobStatus::Expired;
        if let Some(waiter) = job.waiter.take() {
            let _ = waiter.send(Err(JobError::timeout()));
            return;
        }
        drop(jobs);
        self.evict_later(id);
    }

    fn settle_shared(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<Value>,
        error: Option<JobError>,
    ) {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else { return };
        job.status = status;
        job.result = result;
        job.error = error;
        drop(jobs);
        self.evict_later(id);
    }

    /// Deferred eviction keeps async results pollable for a grace period.
    fn evict_later(&self, id: Uuid) {
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(RESULT_RETENTION_MS)).await;
            jobs.lock().unwrap().remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use serde_json::json;

    fn test_queue(config: QueueConfig) -> Arc<RequestQueue> {
        RequestQueue::new(config, system_clock(), None)
    }

    fn succeed_with(text: &str) -> DrainFn {
        let body = json!({"object": "chat.completion", "content": text});
        Arc::new(move |_req| {
            let body = body.clone();
            Box::pin(async move {
                Ok(DrainedResponse {
                    vendor: Vendor::OpenAi,
                    vendor_model: "gpt-4o".to_string(),
                    body,
                })
            })
        })
    }

    #[tokio::test]
    async fn sync_enqueue_blocks_until_drained() {
        let queue = test_queue(QueueConfig::default());
        queue.set_drain_fn(succeed_with("hello"));

        let outcome = queue
            .enqueue(Capability::Chat, "gpt-4o", 100, json!({"model": "gpt-4o"}))
            .await
            .unwrap();
        match outcome {
            EnqueueOutcome::Sync(Ok(resp)) => {
                assert_eq!(resp.body["content"], "hello");
                assert_eq!(resp.vendor, Vendor::OpenAi);
            }
            _ => panic!("expected resolved sync outcome"),
        }
        // Sync jobs leave no residue.
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn long_waits_return_a_pollable_job() {
        let queue = test_queue(QueueConfig {
            async_threshold_ms: 5_000,
            ..QueueConfig::default()
        });
        queue.set_drain_fn(succeed_with("deferred"));

        let outcome = queue
            .enqueue(Capability::Chat, "gpt-4o", 6_000, json!({"model": "gpt-4o"}))
            .await
            .unwrap();
        let EnqueueOutcome::Async { job_id, estimated_wait_ms } = outcome else {
            panic!("expected async outcome");
        };
        assert_eq!(estimated_wait_ms, 6_000);
        assert!(matches!(
            queue.poll(job_id).await,
            PollResult::Pending { .. }
        ));

        // Drive the drain directly instead of waiting out the timer.
        queue.drain().await;
        match queue.poll(job_id).await {
            PollResult::Done(body) => assert_eq!(body["content"], "deferred"),
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn full_queue_rejects_enqueue() {
        let queue = test_queue(QueueConfig {
            max_size: 1,
            async_threshold_ms: 0,
            ..QueueConfig::default()
        });
        queue.set_drain_fn(succeed_with("x"));

        let first = queue
            .enqueue(Capability::Chat, "gpt-4o", 10_000, json!({}))
            .await
            .unwrap();
        assert!(matches!(first, EnqueueOutcome::Async { .. }));

        let second = queue.enqueue(Capability::Chat, "gpt-4o", 10_000, json!({})).await;
        assert!(matches!(second, Err(QueueError::Full)));
    }

    #[tokio::test]
    async fn expired_jobs_reject_their_waiters() {
        let queue = test_queue(QueueConfig {
            timeout_ms: 50,
            ..QueueConfig::default()
        });
        // Drain never resolves anything in time.
        queue.set_drain_fn(Arc::new(|_req| {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Err(DrainError::Failed(JobError::timeout()))
            })
        }));

        let outcome = queue
            .enqueue(Capability::Chat, "gpt-4o", 10, json!({}))
            .await
            .unwrap();
        match outcome {
            EnqueueOutcome::Sync(Err(err)) => {
                assert_eq!(err.status, 408);
                assert_eq!(err.code, "queue_timeout");
            }
            _ => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn drain_is_fifo_by_creation_time() {
        let queue = test_queue(QueueConfig {
            async_threshold_ms: 0,
            ..QueueConfig::default()
        });
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        queue.set_drain_fn(Arc::new(move |req| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock().unwrap().push(req.requested_model.clone());
                Ok(DrainedResponse {
                    vendor: Vendor::OpenAi,
                    vendor_model: req.requested_model,
                    body: json!({}),
                })
            })
        }));

        for model in ["first", "second", "third"] {
            queue
                .enqueue(Capability::Chat, model, 60_000, json!({}))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        queue.drain().await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn renewed_exhaustion_keeps_the_job_pending() {
        let queue = test_queue(QueueConfig {
            async_threshold_ms: 0,
            ..QueueConfig::default()
        });
        queue.set_drain_fn(Arc::new(|_req| {
            Box::pin(async move {
                Err(DrainError::Exhausted {
                    retry_at: Utc::now() + Duration::seconds(2),
                })
            })
        }));

        let EnqueueOutcome::Async { job_id, .. } = queue
            .enqueue(Capability::Chat, "gpt-4o", 60_000, json!({}))
            .await
            .unwrap()
        else {
            panic!("expected async outcome");
        };
        queue.drain().await;
        assert!(matches!(
            queue.poll(job_id).await,
            PollResult::Pending { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_jobs_poll_as_not_found() {
        let queue = test_queue(QueueConfig::default());
        assert!(matches!(
            queue.poll(Uuid::new_v4()).await,
            PollResult::NotFound
        ));
    }
}
