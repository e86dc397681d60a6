//! Durable job queue with at-least-once delivery, retry and exponential backoff.
//!
//! Storage lives behind [`QueueBackend`]; the backend's claim operation is
//! the only mutual exclusion between workers. Retry policy, retention and the
//! worker pool live here and are backend independent.
//!
//! Shutdown: [`JobQueue::process`] stops claiming once its cancellation token
//! fires and waits for in-flight handlers before returning.

pub mod memory;
pub mod redis_backend;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type JobId = Uuid;

/// Shape of the delay curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay policy between attempts, `delay` in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay: u64,
}

impl Backoff {
    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
        }
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
        }
    }

    /// Delay before re-delivery after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(32);
                self.delay.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(millis)
    }
}

/// Per-job delivery options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Total number of deliveries, first one included
    pub attempts: u32,
    pub backoff: Backoff,
    /// Completed jobs retained for inspection
    pub remove_on_complete: usize,
    /// Failed jobs retained for inspection
    pub remove_on_fail: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::exponential(5000),
            remove_on_complete: 50,
            remove_on_fail: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Persisted form of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord<T> {
    pub id: JobId,
    pub queue: String,
    pub data: T,
    pub opts: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Job record with an untyped payload, as seen by backends
pub type StoredJob = JobRecord<serde_json::Value>;

impl StoredJob {
    /// Mark the record as held for its next attempt
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.processed_at = Some(now);
    }
}

/// Number of jobs per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Storage and exclusive-claim primitives of a queue
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a new job and append it to the wait list
    async fn push(&self, job: &StoredJob) -> Result<()>;

    /// Promote delayed jobs due at `now_ms`, then move the oldest waiting job to active.
    ///
    /// The claim and its first heartbeat at `now_ms` are recorded together, and
    /// the returned record is already marked active for its next attempt. A job
    /// returned here is held by the caller alone until it is delayed, finished
    /// or requeued.
    async fn claim(&self, now_ms: i64) -> Result<Option<StoredJob>>;

    /// Refresh the heartbeat of an active job; `false` once the job is no longer held
    async fn heartbeat(&self, id: JobId, now_ms: i64) -> Result<bool>;

    /// Overwrite the record of a job without moving it
    async fn update(&self, job: &StoredJob) -> Result<()>;

    /// Move an active job to the delayed set until `ready_at_ms`
    async fn delay(&self, job: &StoredJob, ready_at_ms: i64) -> Result<()>;

    /// Move an active job to the completed or failed list per its state, keeping the newest `keep`
    async fn finish(&self, job: &StoredJob, keep: usize) -> Result<()>;

    /// Return an active job to the wait list
    async fn requeue(&self, job: &StoredJob) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<StoredJob>>;

    /// Active jobs whose last heartbeat is at or before `cutoff_ms`
    async fn stalled(&self, cutoff_ms: i64) -> Result<Vec<StoredJob>>;

    async fn counts(&self) -> Result<QueueCounts>;
}

/// Error wrapper letting a handler mark a failure as not worth retrying.
///
/// Errors that do not downcast to `JobError` are treated as recoverable.
#[derive(Debug)]
pub struct JobError {
    inner: anyhow::Error,
    recoverable: bool,
}

impl JobError {
    /// The job fails immediately, remaining attempts are skipped
    pub fn unrecoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: false,
        }
    }

    /// The job is retried according to its backoff policy
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            recoverable: true,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

fn is_unrecoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<JobError>()
        .map(|e| !e.is_recoverable())
        .unwrap_or(false)
}

/// A job held by one worker
#[derive(Debug, Clone)]
pub struct ClaimedJob<T> {
    pub id: JobId,
    pub data: T,
    /// 1-based delivery number of this run
    pub attempt: u32,
    pub opts: JobOptions,
    record: StoredJob,
}

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job will be delivered again after `delay`
    Retrying { attempt: u32, delay: Duration },
    /// No attempts remain, or the error was unrecoverable
    Failed { attempts_made: u32 },
    /// The claim was lost to the stalled-job sweep; the outcome was not recorded
    ClaimLost,
}

/// Processes the payload of one delivered job
#[async_trait]
pub trait JobHandler<T>: Send + Sync + 'static {
    /// Returned value is stored on the completed job
    async fn handle(&self, job: &ClaimedJob<T>) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Jobs processed at the same time by this worker
    pub concurrency: usize,
    /// Sleep between claims when the queue is empty
    pub poll_interval: Duration,
    /// Heartbeat period of a running job; must stay well under the stalled timeout
    pub heartbeat_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Typed handle on a named queue
pub struct JobQueue<T> {
    name: String,
    backend: Arc<dyn QueueBackend>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            backend: self.backend.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> JobQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Durably add a job; it becomes claimable immediately
    #[tracing::instrument(skip(self, data), fields(queue = %self.name))]
    pub async fn enqueue(&self, data: T, opts: JobOptions) -> Result<JobId> {
        let record = StoredJob {
            id: Uuid::new_v4(),
            queue: self.name.clone(),
            data: serde_json::to_value(&data)?,
            opts,
            state: JobState::Waiting,
            attempts_made: 0,
            failed_reason: None,
            return_value: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
        };

        self.backend.push(&record).await?;
        tracing::info!(job_id = %record.id, attempts = opts.attempts, "Job enqueued");
        Ok(record.id)
    }

    /// Claim the next deliverable job, if any
    pub async fn claim(&self) -> Result<Option<ClaimedJob<T>>> {
        let Some(mut record) = self.backend.claim(Utc::now().timestamp_millis()).await? else {
            return Ok(None);
        };

        let data = match serde_json::from_value::<T>(record.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                // A payload that cannot be decoded will never succeed
                tracing::error!(job_id = %record.id, error = %e, "Undecodable job payload");
                record.state = JobState::Failed;
                record.failed_reason = Some(format!("undecodable payload: {}", e));
                record.finished_at = Some(Utc::now());
                self.backend.finish(&record, record.opts.remove_on_fail).await?;
                return Ok(None);
            }
        };

        Ok(Some(ClaimedJob {
            id: record.id,
            data,
            attempt: record.attempts_made,
            opts: record.opts,
            record,
        }))
    }

    /// Refresh the claim on a running job; `false` when it was taken back by the sweep
    pub async fn heartbeat(&self, job: &ClaimedJob<T>) -> Result<bool> {
        self.backend
            .heartbeat(job.id, Utc::now().timestamp_millis())
            .await
    }

    /// `true` while the stored record is still the attempt this worker claimed
    async fn still_held(&self, record: &StoredJob) -> Result<bool> {
        let held = match self.backend.get(record.id).await? {
            Some(current) => {
                current.state == JobState::Active && current.attempts_made == record.attempts_made
            }
            None => false,
        };
        if !held {
            tracing::warn!(
                job_id = %record.id,
                attempt = record.attempts_made,
                "Claim lost before the outcome was recorded"
            );
        }
        Ok(held)
    }

    /// Mark a claimed job completed
    ///
    /// Nothing is recorded when the claim was already lost to the stalled-job sweep.
    pub async fn complete(&self, job: ClaimedJob<T>, value: serde_json::Value) -> Result<()> {
        if !self.still_held(&job.record).await? {
            return Ok(());
        }
        let mut record = job.record;
        record.state = JobState::Completed;
        record.return_value = Some(value);
        record.finished_at = Some(Utc::now());
        self.backend
            .finish(&record, record.opts.remove_on_complete)
            .await?;
        tracing::info!(job_id = %record.id, attempt = job.attempt, "Job completed");
        Ok(())
    }

    /// Record a failed attempt, scheduling a retry while attempts remain
    pub async fn fail(&self, job: ClaimedJob<T>, error: &anyhow::Error) -> Result<FailOutcome> {
        if !self.still_held(&job.record).await? {
            return Ok(FailOutcome::ClaimLost);
        }
        let mut record = job.record;
        let unrecoverable = is_unrecoverable(error);
        record.failed_reason = Some(format!("{:#}", error));

        if !unrecoverable && record.attempts_made < record.opts.attempts {
            let delay = record.opts.backoff.delay_for(record.attempts_made);
            record.state = JobState::Delayed;
            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            self.backend.delay(&record, ready_at).await?;
            tracing::warn!(
                job_id = %record.id,
                attempt = record.attempts_made,
                max_attempts = record.opts.attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Job attempt failed, scheduling retry"
            );
            return Ok(FailOutcome::Retrying {
                attempt: record.attempts_made,
                delay,
            });
        }

        record.state = JobState::Failed;
        record.finished_at = Some(Utc::now());
        self.backend.finish(&record, record.opts.remove_on_fail).await?;
        tracing::error!(
            job_id = %record.id,
            attempts_made = record.attempts_made,
            unrecoverable,
            error = %error,
            "Job failed"
        );
        Ok(FailOutcome::Failed {
            attempts_made: record.attempts_made,
        })
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord<T>>> {
        let Some(record) = self.backend.get(id).await? else {
            return Ok(None);
        };
        Ok(Some(JobRecord {
            id: record.id,
            queue: record.queue,
            data: serde_json::from_value(record.data)?,
            opts: record.opts,
            state: record.state,
            attempts_made: record.attempts_made,
            failed_reason: record.failed_reason,
            return_value: record.return_value,
            created_at: record.created_at,
            processed_at: record.processed_at,
            finished_at: record.finished_at,
        }))
    }

    pub async fn state(&self, id: JobId) -> Result<Option<JobState>> {
        Ok(self.backend.get(id).await?.map(|r| r.state))
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.backend.counts().await
    }

    /// Return jobs without a heartbeat for `older_than` to the wait list.
    ///
    /// A worker that crashed mid-job stops heartbeating and never completes or
    /// fails it; this is what turns that into a re-delivery. The interrupted
    /// run still counts as an attempt.
    pub async fn recover_stalled(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let mut recovered = 0;

        for mut record in self.backend.stalled(cutoff).await? {
            if record.attempts_made >= record.opts.attempts {
                record.state = JobState::Failed;
                record.failed_reason = Some("job stalled more than allowable limit".to_string());
                record.finished_at = Some(Utc::now());
                self.backend.finish(&record, record.opts.remove_on_fail).await?;
            } else {
                record.state = JobState::Waiting;
                self.backend.requeue(&record).await?;
            }
            tracing::warn!(job_id = %record.id, state = ?record.state, "Recovered stalled job");
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Run a worker pool until `shutdown` is cancelled
    pub async fn process<H>(
        &self,
        handler: Arc<H>,
        options: WorkerOptions,
        shutdown: CancellationToken,
    ) where
        H: JobHandler<T>,
    {
        tracing::info!(
            queue = %self.name,
            concurrency = options.concurrency,
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            heartbeat_interval_ms = options.heartbeat_interval.as_millis() as u64,
            "Queue worker started"
        );

        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.claim().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(options.poll_interval) => continue,
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(queue = %self.name, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(options.poll_interval) => continue,
                    }
                }
            };

            let queue = self.clone();
            let handler = handler.clone();
            let heartbeat_interval = options.heartbeat_interval;
            tokio::spawn(async move {
                let _permit = permit;
                queue.run_one(handler.as_ref(), job, heartbeat_interval).await;
            });
        }

        // Wait for in-flight handlers to hand their permits back
        let _ = semaphore
            .acquire_many(options.concurrency.max(1) as u32)
            .await;
        tracing::info!(queue = %self.name, "Queue worker stopped");
    }

    async fn run_one<H>(&self, handler: &H, job: ClaimedJob<T>, heartbeat_interval: Duration)
    where
        H: JobHandler<T>,
    {
        let id = job.id;
        let result = {
            let work = handler.handle(&job);
            tokio::pin!(work);
            let mut ticker = tokio::time::interval(heartbeat_interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately and the claim is fresh
            ticker.tick().await;

            loop {
                tokio::select! {
                    result = &mut work => break result,
                    _ = ticker.tick() => match self.heartbeat(&job).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(job_id = %id, "Heartbeat found the claim lost"),
                        Err(e) => tracing::warn!(job_id = %id, error = %e, "Heartbeat failed"),
                    },
                }
            }
        };
        let recorded = match result {
            Ok(value) => self.complete(job, value).await,
            Err(e) => self.fail(job, &e).await.map(|_| ()),
        };
        if let Err(e) = recorded {
            // The job stays active and is picked up by the stalled-job sweep
            tracing::error!(job_id = %id, error = %e, "Failed to record job outcome");
        }
    }
}
