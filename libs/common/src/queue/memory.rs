//! In-process queue backend with the same list semantics as the Redis one.
//!
//! Used by tests and single-process deployments; nothing survives a restart.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use super::{JobId, JobState, QueueBackend, QueueCounts, StoredJob};

#[derive(Default)]
struct Lists {
    jobs: HashMap<JobId, StoredJob>,
    wait: VecDeque<JobId>,
    active: Vec<JobId>,
    /// Last heartbeat of every active job, in milliseconds
    heartbeats: HashMap<JobId, i64>,
    delayed: Vec<(i64, JobId)>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

impl Lists {
    fn remove_active(&mut self, id: JobId) {
        self.active.retain(|a| *a != id);
        self.heartbeats.remove(&id);
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    lists: Mutex<Lists>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push(&self, job: &StoredJob) -> Result<()> {
        let mut lists = self.lists.lock().await;
        lists.jobs.insert(job.id, job.clone());
        lists.wait.push_back(job.id);
        Ok(())
    }

    async fn claim(&self, now_ms: i64) -> Result<Option<StoredJob>> {
        let mut lists = self.lists.lock().await;

        let mut due: Vec<(i64, JobId)> = Vec::new();
        lists.delayed.retain(|(ready_at, id)| {
            if *ready_at <= now_ms {
                due.push((*ready_at, *id));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(ready_at, _)| *ready_at);
        lists.wait.extend(due.into_iter().map(|(_, id)| id));

        let Some(id) = lists.wait.pop_front() else {
            return Ok(None);
        };
        let Some(job) = lists.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.begin_attempt(Utc.timestamp_millis_opt(now_ms).single().unwrap_or_else(Utc::now));
        let job = job.clone();

        lists.active.push(id);
        lists.heartbeats.insert(id, now_ms);
        Ok(Some(job))
    }

    async fn heartbeat(&self, id: JobId, now_ms: i64) -> Result<bool> {
        let mut lists = self.lists.lock().await;
        match lists.heartbeats.get_mut(&id) {
            Some(last) => {
                *last = now_ms;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update(&self, job: &StoredJob) -> Result<()> {
        let mut lists = self.lists.lock().await;
        lists.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn delay(&self, job: &StoredJob, ready_at_ms: i64) -> Result<()> {
        let mut lists = self.lists.lock().await;
        lists.remove_active(job.id);
        lists.delayed.push((ready_at_ms, job.id));
        lists.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn finish(&self, job: &StoredJob, keep: usize) -> Result<()> {
        let mut lists = self.lists.lock().await;
        lists.remove_active(job.id);
        lists.jobs.insert(job.id, job.clone());

        let Lists {
            jobs,
            completed,
            failed,
            ..
        } = &mut *lists;
        let retained = if job.state == JobState::Completed {
            completed
        } else {
            failed
        };

        // Newest first, matching LPUSH + LTRIM
        retained.push_front(job.id);
        while retained.len() > keep {
            if let Some(evicted) = retained.pop_back() {
                jobs.remove(&evicted);
            }
        }
        Ok(())
    }

    async fn requeue(&self, job: &StoredJob) -> Result<()> {
        let mut lists = self.lists.lock().await;
        lists.remove_active(job.id);
        lists.wait.push_back(job.id);
        lists.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<StoredJob>> {
        Ok(self.lists.lock().await.jobs.get(&id).cloned())
    }

    async fn stalled(&self, cutoff_ms: i64) -> Result<Vec<StoredJob>> {
        let lists = self.lists.lock().await;
        Ok(lists
            .active
            .iter()
            .filter(|id| lists.heartbeats.get(*id).is_none_or(|last| *last <= cutoff_ms))
            .filter_map(|id| lists.jobs.get(id).cloned())
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let lists = self.lists.lock().await;
        Ok(QueueCounts {
            waiting: lists.wait.len(),
            active: lists.active.len(),
            delayed: lists.delayed.len(),
            completed: lists.completed.len(),
            failed: lists.failed.len(),
        })
    }
}
