//! Durable one-shot job queue for reminders and surveys.
//!
//! Jobs live in the `scheduled_jobs` table keyed by `(kind, appointment_id)`.
//! Every `schedule` call stamps a fresh token; the poll loop claims a due job by
//! deleting exactly that token's row, then runs the handler on a bounded pool.
//! A claimed job is never re-armed, whatever the handler returns.
use crate::clock::Clock;
use crate::db::{self, NewInteraction, Pool};
use crate::model::{InteractionKind, InteractionStatus, JobKey, JobKind, JobPayload, ScheduledJob};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("job {key} due at {due_at} has already elapsed")]
    AlreadyElapsed { key: JobKey, due_at: DateTime<Utc> },
    #[error("job store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Callback invoked when a job fires.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn fire(&self, job: &ScheduledJob) -> Result<()>;
}

#[derive(Clone)]
pub struct Scheduler {
    pool: Pool,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        pool: Pool,
        clock: Arc<dyn Clock>,
        max_concurrent_jobs: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            clock,
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            poll_interval,
        }
    }

    /// Register a job, replacing any pending job with the same key.
    #[instrument(skip_all, fields(kind = kind.as_str(), appointment_id = appointment_id))]
    pub async fn schedule(
        &self,
        kind: JobKind,
        appointment_id: i64,
        due_at: DateTime<Utc>,
        payload: JobPayload,
    ) -> Result<ScheduledJob, ScheduleError> {
        let key = JobKey::new(kind, appointment_id);
        if due_at < self.clock.now() {
            warn!(%key, %due_at, "refusing to schedule an elapsed job");
            return Err(ScheduleError::AlreadyElapsed { key, due_at });
        }
        let job = ScheduledJob {
            key,
            due_at,
            token: Uuid::new_v4(),
            payload,
        };
        db::upsert_job(&self.pool, &job).await?;
        info!(%key, %due_at, "job scheduled");
        Ok(job)
    }

    /// Remove a pending job. Absent or already-fired jobs are not an error.
    pub async fn cancel(&self, kind: JobKind, appointment_id: i64) -> Result<bool> {
        let key = JobKey::new(kind, appointment_id);
        let removed = db::delete_job(&self.pool, key).await?;
        if removed {
            info!(%key, "job cancelled");
        }
        Ok(removed)
    }

    pub async fn pending(&self, kind: JobKind, appointment_id: i64) -> Result<Option<ScheduledJob>> {
        db::find_job(&self.pool, JobKey::new(kind, appointment_id)).await
    }

    pub async fn pending_jobs(&self) -> Result<Vec<ScheduledJob>> {
        db::list_jobs(&self.pool).await
    }

    /// Claim every due job that fits in the free worker slots and start it.
    /// Returns the handles of the started executions.
    pub async fn dispatch_due(&self, handler: Arc<dyn JobHandler>) -> Result<Vec<JoinHandle<()>>> {
        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(Vec::new());
        }
        let due = db::due_jobs(&self.pool, self.clock.now(), free as i64).await?;
        let mut started = Vec::with_capacity(due.len());
        for job in due {
            let permit = self.permits.clone().acquire_owned().await?;
            if !db::claim_job(&self.pool, job.key, job.token).await? {
                // cancelled or replaced after the due query
                continue;
            }
            let pool = self.pool.clone();
            let handler = handler.clone();
            started.push(tokio::spawn(async move {
                let _permit = permit;
                execute(&pool, handler.as_ref(), job).await;
            }));
        }
        Ok(started)
    }

    /// Poll loop. Jobs that came due while the process was down fire on the first pass.
    pub async fn run(self, handler: Arc<dyn JobHandler>) {
        match db::list_jobs(&self.pool).await {
            Ok(jobs) => {
                let now = self.clock.now();
                let overdue = jobs.iter().filter(|j| j.due_at <= now).count();
                info!(pending = jobs.len(), overdue, "scheduler started");
            }
            Err(err) => warn!(?err, "failed to inspect pending jobs"),
        }
        loop {
            match self.dispatch_due(handler.clone()).await {
                Ok(started) if !started.is_empty() => continue,
                Ok(_) => tokio::time::sleep(self.poll_interval).await,
                Err(err) => {
                    error!(?err, "scheduler tick failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

async fn execute(pool: &Pool, handler: &dyn JobHandler, job: ScheduledJob) {
    let key = job.key;
    match handler.fire(&job).await {
        Ok(()) => info!(%key, "job fired"),
        Err(err) => {
            error!(?err, %key, "job failed; consumed without retry");
            let entry = NewInteraction::new(InteractionKind::Job, InteractionStatus::Failed)
                .appointment(key.appointment_id)
                .data(json!({ "job": key.to_string(), "error": format!("{err:#}") }));
            if let Err(err) = db::log_interaction(pool, &entry).await {
                warn!(?err, %key, "failed to audit job failure");
            }
        }
    }
}
