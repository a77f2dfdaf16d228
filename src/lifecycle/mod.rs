//! Appointment lifecycle: CRM events in, timed notifications out, patient
//! answers back in.
//!
//! State lives in the appointment and survey rows. Every transition re-reads
//! the flags it depends on and moves them with a conditional update, so a
//! duplicate fire or a racing callback loses quietly instead of sending twice.
//! CRM writes and admin notices are best-effort and never undo local state.
use crate::clock::Clock;
use crate::config::Config;
use crate::crm::CrmGateway;
use crate::db::{self, NewInteraction, Pool};
use crate::messages::Templates;
use crate::model::{
    Appointment, InteractionKind, InteractionStatus, JobKind, JobPayload, ReminderAnswer,
    ScheduledJob, User,
};
use crate::notify::Notifier;
use crate::scheduler::{JobHandler, ScheduleError, Scheduler};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, FixedOffset, Offset, Utc};
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

mod ingest;
mod reminder;
mod survey;

pub use ingest::{CrmEvent, IngestOutcome, RejectReason};
pub use reminder::ReminderReply;
pub use survey::SurveyReply;

/// Result of a scheduled fire that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Sent,
    Suppressed(&'static str),
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub reminder_lead: Duration,
    pub survey_delay: Duration,
    pub local_offset: FixedOffset,
    pub cancelled_stage_id: String,
    pub review_organization: String,
    pub admin_ids: Vec<i64>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            reminder_lead: Duration::hours(24),
            survey_delay: Duration::days(3),
            local_offset: Utc.fix(),
            cancelled_stage_id: "CANCELED".into(),
            review_organization: "Uclinic".into(),
            admin_ids: Vec::new(),
        }
    }
}

impl LifecycleSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            reminder_lead: Duration::hours(cfg.scheduler.reminder_lead_hours),
            survey_delay: Duration::days(cfg.scheduler.survey_delay_days),
            local_offset: cfg.utc_offset(),
            cancelled_stage_id: cfg.bitrix24.cancelled_stage_id.clone(),
            review_organization: cfg.review.organization.clone(),
            admin_ids: cfg.telegram.admin_ids.clone(),
        }
    }
}

pub struct Lifecycle {
    pool: Pool,
    scheduler: Scheduler,
    crm: Arc<dyn CrmGateway>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
    templates: Templates,
}

impl Lifecycle {
    pub fn new(
        pool: Pool,
        scheduler: Scheduler,
        crm: Arc<dyn CrmGateway>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: LifecycleSettings,
    ) -> Self {
        let templates = Templates::new(settings.review_organization.clone(), settings.local_offset);
        Self {
            pool,
            scheduler,
            crm,
            notifier,
            clock,
            settings,
            templates,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    /// Send the "you are booked" message once. Failures leave `notification_sent` unset.
    async fn notify_booking(&self, appointment: &Appointment, user: &User) {
        if appointment.notification_sent {
            return;
        }
        let text = self.templates.booking(appointment);
        let entry = |status| {
            NewInteraction::new(InteractionKind::BookingNotification, status)
                .user(Some(user.id))
                .appointment(appointment.id)
        };
        match self.notifier.send(user.telegram_id, &text, None).await {
            Ok(()) => {
                if let Err(err) = db::mark_notification_sent(&self.pool, appointment.id).await {
                    warn!(?err, appointment_id = appointment.id, "failed to mark notification");
                }
                info!(appointment_id = appointment.id, "booking notification sent");
                self.audit(entry(InteractionStatus::Sent)).await;
            }
            Err(err) => {
                warn!(?err, appointment_id = appointment.id, "booking notification failed");
                self.audit(entry(InteractionStatus::Failed).data(json!({ "error": format!("{err:#}") })))
                    .await;
            }
        }
    }

    /// Arm the reminder and survey jobs for a linked appointment.
    /// Windows that already passed are skipped, not fired.
    pub async fn arrange_timers(&self, appointment: &Appointment, user: &User) -> Result<()> {
        let payload = JobPayload {
            appointment_id: appointment.id,
            chat_id: user.telegram_id,
        };
        if !appointment.reminder_sent {
            let due = appointment.appointment_date - self.settings.reminder_lead;
            self.arm(JobKind::Reminder, appointment.id, due, payload.clone())
                .await?;
        }
        let surveyed = db::find_survey_for_appointment(&self.pool, appointment.id)
            .await?
            .is_some();
        if appointment.reminder_answer != ReminderAnswer::Cancelled && !surveyed {
            let due = appointment.appointment_date + self.settings.survey_delay;
            self.arm(JobKind::Survey, appointment.id, due, payload).await?;
        }
        Ok(())
    }

    async fn arm(
        &self,
        kind: JobKind,
        appointment_id: i64,
        due_at: chrono::DateTime<Utc>,
        payload: JobPayload,
    ) -> Result<()> {
        match self
            .scheduler
            .schedule(kind, appointment_id, due_at, payload)
            .await
        {
            Ok(_) => Ok(()),
            Err(ScheduleError::AlreadyElapsed { key, .. }) => {
                info!(%key, "window already passed; job not armed");
                Ok(())
            }
            Err(ScheduleError::Store(err)) => Err(err),
        }
    }

    /// Best-effort CRM write. Returns whether Bitrix24 accepted it.
    async fn push_to_crm(&self, appointment: &Appointment, fields: Map<String, Value>) -> bool {
        let deal_id = appointment.bitrix24_deal_id;
        let snapshot = Value::Object(fields.clone());
        let synced = self.crm.update_deal(deal_id, fields).await;
        if !synced {
            warn!(deal_id, appointment_id = appointment.id, "crm update failed; local state kept");
            self.audit(
                NewInteraction::new(InteractionKind::CrmUpdate, InteractionStatus::Degraded)
                    .user(appointment.user_id)
                    .appointment(appointment.id)
                    .data(json!({ "deal_id": deal_id, "fields": snapshot })),
            )
            .await;
        }
        synced
    }

    /// Message every configured admin chat. Delivery failures are logged only.
    pub async fn notify_admins(&self, text: &str) {
        let sends = self
            .settings
            .admin_ids
            .iter()
            .map(|chat_id| async move { (*chat_id, self.notifier.send(*chat_id, text, None).await) });
        for (chat_id, res) in join_all(sends).await {
            if let Err(err) = res {
                warn!(?err, chat_id, "failed to notify admin");
            }
        }
    }

    async fn audit(&self, entry: NewInteraction) {
        if let Err(err) = db::log_interaction(&self.pool, &entry).await {
            warn!(?err, kind = entry.kind.as_str(), "failed to write interaction log");
        }
    }

    async fn user_by_telegram_id(&self, telegram_id: i64) -> Result<Option<User>> {
        db::find_user_by_telegram_id(&self.pool, telegram_id).await
    }
}

#[async_trait]
impl JobHandler for Lifecycle {
    async fn fire(&self, job: &ScheduledJob) -> Result<()> {
        let payload = &job.payload;
        let outcome = match job.key.kind {
            JobKind::Reminder => {
                self.fire_reminder(payload.appointment_id, payload.chat_id)
                    .await?
            }
            JobKind::Survey => {
                self.fire_survey(payload.appointment_id, payload.chat_id)
                    .await?
            }
        };
        if let FireOutcome::Suppressed(reason) = outcome {
            info!(key = %job.key, reason, "job fire suppressed");
        }
        Ok(())
    }
}
