use super::{FireOutcome, Lifecycle};
use crate::crm::model::{FIELD_REMINDER_CONFIRMED, FIELD_STAGE_ID};
use crate::db::{self, NewInteraction};
use crate::messages;
use crate::model::{InteractionKind, InteractionStatus, JobKind, ReminderAnswer};
use crate::notify::Prompt;
use anyhow::{bail, Result};
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

/// What the patient is told after pressing a reminder button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderReply {
    Confirmed { appointment_id: i64, crm_synced: bool },
    Cancelled { appointment_id: i64, crm_synced: bool },
    AlreadyAnswered { appointment_id: i64 },
    NotSent { appointment_id: i64 },
    NotFound,
    UnknownUser,
}

impl ReminderReply {
    pub fn text(&self) -> &'static str {
        match self {
            ReminderReply::Confirmed { .. } => messages::REMINDER_CONFIRMED,
            ReminderReply::Cancelled { .. } => messages::REMINDER_CANCELLED,
            ReminderReply::AlreadyAnswered { .. } => messages::REMINDER_ALREADY_ANSWERED,
            ReminderReply::NotSent { .. } | ReminderReply::NotFound => messages::REMINDER_NOT_FOUND,
            ReminderReply::UnknownUser => messages::USER_NOT_FOUND,
        }
    }
}

impl Lifecycle {
    /// Reminder job body. The `reminder_sent` claim makes a second fire a no-op.
    #[instrument(skip_all, fields(appointment_id = appointment_id))]
    pub async fn fire_reminder(&self, appointment_id: i64, chat_id: i64) -> Result<FireOutcome> {
        let Some(appointment) = db::get_appointment(&self.pool, appointment_id).await? else {
            warn!("reminder for a missing appointment");
            return Ok(FireOutcome::Suppressed("appointment missing"));
        };
        if appointment.user_id.is_none() {
            return Ok(FireOutcome::Suppressed("no linked user"));
        }
        if !db::claim_reminder_sent(&self.pool, appointment.id).await? {
            info!("reminder already sent; duplicate fire suppressed");
            self.audit(
                NewInteraction::new(InteractionKind::Reminder, InteractionStatus::Suppressed)
                    .user(appointment.user_id)
                    .appointment(appointment.id)
                    .data(json!({ "reason": "already_sent" })),
            )
            .await;
            return Ok(FireOutcome::Suppressed("already sent"));
        }

        let text = self.templates.reminder(&appointment);
        let prompt = Prompt::ReminderChoice {
            appointment_id: appointment.id,
        };
        if let Err(err) = self.notifier.send(chat_id, &text, Some(prompt)).await {
            db::release_reminder_sent(&self.pool, appointment.id).await?;
            return Err(err.context(format!("reminder for appointment {appointment_id} not delivered")));
        }
        info!(chat_id, "reminder sent");
        self.audit(
            NewInteraction::new(InteractionKind::Reminder, InteractionStatus::Sent)
                .user(appointment.user_id)
                .appointment(appointment.id),
        )
        .await;
        Ok(FireOutcome::Sent)
    }

    /// Record a confirm/cancel answer. Without an appointment id the user's
    /// latest unanswered reminder is assumed, which can pick the wrong one when
    /// several reminders are open at once.
    #[instrument(skip_all, fields(telegram_id = telegram_id))]
    pub async fn answer_reminder(
        &self,
        telegram_id: i64,
        answer: ReminderAnswer,
        appointment_id: Option<i64>,
    ) -> Result<ReminderReply> {
        if !answer.is_answered() {
            bail!("a reminder answer must confirm or cancel");
        }
        let Some(user) = self.user_by_telegram_id(telegram_id).await? else {
            return Ok(ReminderReply::UnknownUser);
        };
        let appointment = match appointment_id {
            Some(id) => db::get_appointment(&self.pool, id)
                .await?
                .filter(|a| a.user_id == Some(user.id)),
            None => db::latest_unanswered_reminder(&self.pool, user.id).await?,
        };
        let Some(appointment) = appointment else {
            return Ok(ReminderReply::NotFound);
        };

        let now = self.clock.now();
        if !db::record_reminder_answer(&self.pool, appointment.id, answer, now).await? {
            let current = db::get_appointment(&self.pool, appointment.id).await?;
            return Ok(match current {
                Some(a) if a.reminder_answer.is_answered() => ReminderReply::AlreadyAnswered {
                    appointment_id: a.id,
                },
                _ => ReminderReply::NotSent {
                    appointment_id: appointment.id,
                },
            });
        }
        info!(appointment_id = appointment.id, ?answer, "reminder answered");
        self.audit(
            NewInteraction::new(InteractionKind::ReminderAnswer, InteractionStatus::Answered)
                .user(Some(user.id))
                .appointment(appointment.id)
                .data(json!({ "confirmed": answer == ReminderAnswer::Confirmed })),
        )
        .await;

        let mut fields = Map::new();
        if answer == ReminderAnswer::Confirmed {
            fields.insert(FIELD_REMINDER_CONFIRMED.into(), Value::from("Y"));
        } else {
            fields.insert(FIELD_REMINDER_CONFIRMED.into(), Value::from("N"));
            fields.insert(
                FIELD_STAGE_ID.into(),
                Value::from(self.settings.cancelled_stage_id.clone()),
            );
        }
        let crm_synced = self.push_to_crm(&appointment, fields).await;

        if answer == ReminderAnswer::Confirmed {
            return Ok(ReminderReply::Confirmed {
                appointment_id: appointment.id,
                crm_synced,
            });
        }
        // no survey for a cancelled visit
        if let Err(err) = self.scheduler.cancel(JobKind::Survey, appointment.id).await {
            warn!(?err, appointment_id = appointment.id, "failed to cancel survey job");
        }
        Ok(ReminderReply::Cancelled {
            appointment_id: appointment.id,
            crm_synced,
        })
    }
}
