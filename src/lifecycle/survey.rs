use super::{FireOutcome, Lifecycle};
use crate::crm::model::FIELD_SURVEY_RATING;
use crate::db::{self, NewInteraction};
use crate::messages::{self, RatingTier};
use crate::model::{InteractionKind, InteractionStatus, JobKind, ReminderAnswer};
use crate::notify::Prompt;
use anyhow::{anyhow, Result};
use reqwest::Url;
use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurveyReply {
    Recorded {
        appointment_id: i64,
        rating: u8,
        tier: RatingTier,
        review_link: Option<Url>,
    },
    AlreadyAnswered { appointment_id: i64 },
    NotFound,
    UnknownUser,
    InvalidRating,
}

impl SurveyReply {
    pub fn text(&self) -> String {
        match self {
            SurveyReply::Recorded {
                review_link: Some(link),
                ..
            } => messages::survey_thanks_with_link(link),
            SurveyReply::Recorded { tier, .. } => messages::survey_thanks(*tier).to_string(),
            SurveyReply::AlreadyAnswered { .. } => messages::SURVEY_ALREADY_ANSWERED.to_string(),
            SurveyReply::NotFound | SurveyReply::InvalidRating => {
                messages::SURVEY_NOT_FOUND.to_string()
            }
            SurveyReply::UnknownUser => messages::USER_NOT_FOUND.to_string(),
        }
    }
}

impl Lifecycle {
    /// Survey job body. Cancelled visits are skipped; the survey row doubles as the send claim.
    #[instrument(skip_all, fields(appointment_id = appointment_id))]
    pub async fn fire_survey(&self, appointment_id: i64, chat_id: i64) -> Result<FireOutcome> {
        let Some(appointment) = db::get_appointment(&self.pool, appointment_id).await? else {
            warn!("survey for a missing appointment");
            return Ok(FireOutcome::Suppressed("appointment missing"));
        };
        let suppress = |reason: &'static str| {
            NewInteraction::new(InteractionKind::Survey, InteractionStatus::Suppressed)
                .user(appointment.user_id)
                .appointment(appointment.id)
                .data(json!({ "reason": reason }))
        };
        if appointment.reminder_answer == ReminderAnswer::Cancelled {
            info!("visit cancelled; survey not sent");
            self.audit(suppress("cancelled")).await;
            return Ok(FireOutcome::Suppressed("visit cancelled"));
        }
        let Some(user_id) = appointment.user_id else {
            return Ok(FireOutcome::Suppressed("no linked user"));
        };
        let Some(survey_id) =
            db::claim_survey(&self.pool, appointment.id, user_id, self.clock.now()).await?
        else {
            info!("survey already exists; duplicate fire suppressed");
            self.audit(suppress("already_sent")).await;
            return Ok(FireOutcome::Suppressed("already sent"));
        };

        let text = self.templates.survey(appointment.procedure_name.as_deref());
        let prompt = Prompt::SurveyRating {
            appointment_id: appointment.id,
        };
        if let Err(err) = self.notifier.send(chat_id, &text, Some(prompt)).await {
            db::delete_unanswered_survey(&self.pool, survey_id).await?;
            return Err(err.context(format!("survey for appointment {appointment_id} not delivered")));
        }
        info!(chat_id, survey_id, "survey sent");
        self.audit(
            NewInteraction::new(InteractionKind::Survey, InteractionStatus::Sent)
                .user(Some(user_id))
                .appointment(appointment.id),
        )
        .await;
        Ok(FireOutcome::Sent)
    }

    /// Record a 1-5 rating. Without an appointment id the user's latest past
    /// appointment is assumed. An answered survey is never overwritten.
    #[instrument(skip_all, fields(telegram_id = telegram_id, rating = rating))]
    pub async fn answer_survey(
        &self,
        telegram_id: i64,
        rating: u8,
        appointment_id: Option<i64>,
    ) -> Result<SurveyReply> {
        if !(1..=5).contains(&rating) {
            return Ok(SurveyReply::InvalidRating);
        }
        let Some(user) = self.user_by_telegram_id(telegram_id).await? else {
            return Ok(SurveyReply::UnknownUser);
        };
        let now = self.clock.now();
        let appointment = match appointment_id {
            Some(id) => db::get_appointment(&self.pool, id)
                .await?
                .filter(|a| a.user_id == Some(user.id)),
            None => db::latest_past_appointment(&self.pool, user.id, now).await?,
        };
        let Some(appointment) = appointment else {
            return Ok(SurveyReply::NotFound);
        };

        let survey = match db::find_survey(&self.pool, appointment.id, user.id).await? {
            Some(survey) => survey,
            None => {
                // answered before the survey job fired: the row is created here
                db::claim_survey(&self.pool, appointment.id, user.id, now).await?;
                db::find_survey(&self.pool, appointment.id, user.id)
                    .await?
                    .ok_or_else(|| anyhow!("survey row for appointment {} vanished", appointment.id))?
            }
        };
        if survey.is_answered() {
            return Ok(SurveyReply::AlreadyAnswered {
                appointment_id: appointment.id,
            });
        }

        let tier = RatingTier::from_rating(rating);
        let review_link = if tier == RatingTier::Excellent {
            match messages::review_link(
                &self.settings.review_organization,
                appointment.procedure_name.as_deref(),
            ) {
                Ok(link) => Some(link),
                Err(err) => {
                    warn!(?err, "review link unavailable");
                    None
                }
            }
        } else {
            None
        };
        // the flag records what the user is actually shown
        let link_sent = review_link.is_some();
        if !db::record_survey_answer(&self.pool, survey.id, i64::from(rating), link_sent, now)
            .await?
        {
            return Ok(SurveyReply::AlreadyAnswered {
                appointment_id: appointment.id,
            });
        }
        info!(appointment_id = appointment.id, ?tier, "survey answered");
        if let Err(err) = self.scheduler.cancel(JobKind::Survey, appointment.id).await {
            warn!(?err, appointment_id = appointment.id, "failed to drop survey job");
        }
        self.audit(
            NewInteraction::new(InteractionKind::SurveyAnswer, InteractionStatus::Answered)
                .user(Some(user.id))
                .appointment(appointment.id)
                .data(json!({ "rating": rating, "yandex_link_sent": link_sent })),
        )
        .await;

        let mut fields = Map::new();
        fields.insert(FIELD_SURVEY_RATING.into(), Value::from(rating));
        self.push_to_crm(&appointment, fields).await;

        if tier == RatingTier::Poor {
            let notice = self.templates.admin_low_rating(&appointment, rating);
            self.notify_admins(&notice).await;
        }

        Ok(SurveyReply::Recorded {
            appointment_id: appointment.id,
            rating,
            tier,
            review_link,
        })
    }
}
