use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The patient's answer to the 24h reminder. Stored as a nullable boolean.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReminderAnswer {
    Unset,
    Confirmed,
    Cancelled,
}

impl ReminderAnswer {
    pub fn from_column(value: Option<bool>) -> Self {
        match value {
            None => ReminderAnswer::Unset,
            Some(true) => ReminderAnswer::Confirmed,
            Some(false) => ReminderAnswer::Cancelled,
        }
    }

    pub fn to_column(self) -> Option<bool> {
        match self {
            ReminderAnswer::Unset => None,
            ReminderAnswer::Confirmed => Some(true),
            ReminderAnswer::Cancelled => Some(false),
        }
    }

    pub fn is_answered(self) -> bool {
        self != ReminderAnswer::Unset
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: i64,
    pub bitrix24_deal_id: i64,
    pub user_id: Option<i64>,
    pub phone_number: Option<String>,
    pub appointment_date: DateTime<Utc>,
    pub procedure_name: Option<String>,
    pub doctor_name: Option<String>,
    pub notification_sent: bool,
    pub reminder_sent: bool,
    pub reminder_answer: ReminderAnswer,
    pub reminder_answered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Appointment {
    /// Lifecycle position derived from the stored flags and the survey row, if any.
    pub fn state(&self, survey: Option<&Survey>) -> AppointmentState {
        if let Some(survey) = survey {
            return if survey.is_answered() {
                AppointmentState::Rated
            } else {
                AppointmentState::Surveyed
            };
        }
        match self.reminder_answer {
            ReminderAnswer::Confirmed => AppointmentState::Confirmed,
            ReminderAnswer::Cancelled => AppointmentState::Cancelled,
            ReminderAnswer::Unset if self.reminder_sent => AppointmentState::Reminded,
            ReminderAnswer::Unset if self.notification_sent => AppointmentState::Notified,
            ReminderAnswer::Unset => AppointmentState::Created,
        }
    }
}

/// `Surveyed` doubles as the terminal "unanswered" state: nothing expires a survey.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppointmentState {
    Created,
    Notified,
    Reminded,
    Confirmed,
    Cancelled,
    Surveyed,
    Rated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Survey {
    pub id: i64,
    pub appointment_id: i64,
    pub user_id: i64,
    pub rating: Option<i64>,
    pub sent_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub yandex_link_sent: bool,
}

impl Survey {
    pub fn is_answered(&self) -> bool {
        self.answered_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobKind {
    Reminder,
    Survey,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Reminder => "reminder",
            JobKind::Survey => "survey",
        }
    }

    pub fn parse_kind(raw: &str) -> Option<Self> {
        match raw {
            "reminder" => Some(JobKind::Reminder),
            "survey" => Some(JobKind::Survey),
            _ => None,
        }
    }
}

/// Scheduler key: one pending job per kind and appointment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub kind: JobKind,
    pub appointment_id: i64,
}

impl JobKey {
    pub fn new(kind: JobKind, appointment_id: i64) -> Self {
        Self {
            kind,
            appointment_id,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.as_str(), self.appointment_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobPayload {
    pub appointment_id: i64,
    /// Chat that should receive the notification when the job fires.
    pub chat_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub key: JobKey,
    pub due_at: DateTime<Utc>,
    pub token: Uuid,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InteractionKind {
    BookingNotification,
    Reminder,
    ReminderAnswer,
    Survey,
    SurveyAnswer,
    CrmUpdate,
    Job,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::BookingNotification => "booking_notification",
            InteractionKind::Reminder => "reminder",
            InteractionKind::ReminderAnswer => "reminder_answer",
            InteractionKind::Survey => "survey",
            InteractionKind::SurveyAnswer => "survey_answer",
            InteractionKind::CrmUpdate => "crm_update",
            InteractionKind::Job => "job",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InteractionStatus {
    Sent,
    Failed,
    Suppressed,
    Answered,
    Rejected,
    Degraded,
}

impl InteractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionStatus::Sent => "sent",
            InteractionStatus::Failed => "failed",
            InteractionStatus::Suppressed => "suppressed",
            InteractionStatus::Answered => "answered",
            InteractionStatus::Rejected => "rejected",
            InteractionStatus::Degraded => "degraded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn appointment() -> Appointment {
        let at = Utc.with_ymd_and_hms(2025, 6, 10, 10, 0, 0).unwrap();
        Appointment {
            id: 1,
            bitrix24_deal_id: 100,
            user_id: Some(1),
            phone_number: None,
            appointment_date: at,
            procedure_name: None,
            doctor_name: None,
            notification_sent: false,
            reminder_sent: false,
            reminder_answer: ReminderAnswer::Unset,
            reminder_answered_at: None,
            created_at: at,
        }
    }

    #[test]
    fn reminder_answer_column_mapping() {
        assert_eq!(ReminderAnswer::from_column(None), ReminderAnswer::Unset);
        assert_eq!(ReminderAnswer::from_column(Some(true)), ReminderAnswer::Confirmed);
        assert_eq!(ReminderAnswer::from_column(Some(false)), ReminderAnswer::Cancelled);
        assert_eq!(ReminderAnswer::Cancelled.to_column(), Some(false));
        assert!(!ReminderAnswer::Unset.is_answered());
    }

    #[test]
    fn state_follows_flags() {
        let mut a = appointment();
        assert_eq!(a.state(None), AppointmentState::Created);
        a.notification_sent = true;
        assert_eq!(a.state(None), AppointmentState::Notified);
        a.reminder_sent = true;
        assert_eq!(a.state(None), AppointmentState::Reminded);
        a.reminder_answer = ReminderAnswer::Cancelled;
        assert_eq!(a.state(None), AppointmentState::Cancelled);
        a.reminder_answer = ReminderAnswer::Confirmed;
        assert_eq!(a.state(None), AppointmentState::Confirmed);

        let mut survey = Survey {
            id: 1,
            appointment_id: a.id,
            user_id: 1,
            rating: None,
            sent_at: a.appointment_date,
            answered_at: None,
            yandex_link_sent: false,
        };
        assert_eq!(a.state(Some(&survey)), AppointmentState::Surveyed);
        survey.rating = Some(4);
        survey.answered_at = Some(a.appointment_date);
        assert_eq!(a.state(Some(&survey)), AppointmentState::Rated);
    }

    #[test]
    fn job_key_display_and_kind_parse() {
        let key = JobKey::new(JobKind::Survey, 42);
        assert_eq!(key.to_string(), "survey_42");
        assert_eq!(JobKind::parse_kind("reminder"), Some(JobKind::Reminder));
        assert_eq!(JobKind::parse_kind("other"), None);
    }
}
