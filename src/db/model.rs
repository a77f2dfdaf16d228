//! Insert models accepted by the repositories.
//!
//! Keep these structs focused on the columns written. Lifecycle rules live in
//! `crate::lifecycle`.

use crate::model::{InteractionKind, InteractionStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Appointment row as first ingested from a CRM deal.
#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub bitrix24_deal_id: i64,
    pub user_id: Option<i64>,
    pub phone_number: Option<String>,
    pub appointment_date: DateTime<Utc>,
    pub procedure_name: Option<String>,
    pub doctor_name: Option<String>,
}

/// One audit-log entry.
#[derive(Debug, Clone)]
pub struct NewInteraction {
    pub user_id: Option<i64>,
    pub appointment_id: Option<i64>,
    pub kind: InteractionKind,
    pub status: InteractionStatus,
    pub data: Option<Value>,
}

impl NewInteraction {
    pub fn new(kind: InteractionKind, status: InteractionStatus) -> Self {
        Self {
            user_id: None,
            appointment_id: None,
            kind,
            status,
            data: None,
        }
    }

    pub fn user(mut self, user_id: Option<i64>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn appointment(mut self, appointment_id: i64) -> Self {
        self.appointment_id = Some(appointment_id);
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
