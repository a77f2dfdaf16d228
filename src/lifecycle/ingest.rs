use super::Lifecycle;
use crate::crm::{model::parse_crm_date, normalize_phone, Deal};
use crate::db::{self, NewAppointment};
use crate::model::{JobKind, User};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{info, instrument, warn};

/// CRM webhook event, with Bitrix24's native names accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrmEvent {
    DealAdded(Option<i64>),
    DealUpdated(Option<i64>),
    Other(String),
}

impl CrmEvent {
    pub fn new(event: &str, deal_id: Option<i64>) -> Self {
        match event.trim().to_ascii_uppercase().as_str() {
            "DEAL_ADDED" | "ONCRMDEALADD" => CrmEvent::DealAdded(deal_id),
            "DEAL_UPDATED" | "ONCRMDEALUPDATE" => CrmEvent::DealUpdated(deal_id),
            _ => CrmEvent::Other(event.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingDealId,
    /// Bitrix24 did not return the deal.
    DealUnavailable { deal_id: i64 },
    MissingDate { deal_id: i64 },
    InvalidDate { deal_id: i64, raw: String },
    AppointmentNotFound { deal_id: i64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingDealId => write!(f, "event carries no deal id"),
            RejectReason::DealUnavailable { deal_id } => {
                write!(f, "deal {deal_id} could not be fetched from the CRM")
            }
            RejectReason::MissingDate { deal_id } => {
                write!(f, "deal {deal_id} has no date, cannot schedule")
            }
            RejectReason::InvalidDate { deal_id, raw } => {
                write!(f, "deal {deal_id} has an unreadable date {raw:?}")
            }
            RejectReason::AppointmentNotFound { deal_id } => {
                write!(f, "no appointment for deal {deal_id}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created { appointment_id: i64, linked: bool },
    Duplicate { appointment_id: i64 },
    Updated { appointment_id: i64, changed: bool, rescheduled: bool },
    NotHandled { event: String },
    Rejected(RejectReason),
}

struct DealDetails {
    date: DateTime<Utc>,
    procedure_name: Option<String>,
    doctor_name: Option<String>,
}

impl Lifecycle {
    #[instrument(skip_all, fields(event = ?event))]
    pub async fn handle_event(&self, event: CrmEvent) -> Result<IngestOutcome> {
        match event {
            CrmEvent::DealAdded(Some(deal_id)) => self.ingest_deal(deal_id).await,
            CrmEvent::DealUpdated(Some(deal_id)) => self.update_deal(deal_id).await,
            CrmEvent::DealAdded(None) | CrmEvent::DealUpdated(None) => {
                warn!("crm event without deal id");
                Ok(IngestOutcome::Rejected(RejectReason::MissingDealId))
            }
            CrmEvent::Other(event) => {
                info!(event, "crm event not handled");
                Ok(IngestOutcome::NotHandled { event })
            }
        }
    }

    /// First sight of a deal: create the appointment, greet the linked user and arm timers.
    pub async fn ingest_deal(&self, deal_id: i64) -> Result<IngestOutcome> {
        if let Some(existing) = db::find_appointment_by_deal(&self.pool, deal_id).await? {
            info!(deal_id, appointment_id = existing.id, "deal already ingested");
            return Ok(IngestOutcome::Duplicate {
                appointment_id: existing.id,
            });
        }
        let Some(deal) = self.crm.get_deal(deal_id).await else {
            warn!(deal_id, "deal not available from crm");
            return Ok(IngestOutcome::Rejected(RejectReason::DealUnavailable { deal_id }));
        };
        self.ingest_record(deal_id, &deal, None).await
    }

    async fn ingest_record(
        &self,
        deal_id: i64,
        deal: &Deal,
        known_user: Option<&User>,
    ) -> Result<IngestOutcome> {
        let details = match self.deal_details(deal_id, deal) {
            Ok(details) => details,
            Err(reason) => {
                warn!(deal_id, %reason, "deal rejected");
                return Ok(IngestOutcome::Rejected(reason));
            }
        };

        let phone = match self.deal_phone(deal).await {
            Some(phone) => Some(phone),
            None => known_user.and_then(|u| u.phone_number.clone()),
        };
        let user = match known_user {
            Some(user) => Some(user.clone()),
            None => match phone.as_deref() {
                Some(phone) => db::find_user_by_phone(&self.pool, phone).await?,
                None => None,
            },
        };

        let new = NewAppointment {
            bitrix24_deal_id: deal_id,
            user_id: user.as_ref().map(|u| u.id),
            phone_number: phone,
            appointment_date: details.date,
            procedure_name: details.procedure_name,
            doctor_name: details.doctor_name,
        };
        let appointment_id = match db::insert_appointment(&self.pool, &new).await {
            Ok(id) => id,
            Err(err) => {
                // a concurrent delivery of the same event may have won the unique key
                if let Some(existing) = db::find_appointment_by_deal(&self.pool, deal_id).await? {
                    return Ok(IngestOutcome::Duplicate {
                        appointment_id: existing.id,
                    });
                }
                return Err(err);
            }
        };
        info!(deal_id, appointment_id, linked = user.is_some(), "appointment created");

        if let Some(user) = &user {
            if let Some(appointment) = db::get_appointment(&self.pool, appointment_id).await? {
                self.notify_booking(&appointment, user).await;
                self.arrange_timers(&appointment, user).await?;
            }
        }
        Ok(IngestOutcome::Created {
            appointment_id,
            linked: user.is_some(),
        })
    }

    /// Re-read a known deal; a moved date re-arms the jobs that have not fired yet.
    pub async fn update_deal(&self, deal_id: i64) -> Result<IngestOutcome> {
        let Some(appointment) = db::find_appointment_by_deal(&self.pool, deal_id).await? else {
            warn!(deal_id, "update for unknown deal");
            return Ok(IngestOutcome::Rejected(RejectReason::AppointmentNotFound { deal_id }));
        };
        let Some(deal) = self.crm.get_deal(deal_id).await else {
            return Ok(IngestOutcome::Rejected(RejectReason::DealUnavailable { deal_id }));
        };
        let details = match self.deal_details(deal_id, &deal) {
            Ok(details) => details,
            Err(reason) => return Ok(IngestOutcome::Rejected(reason)),
        };

        let moved = details.date != appointment.appointment_date;
        let changed = moved
            || details.procedure_name != appointment.procedure_name
            || details.doctor_name != appointment.doctor_name;
        if !changed {
            return Ok(IngestOutcome::Updated {
                appointment_id: appointment.id,
                changed: false,
                rescheduled: false,
            });
        }
        db::update_appointment_details(
            &self.pool,
            appointment.id,
            details.date,
            details.procedure_name.as_deref(),
            details.doctor_name.as_deref(),
        )
        .await?;
        info!(deal_id, appointment_id = appointment.id, moved, "appointment updated");

        let mut rescheduled = false;
        if moved {
            if let Some(user_id) = appointment.user_id {
                self.scheduler.cancel(JobKind::Reminder, appointment.id).await?;
                self.scheduler.cancel(JobKind::Survey, appointment.id).await?;
                let refreshed = db::get_appointment(&self.pool, appointment.id).await?;
                let user = db::get_user(&self.pool, user_id).await?;
                if let (Some(refreshed), Some(user)) = (refreshed, user) {
                    self.arrange_timers(&refreshed, &user).await?;
                    rescheduled = true;
                }
            }
        }
        Ok(IngestOutcome::Updated {
            appointment_id: appointment.id,
            changed: true,
            rescheduled,
        })
    }

    /// Store a user's phone and pick up the appointments booked under it.
    /// Returns `None` when the phone has no digits, otherwise how many
    /// appointments were newly linked or ingested.
    #[instrument(skip_all, fields(user_id = user_id))]
    pub async fn link_user_phone(&self, user_id: i64, raw_phone: &str) -> Result<Option<usize>> {
        let Some(phone) = normalize_phone(raw_phone) else {
            return Ok(None);
        };
        db::set_user_phone(&self.pool, user_id, &phone).await?;
        let Some(user) = db::get_user(&self.pool, user_id).await? else {
            return Ok(Some(0));
        };
        let now = self.clock.now();
        let mut linked = 0;

        for appointment in db::list_unlinked_by_phone(&self.pool, &phone, now).await? {
            if !db::link_appointment_user(&self.pool, appointment.id, user.id).await? {
                continue;
            }
            if let Some(appointment) = db::get_appointment(&self.pool, appointment.id).await? {
                self.notify_booking(&appointment, &user).await;
                self.arrange_timers(&appointment, &user).await?;
                linked += 1;
            }
        }

        for deal in self.crm.list_deals_by_phone(&phone).await {
            let Some(deal_id) = deal.id() else { continue };
            if db::find_appointment_by_deal(&self.pool, deal_id).await?.is_some() {
                continue;
            }
            match self.deal_details(deal_id, &deal) {
                Ok(details) if details.date > now => {}
                _ => continue,
            }
            if let IngestOutcome::Created { .. } =
                self.ingest_record(deal_id, &deal, Some(&user)).await?
            {
                linked += 1;
            }
        }
        info!(user_id, linked, "phone linked");
        Ok(Some(linked))
    }

    fn deal_details(&self, deal_id: i64, deal: &Deal) -> Result<DealDetails, RejectReason> {
        let raw = deal
            .raw_date()
            .ok_or(RejectReason::MissingDate { deal_id })?;
        let date = parse_crm_date(raw, self.settings.local_offset).ok_or_else(|| {
            RejectReason::InvalidDate {
                deal_id,
                raw: raw.to_string(),
            }
        })?;
        Ok(DealDetails {
            date,
            procedure_name: deal.procedure_name(),
            doctor_name: deal.doctor_name(),
        })
    }

    async fn deal_phone(&self, deal: &Deal) -> Option<String> {
        if let Some(phone) = deal.phones().iter().find_map(|p| normalize_phone(p)) {
            return Some(phone);
        }
        let contact = self.crm.get_contact(deal.contact_id()?).await?;
        contact.phones().iter().find_map(|p| normalize_phone(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_and_aliases() {
        assert_eq!(CrmEvent::new("DEAL_ADDED", Some(1)), CrmEvent::DealAdded(Some(1)));
        assert_eq!(CrmEvent::new("ONCRMDEALADD", Some(1)), CrmEvent::DealAdded(Some(1)));
        assert_eq!(CrmEvent::new("onCrmDealUpdate", None), CrmEvent::DealUpdated(None));
        assert_eq!(
            CrmEvent::new("ONCRMCONTACTADD", Some(3)),
            CrmEvent::Other("ONCRMCONTACTADD".into())
        );
    }

    #[test]
    fn reject_reasons_read_well() {
        assert_eq!(
            RejectReason::MissingDate { deal_id: 7 }.to_string(),
            "deal 7 has no date, cannot schedule"
        );
    }
}
