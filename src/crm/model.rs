//! Typed views over Bitrix24 CRM records.
//!
//! Bitrix24 returns loosely typed maps: ids come back as strings or numbers,
//! multi-fields such as `PHONE` are either plain strings or `{VALUE, VALUE_TYPE}`
//! objects. The accessors below normalize that.
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Custom field holding the appointment date when `BEGINDATE` is not used.
pub const FIELD_APPOINTMENT_DATE: &str = "UF_CRM_APPOINTMENT_DATE";
pub const FIELD_PROCEDURE_NAME: &str = "UF_CRM_PROCEDURE_NAME";
pub const FIELD_REMINDER_CONFIRMED: &str = "UF_CRM_REMINDER_CONFIRMED";
pub const FIELD_SURVEY_RATING: &str = "UF_CRM_SURVEY_RATING";
pub const FIELD_STAGE_ID: &str = "STAGE_ID";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deal {
    fields: Map<String, Value>,
}

impl Deal {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn id(&self) -> Option<i64> {
        self.field("ID").and_then(as_i64)
    }

    pub fn contact_id(&self) -> Option<i64> {
        self.field("CONTACT_ID").and_then(as_i64).filter(|id| *id > 0)
    }

    /// Raw date string from `BEGINDATE`, falling back to the custom date field.
    pub fn raw_date(&self) -> Option<&str> {
        ["BEGINDATE", FIELD_APPOINTMENT_DATE]
            .iter()
            .filter_map(|name| self.field(name).and_then(Value::as_str))
            .map(str::trim)
            .find(|raw| !raw.is_empty())
    }

    pub fn phones(&self) -> Vec<String> {
        self.field("PHONE").map(phone_values).unwrap_or_default()
    }

    pub fn primary_phone(&self) -> Option<String> {
        self.phones().into_iter().next()
    }

    pub fn procedure_name(&self) -> Option<String> {
        ["TITLE", FIELD_PROCEDURE_NAME]
            .iter()
            .filter_map(|name| self.field(name).and_then(as_text))
            .next()
    }

    /// The responsible user id; Bitrix24 does not expand it to a name here.
    pub fn doctor_name(&self) -> Option<String> {
        self.field("ASSIGNED_BY_ID").and_then(as_text)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Contact {
    fields: Map<String, Value>,
}

impl Contact {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn phones(&self) -> Vec<String> {
        self.fields.get("PHONE").map(phone_values).unwrap_or_default()
    }
}

/// Parse a CRM date. Values without an offset are read in `local`.
pub fn parse_crm_date(raw: &str, local: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|naive| local.from_local_datetime(&naive).single())
        .map(|dt| dt.with_timezone(&Utc))
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn phone_values(value: &Value) -> Vec<String> {
    let entry = |v: &Value| match v {
        Value::Object(obj) => obj.get("VALUE").and_then(as_text),
        other => as_text(other),
    };
    match value {
        Value::Array(items) => items.iter().filter_map(entry).collect(),
        other => entry(other).into_iter().collect(),
    }
}
