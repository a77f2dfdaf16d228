use super::model::{NewAppointment, NewInteraction};
use crate::model::{
    Appointment, JobKey, JobKind, JobPayload, ReminderAnswer, ScheduledJob, Survey, User,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

const USER_COLUMNS: &str =
    "id, telegram_id, username, first_name, last_name, phone_number, created_at";

const APPOINTMENT_COLUMNS: &str = "id, bitrix24_deal_id, user_id, phone_number, appointment_date, \
     procedure_name, doctor_name, notification_sent, reminder_sent, reminder_confirmed, \
     reminder_answered_at, created_at";

const SURVEY_COLUMNS: &str =
    "id, appointment_id, user_id, rating, sent_at, answered_at, yandex_link_sent";

const JOB_COLUMNS: &str = "kind, appointment_id, due_at, token, payload";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---- users ----

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        telegram_id: row.try_get("telegram_id")?,
        username: row.try_get("username")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        phone_number: row.try_get("phone_number")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert the user on first contact, refresh profile fields afterwards.
#[instrument(skip_all)]
pub async fn get_or_create_user(
    pool: &Pool,
    telegram_id: i64,
    username: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO users (telegram_id, username, first_name, last_name) VALUES (?, ?, ?, ?) \
         ON CONFLICT(telegram_id) DO UPDATE SET username = excluded.username, \
         first_name = excluded.first_name, last_name = excluded.last_name, \
         updated_at = CURRENT_TIMESTAMP \
         RETURNING id",
    )
    .bind(telegram_id)
    .bind(username)
    .bind(first_name)
    .bind(last_name)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn set_user_phone(pool: &Pool, user_id: i64, phone: &str) -> Result<()> {
    sqlx::query("UPDATE users SET phone_number = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(phone)
        .bind(user_id)
        .execute(pool)
        .await
        .context("failed to store user phone")?;
    Ok(())
}

pub async fn get_user(pool: &Pool, user_id: i64) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
    let row = sqlx::query(&sql).bind(user_id).fetch_optional(pool).await?;
    row.as_ref().map(user_from_row).transpose()
}

pub async fn find_user_by_telegram_id(pool: &Pool, telegram_id: i64) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE telegram_id = ?");
    let row = sqlx::query(&sql)
        .bind(telegram_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

/// Phones are stored normalized (digits only); callers normalize before lookup.
pub async fn find_user_by_phone(pool: &Pool, phone: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE phone_number = ? ORDER BY id LIMIT 1");
    let row = sqlx::query(&sql).bind(phone).fetch_optional(pool).await?;
    row.as_ref().map(user_from_row).transpose()
}

// ---- appointments ----

fn appointment_from_row(row: &SqliteRow) -> Result<Appointment> {
    let confirmed: Option<bool> = row.try_get("reminder_confirmed")?;
    Ok(Appointment {
        id: row.try_get("id")?,
        bitrix24_deal_id: row.try_get("bitrix24_deal_id")?,
        user_id: row.try_get("user_id")?,
        phone_number: row.try_get("phone_number")?,
        appointment_date: row.try_get("appointment_date")?,
        procedure_name: row.try_get("procedure_name")?,
        doctor_name: row.try_get("doctor_name")?,
        notification_sent: row.try_get("notification_sent")?,
        reminder_sent: row.try_get("reminder_sent")?,
        reminder_answer: ReminderAnswer::from_column(confirmed),
        reminder_answered_at: row.try_get("reminder_answered_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[instrument(skip_all)]
pub async fn insert_appointment(pool: &Pool, new: &NewAppointment) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO appointments (bitrix24_deal_id, user_id, phone_number, appointment_date, \
         procedure_name, doctor_name) VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(new.bitrix24_deal_id)
    .bind(new.user_id)
    .bind(new.phone_number.as_deref())
    .bind(new.appointment_date)
    .bind(new.procedure_name.as_deref())
    .bind(new.doctor_name.as_deref())
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert appointment for deal {}", new.bitrix24_deal_id))?;
    Ok(rec.get("id"))
}

pub async fn get_appointment(pool: &Pool, appointment_id: i64) -> Result<Option<Appointment>> {
    let sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?");
    let row = sqlx::query(&sql)
        .bind(appointment_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(appointment_from_row).transpose()
}

pub async fn find_appointment_by_deal(pool: &Pool, deal_id: i64) -> Result<Option<Appointment>> {
    let sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE bitrix24_deal_id = ?");
    let row = sqlx::query(&sql).bind(deal_id).fetch_optional(pool).await?;
    row.as_ref().map(appointment_from_row).transpose()
}

/// Fallback for reminder answers without an appointment id.
pub async fn latest_unanswered_reminder(pool: &Pool, user_id: i64) -> Result<Option<Appointment>> {
    let sql = format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments \
         WHERE user_id = ? AND reminder_sent = 1 AND reminder_confirmed IS NULL \
         ORDER BY julianday(appointment_date) DESC LIMIT 1"
    );
    let row = sqlx::query(&sql).bind(user_id).fetch_optional(pool).await?;
    row.as_ref().map(appointment_from_row).transpose()
}

/// Fallback for survey answers without an appointment id.
pub async fn latest_past_appointment(
    pool: &Pool,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<Appointment>> {
    let sql = format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments \
         WHERE user_id = ? AND julianday(appointment_date) < julianday(?) \
         ORDER BY julianday(appointment_date) DESC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(user_id)
        .bind(now)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(appointment_from_row).transpose()
}

/// Unlinked appointments for a phone that are still ahead of `now`.
pub async fn list_unlinked_by_phone(
    pool: &Pool,
    phone: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Appointment>> {
    let sql = format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments \
         WHERE user_id IS NULL AND phone_number = ? AND julianday(appointment_date) > julianday(?) \
         ORDER BY julianday(appointment_date) ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(phone)
        .bind(now)
        .fetch_all(pool)
        .await?;
    rows.iter().map(appointment_from_row).collect()
}

/// Returns false when the appointment already belongs to someone.
#[instrument(skip_all)]
pub async fn link_appointment_user(pool: &Pool, appointment_id: i64, user_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE appointments SET user_id = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND user_id IS NULL",
    )
    .bind(user_id)
    .bind(appointment_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn update_appointment_details(
    pool: &Pool,
    appointment_id: i64,
    appointment_date: DateTime<Utc>,
    procedure_name: Option<&str>,
    doctor_name: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE appointments SET appointment_date = ?, procedure_name = ?, doctor_name = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(appointment_date)
    .bind(procedure_name)
    .bind(doctor_name)
    .bind(appointment_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_notification_sent(pool: &Pool, appointment_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE appointments SET notification_sent = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(appointment_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Flip `reminder_sent` 0 -> 1. False means another fire already claimed it.
#[instrument(skip_all)]
pub async fn claim_reminder_sent(pool: &Pool, appointment_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE appointments SET reminder_sent = 1, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND reminder_sent = 0",
    )
    .bind(appointment_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Undo a claim whose message never went out.
pub async fn release_reminder_sent(pool: &Pool, appointment_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE appointments SET reminder_sent = 0, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND reminder_confirmed IS NULL",
    )
    .bind(appointment_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Set the tri-state once. False when the reminder was not sent or already answered.
#[instrument(skip_all)]
pub async fn record_reminder_answer(
    pool: &Pool,
    appointment_id: i64,
    answer: ReminderAnswer,
    answered_at: DateTime<Utc>,
) -> Result<bool> {
    let value = answer
        .to_column()
        .ok_or_else(|| anyhow!("cannot record an unset reminder answer"))?;
    let res = sqlx::query(
        "UPDATE appointments SET reminder_confirmed = ?, reminder_answered_at = ?, \
         updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND reminder_sent = 1 AND reminder_confirmed IS NULL",
    )
    .bind(value)
    .bind(answered_at)
    .bind(appointment_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---- surveys ----

fn survey_from_row(row: &SqliteRow) -> Result<Survey> {
    Ok(Survey {
        id: row.try_get("id")?,
        appointment_id: row.try_get("appointment_id")?,
        user_id: row.try_get("user_id")?,
        rating: row.try_get("rating")?,
        sent_at: row.try_get("sent_at")?,
        answered_at: row.try_get("answered_at")?,
        yandex_link_sent: row.try_get("yandex_link_sent")?,
    })
}

/// Insert the survey row unless one exists for the pair. Returns the new id.
#[instrument(skip_all)]
pub async fn claim_survey(
    pool: &Pool,
    appointment_id: i64,
    user_id: i64,
    sent_at: DateTime<Utc>,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT OR IGNORE INTO surveys (appointment_id, user_id, sent_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(appointment_id)
    .bind(user_id)
    .bind(sent_at)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

pub async fn delete_unanswered_survey(pool: &Pool, survey_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM surveys WHERE id = ? AND answered_at IS NULL")
        .bind(survey_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_survey(pool: &Pool, appointment_id: i64, user_id: i64) -> Result<Option<Survey>> {
    let sql = format!("SELECT {SURVEY_COLUMNS} FROM surveys WHERE appointment_id = ? AND user_id = ?");
    let row = sqlx::query(&sql)
        .bind(appointment_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(survey_from_row).transpose()
}

pub async fn find_survey_for_appointment(pool: &Pool, appointment_id: i64) -> Result<Option<Survey>> {
    let sql = format!("SELECT {SURVEY_COLUMNS} FROM surveys WHERE appointment_id = ? ORDER BY id LIMIT 1");
    let row = sqlx::query(&sql)
        .bind(appointment_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(survey_from_row).transpose()
}

/// Answered surveys are immutable: false when `answered_at` was already set.
#[instrument(skip_all)]
pub async fn record_survey_answer(
    pool: &Pool,
    survey_id: i64,
    rating: i64,
    yandex_link_sent: bool,
    answered_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE surveys SET rating = ?, answered_at = ?, yandex_link_sent = ? \
         WHERE id = ? AND answered_at IS NULL",
    )
    .bind(rating)
    .bind(answered_at)
    .bind(yandex_link_sent)
    .bind(survey_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---- interaction log ----

#[instrument(skip_all)]
pub async fn log_interaction(pool: &Pool, entry: &NewInteraction) -> Result<i64> {
    let data = entry.data.as_ref().map(|v| v.to_string());
    let rec = sqlx::query(
        "INSERT INTO interaction_logs (user_id, appointment_id, interaction_type, status, interaction_data) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(entry.user_id)
    .bind(entry.appointment_id)
    .bind(entry.kind.as_str())
    .bind(entry.status.as_str())
    .bind(data)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn count_interactions(pool: &Pool, kind: &str, status: &str) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM interaction_logs WHERE interaction_type = ? AND status = ?",
    )
    .bind(kind)
    .bind(status)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

// ---- scheduled jobs ----

fn job_from_row(row: &SqliteRow) -> Result<ScheduledJob> {
    let kind: String = row.try_get("kind")?;
    let kind = JobKind::parse_kind(&kind).ok_or_else(|| anyhow!("unknown job kind {}", kind))?;
    let appointment_id: i64 = row.try_get("appointment_id")?;
    let token: String = row.try_get("token")?;
    let payload: String = row.try_get("payload")?;
    Ok(ScheduledJob {
        key: JobKey::new(kind, appointment_id),
        due_at: row.try_get("due_at")?,
        token: Uuid::parse_str(&token).context("invalid job token")?,
        payload: serde_json::from_str::<JobPayload>(&payload).context("invalid job payload")?,
    })
}

/// Insert or replace the job for its key.
#[instrument(skip_all)]
pub async fn upsert_job(pool: &Pool, job: &ScheduledJob) -> Result<()> {
    let payload = serde_json::to_string(&job.payload)?;
    sqlx::query(
        "INSERT INTO scheduled_jobs (kind, appointment_id, due_at, token, payload) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(kind, appointment_id) DO UPDATE SET due_at = excluded.due_at, \
         token = excluded.token, payload = excluded.payload, created_at = CURRENT_TIMESTAMP",
    )
    .bind(job.key.kind.as_str())
    .bind(job.key.appointment_id)
    .bind(job.due_at)
    .bind(job.token.to_string())
    .bind(payload)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, key: JobKey) -> Result<bool> {
    let res = sqlx::query("DELETE FROM scheduled_jobs WHERE kind = ? AND appointment_id = ?")
        .bind(key.kind.as_str())
        .bind(key.appointment_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Remove the exact scheduled instance. False if it was cancelled or replaced meanwhile.
pub async fn claim_job(pool: &Pool, key: JobKey, token: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "DELETE FROM scheduled_jobs WHERE kind = ? AND appointment_id = ? AND token = ?",
    )
    .bind(key.kind.as_str())
    .bind(key.appointment_id)
    .bind(token.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn find_job(pool: &Pool, key: JobKey) -> Result<Option<ScheduledJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE kind = ? AND appointment_id = ?");
    let row = sqlx::query(&sql)
        .bind(key.kind.as_str())
        .bind(key.appointment_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn due_jobs(pool: &Pool, now: DateTime<Utc>, limit: i64) -> Result<Vec<ScheduledJob>> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE julianday(due_at) <= julianday(?) \
         ORDER BY julianday(due_at) ASC LIMIT ?"
    );
    let rows = sqlx::query(&sql)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(job_from_row).collect()
}

pub async fn list_jobs(pool: &Pool) -> Result<Vec<ScheduledJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs ORDER BY julianday(due_at) ASC");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn setup_pool() -> Pool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).unwrap()
    }

    fn new_appointment(deal: i64, user_id: Option<i64>, date: DateTime<Utc>) -> NewAppointment {
        NewAppointment {
            bitrix24_deal_id: deal,
            user_id,
            phone_number: Some("79001234567".into()),
            appointment_date: date,
            procedure_name: Some("Peeling".into()),
            doctor_name: None,
        }
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested/bot.db");
        let url = format!("sqlite://{}", file.display());
        assert_eq!(prepare_sqlite_url(&url), format!("{}?mode=rwc", url));
        assert!(file.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn user_upsert_refreshes_profile() {
        let pool = setup_pool().await;
        let id = get_or_create_user(&pool, 77, Some("anna"), Some("Anna"), None)
            .await
            .unwrap();
        let again = get_or_create_user(&pool, 77, Some("anna_k"), Some("Anna"), Some("K"))
            .await
            .unwrap();
        assert_eq!(id, again);

        set_user_phone(&pool, id, "79001234567").await.unwrap();
        let user = find_user_by_phone(&pool, "79001234567").await.unwrap().unwrap();
        assert_eq!(user.telegram_id, 77);
        assert_eq!(user.username.as_deref(), Some("anna_k"));
        assert_eq!(user.last_name.as_deref(), Some("K"));
        assert!(find_user_by_telegram_id(&pool, 78).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reminder_flags_are_claimed_once() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, 1, None, None, None).await.unwrap();
        let aid = insert_appointment(&pool, &new_appointment(100, Some(uid), at(10, 10)))
            .await
            .unwrap();

        // cannot answer before the reminder went out
        assert!(!record_reminder_answer(&pool, aid, ReminderAnswer::Confirmed, at(9, 10))
            .await
            .unwrap());

        assert!(claim_reminder_sent(&pool, aid).await.unwrap());
        assert!(!claim_reminder_sent(&pool, aid).await.unwrap());

        assert!(record_reminder_answer(&pool, aid, ReminderAnswer::Cancelled, at(9, 11))
            .await
            .unwrap());
        assert!(!record_reminder_answer(&pool, aid, ReminderAnswer::Confirmed, at(9, 12))
            .await
            .unwrap());

        let stored = get_appointment(&pool, aid).await.unwrap().unwrap();
        assert_eq!(stored.reminder_answer, ReminderAnswer::Cancelled);
        assert_eq!(stored.reminder_answered_at, Some(at(9, 11)));
        assert!(record_reminder_answer(&pool, aid, ReminderAnswer::Unset, at(9, 12))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn fallback_queries_pick_latest() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, 1, None, None, None).await.unwrap();
        let early = insert_appointment(&pool, &new_appointment(1, Some(uid), at(2, 10)))
            .await
            .unwrap();
        let late = insert_appointment(&pool, &new_appointment(2, Some(uid), at(5, 10)))
            .await
            .unwrap();
        let future = insert_appointment(&pool, &new_appointment(3, Some(uid), at(20, 10)))
            .await
            .unwrap();

        let past = latest_past_appointment(&pool, uid, at(10, 0)).await.unwrap().unwrap();
        assert_eq!(past.id, late);

        assert!(latest_unanswered_reminder(&pool, uid).await.unwrap().is_none());
        claim_reminder_sent(&pool, early).await.unwrap();
        claim_reminder_sent(&pool, future).await.unwrap();
        let pending = latest_unanswered_reminder(&pool, uid).await.unwrap().unwrap();
        assert_eq!(pending.id, future);
    }

    #[tokio::test]
    async fn survey_claim_and_answer_are_single_shot() {
        let pool = setup_pool().await;
        let uid = get_or_create_user(&pool, 1, None, None, None).await.unwrap();
        let aid = insert_appointment(&pool, &new_appointment(100, Some(uid), at(10, 10)))
            .await
            .unwrap();

        let sid = claim_survey(&pool, aid, uid, at(13, 10)).await.unwrap().unwrap();
        assert!(claim_survey(&pool, aid, uid, at(13, 11)).await.unwrap().is_none());

        assert!(record_survey_answer(&pool, sid, 4, false, at(13, 12)).await.unwrap());
        assert!(!record_survey_answer(&pool, sid, 1, false, at(13, 13)).await.unwrap());

        let survey = find_survey(&pool, aid, uid).await.unwrap().unwrap();
        assert_eq!(survey.rating, Some(4));
        assert!(survey.is_answered());

        // answered rows are not removed by the send-failure cleanup
        delete_unanswered_survey(&pool, sid).await.unwrap();
        assert!(find_survey_for_appointment(&pool, aid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn jobs_upsert_claim_and_due_order() {
        let pool = setup_pool().await;
        let key = JobKey::new(JobKind::Reminder, 5);
        let first = ScheduledJob {
            key,
            due_at: at(9, 10),
            token: Uuid::new_v4(),
            payload: JobPayload {
                appointment_id: 5,
                chat_id: 42,
            },
        };
        upsert_job(&pool, &first).await.unwrap();
        let replaced = ScheduledJob {
            due_at: at(9, 12),
            token: Uuid::new_v4(),
            ..first.clone()
        };
        upsert_job(&pool, &replaced).await.unwrap();
        assert_eq!(list_jobs(&pool).await.unwrap().len(), 1);

        assert!(due_jobs(&pool, at(9, 11), 10).await.unwrap().is_empty());
        let due = due_jobs(&pool, at(9, 12) + Duration::seconds(1), 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].token, replaced.token);

        // stale token cannot claim the replacement
        assert!(!claim_job(&pool, key, first.token).await.unwrap());
        assert!(claim_job(&pool, key, replaced.token).await.unwrap());
        assert!(find_job(&pool, key).await.unwrap().is_none());
        assert!(!delete_job(&pool, key).await.unwrap());
    }
}
