#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clinic_bot::clock::ManualClock;
use clinic_bot::crm::{normalize_phone, Contact, CrmGateway, Deal};
use clinic_bot::db::{self, Pool};
use clinic_bot::lifecycle::{Lifecycle, LifecycleSettings};
use clinic_bot::model::ScheduledJob;
use clinic_bot::notify::{Notifier, Prompt};
use clinic_bot::scheduler::{JobHandler, Scheduler};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const ADMIN_CHAT: i64 = 900;

pub async fn setup_pool() -> Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
    pub prompt: Option<Prompt>,
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingNotifier {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, chat_id: i64) -> Vec<SentMessage> {
        self.sent()
            .await
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .collect()
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, chat_id: i64, text: &str, prompt: Option<Prompt>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("telegram unavailable"));
        }
        self.sent.lock().await.push(SentMessage {
            chat_id,
            text: text.to_string(),
            prompt,
        });
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeCrm {
    deals: Arc<Mutex<HashMap<i64, Deal>>>,
    contacts: Arc<Mutex<HashMap<i64, Contact>>>,
    updates: Arc<Mutex<Vec<(i64, Map<String, Value>)>>>,
    failing_updates: Arc<AtomicBool>,
}

impl FakeCrm {
    pub async fn put_deal(&self, deal: Deal) {
        let id = deal.id().unwrap();
        self.deals.lock().await.insert(id, deal);
    }

    pub async fn put_contact(&self, contact_id: i64, phone: &str) {
        let contact = Contact::from_fields(as_map(json!({
            "ID": contact_id.to_string(),
            "PHONE": [{ "VALUE": phone, "VALUE_TYPE": "MOBILE" }],
        })));
        self.contacts.lock().await.insert(contact_id, contact);
    }

    pub fn fail_updates(&self, failing: bool) {
        self.failing_updates.store(failing, Ordering::SeqCst);
    }

    pub async fn updates(&self) -> Vec<(i64, Map<String, Value>)> {
        self.updates.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl CrmGateway for FakeCrm {
    async fn get_deal(&self, deal_id: i64) -> Option<Deal> {
        self.deals.lock().await.get(&deal_id).cloned()
    }

    async fn get_contact(&self, contact_id: i64) -> Option<Contact> {
        self.contacts.lock().await.get(&contact_id).cloned()
    }

    async fn update_deal(&self, deal_id: i64, fields: Map<String, Value>) -> bool {
        if self.failing_updates.load(Ordering::SeqCst) {
            return false;
        }
        self.updates.lock().await.push((deal_id, fields));
        true
    }

    async fn list_deals_by_phone(&self, phone: &str) -> Vec<Deal> {
        self.deals
            .lock()
            .await
            .values()
            .filter(|deal| {
                deal.phones()
                    .iter()
                    .any(|p| normalize_phone(p).as_deref() == Some(phone))
            })
            .cloned()
            .collect()
    }
}

pub fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Bitrix24-shaped deal with a procedure title and one phone.
pub fn deal(id: i64, begin: &str, phone: Option<&str>) -> Deal {
    let mut fields = as_map(json!({
        "ID": id.to_string(),
        "TITLE": "Чистка лица",
        "BEGINDATE": begin,
        "ASSIGNED_BY_ID": "7",
    }));
    if let Some(phone) = phone {
        fields.insert(
            "PHONE".into(),
            json!([{ "VALUE": phone, "VALUE_TYPE": "WORK" }]),
        );
    }
    Deal::from_fields(fields)
}

pub struct Harness {
    pub pool: Pool,
    pub clock: Arc<ManualClock>,
    pub notifier: RecordingNotifier,
    pub crm: FakeCrm,
    pub scheduler: Scheduler,
    pub lifecycle: Arc<Lifecycle>,
}

impl Harness {
    pub async fn new(now: &str) -> Self {
        let pool = setup_pool().await;
        let clock = Arc::new(ManualClock::new(at(now)));
        let notifier = RecordingNotifier::default();
        let crm = FakeCrm::default();
        let scheduler = Scheduler::new(pool.clone(), clock.clone(), 20, Duration::from_millis(10));
        let settings = LifecycleSettings {
            admin_ids: vec![ADMIN_CHAT],
            ..LifecycleSettings::default()
        };
        let lifecycle = Arc::new(Lifecycle::new(
            pool.clone(),
            scheduler.clone(),
            Arc::new(crm.clone()),
            Arc::new(notifier.clone()),
            clock.clone(),
            settings,
        ));
        Self {
            pool,
            clock,
            notifier,
            crm,
            scheduler,
            lifecycle,
        }
    }

    /// Registered user with a stored phone. Returns the user row id.
    pub async fn user(&self, telegram_id: i64, phone: &str) -> i64 {
        let id = db::get_or_create_user(&self.pool, telegram_id, None, Some("Анна"), None)
            .await
            .unwrap();
        db::set_user_phone(&self.pool, id, &normalize_phone(phone).unwrap())
            .await
            .unwrap();
        id
    }

    /// Move the clock and run every job that is due, waiting for each to finish.
    pub async fn advance_to(&self, now: &str) {
        self.clock.set(at(now));
        self.run_due().await;
    }

    pub async fn run_due(&self) {
        let handler: Arc<dyn JobHandler> = self.lifecycle.clone();
        loop {
            let started = self.scheduler.dispatch_due(handler.clone()).await.unwrap();
            if started.is_empty() {
                break;
            }
            for handle in started {
                handle.await.unwrap();
            }
        }
    }

    pub async fn pending(&self) -> Vec<ScheduledJob> {
        self.scheduler.pending_jobs().await.unwrap()
    }

    pub async fn count(&self, kind: &str, status: &str) -> i64 {
        db::count_interactions(&self.pool, kind, status).await.unwrap()
    }
}
