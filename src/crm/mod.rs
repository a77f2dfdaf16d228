use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod model;

pub use model::{Contact, Deal};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// CRM calls the lifecycle depends on. Every call is best-effort: failures are
/// logged by the implementation and surface as `None`, `false` or an empty list.
#[async_trait]
pub trait CrmGateway: Send + Sync {
    async fn get_deal(&self, deal_id: i64) -> Option<Deal>;

    async fn get_contact(&self, contact_id: i64) -> Option<Contact>;

    async fn update_deal(&self, deal_id: i64, fields: Map<String, Value>) -> bool;

    async fn list_deals_by_phone(&self, phone: &str) -> Vec<Deal>;
}

/// Bitrix24 REST client bound to an inbound webhook URL
/// (`https://<portal>/rest/<user>/<token>/`).
#[derive(Clone)]
pub struct Bitrix24Client {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for Bitrix24Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the webhook path embeds the access token
        f.debug_struct("Bitrix24Client")
            .field("host", &self.base_url.host_str())
            .finish_non_exhaustive()
    }
}

impl Bitrix24Client {
    pub fn new(webhook_url: &str) -> Result<Self> {
        let mut raw = webhook_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw).context("invalid Bitrix24 webhook URL")?;
        let http = Client::builder()
            .user_agent("clinic-bot/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base_url })
    }

    pub fn build_request(&self, method: &str, params: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(method)
            .with_context(|| format!("invalid Bitrix24 method {method}"))?;
        self.http
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(params)
            .build()
            .context("failed to build Bitrix24 request")
    }

    /// Call a REST method. `Ok(None)` means Bitrix24 answered with an `error` body.
    pub async fn call(&self, method: &str, params: Value) -> Result<Option<Value>> {
        let request = self.build_request(method, &params)?;
        debug!(method, "bitrix24 request");
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach Bitrix24 for {method}"))?;
        let status = res.status();
        let body: Value = res
            .json()
            .await
            .with_context(|| format!("invalid Bitrix24 response for {method} ({status})"))?;
        if let Some(result) = interpret_response(method, &body) {
            return Ok(Some(result));
        }
        if status.is_success() || body.get("error").is_some() {
            return Ok(None);
        }
        Err(anyhow!("bitrix24 {method} failed with {status}"))
    }

    async fn call_soft(&self, method: &str, params: Value) -> Option<Value> {
        match self.call(method, params).await {
            Ok(result) => result,
            Err(err) => {
                warn!(?err, method, "bitrix24 call failed");
                None
            }
        }
    }
}

/// Extract `result` from a Bitrix24 response body; a body carrying `error` yields `None`.
pub fn interpret_response(method: &str, body: &Value) -> Option<Value> {
    if let Some(error) = body.get("error") {
        let description = body
            .get("error_description")
            .and_then(|d| d.as_str())
            .unwrap_or("");
        warn!(method, error = %error, description, "bitrix24 returned an error");
        return None;
    }
    body.get("result").filter(|r| !r.is_null()).cloned()
}

/// Keep only the digits of a phone number, as Bitrix24 phone filters expect.
pub fn phone_digits(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Canonical stored form of a Russian phone number: `7XXXXXXXXXX`.
/// Other numbers keep their digits unchanged.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let digits = phone_digits(phone);
    match digits.len() {
        0 => None,
        10 => Some(format!("7{digits}")),
        11 if digits.starts_with('8') => Some(format!("7{}", &digits[1..])),
        _ => Some(digits),
    }
}

#[async_trait]
impl CrmGateway for Bitrix24Client {
    async fn get_deal(&self, deal_id: i64) -> Option<Deal> {
        match self.call_soft("crm.deal.get", json!({ "id": deal_id })).await? {
            Value::Object(fields) => Some(Deal::from_fields(fields)),
            other => {
                warn!(deal_id, result = %other, "unexpected crm.deal.get result");
                None
            }
        }
    }

    async fn get_contact(&self, contact_id: i64) -> Option<Contact> {
        match self
            .call_soft("crm.contact.get", json!({ "id": contact_id }))
            .await?
        {
            Value::Object(fields) => Some(Contact::from_fields(fields)),
            _ => None,
        }
    }

    async fn update_deal(&self, deal_id: i64, fields: Map<String, Value>) -> bool {
        let params = json!({ "id": deal_id, "fields": Value::Object(fields) });
        let updated = !matches!(
            self.call_soft("crm.deal.update", params).await,
            None | Some(Value::Bool(false))
        );
        if updated {
            info!(deal_id, "bitrix24 deal updated");
        }
        updated
    }

    async fn list_deals_by_phone(&self, phone: &str) -> Vec<Deal> {
        let params = json!({
            "filter": { "PHONE": phone_digits(phone) },
            "select": ["*", "UF_*"],
        });
        match self.call_soft("crm.deal.list", params).await {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(fields) => Some(Deal::from_fields(fields)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_targets_method_under_webhook() {
        let client = Bitrix24Client::new("https://clinic.bitrix24.ru/rest/1/secret").unwrap();
        let request = client
            .build_request("crm.deal.get", &json!({ "id": 100 }))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/rest/1/secret/crm.deal.get");
        assert_eq!(
            request
                .headers()
                .get("Content-Type")
                .and_then(|h| h.to_str().ok()),
            Some("application/json")
        );
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let sent: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(sent, json!({ "id": 100 }));
    }

    #[test]
    fn debug_hides_webhook_token() {
        let client = Bitrix24Client::new("https://clinic.bitrix24.ru/rest/1/secret/").unwrap();
        let rendered = format!("{client:?}");
        assert!(rendered.contains("clinic.bitrix24.ru"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn error_body_is_a_soft_failure() {
        let body = json!({ "error": "NOT_FOUND", "error_description": "Not found" });
        assert_eq!(interpret_response("crm.deal.get", &body), None);
        let ok = json!({ "result": { "ID": "1" }, "time": {} });
        assert_eq!(interpret_response("crm.deal.get", &ok), Some(json!({ "ID": "1" })));
        assert_eq!(interpret_response("crm.deal.get", &json!({ "result": null })), None);
    }

    #[test]
    fn phone_digits_strips_formatting() {
        assert_eq!(phone_digits("+7 (900) 000-00-01"), "79000000001");
    }

    #[test]
    fn normalize_phone_unifies_russian_prefixes() {
        assert_eq!(normalize_phone("+7 (900) 000-00-01").as_deref(), Some("79000000001"));
        assert_eq!(normalize_phone("8 900 000 00 01").as_deref(), Some("79000000001"));
        assert_eq!(normalize_phone("9000000001").as_deref(), Some("79000000001"));
        assert_eq!(normalize_phone("+44 20 7946 0958").as_deref(), Some("442079460958"));
        assert_eq!(normalize_phone(" - "), None);
    }

    #[test]
    fn rejects_malformed_webhook_url() {
        assert!(Bitrix24Client::new("not a url").is_err());
    }
}
