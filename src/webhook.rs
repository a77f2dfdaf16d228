//! Inbound HTTP: the Bitrix24 deal webhook and a liveness probe.
use crate::lifecycle::{CrmEvent, IngestOutcome, Lifecycle};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Clone)]
pub struct WebhookState {
    pub lifecycle: Arc<Lifecycle>,
    pub secret: Option<String>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook/bitrix24", post(bitrix24))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn serve(host: &str, port: u16, state: WebhookState) -> std::io::Result<()> {
    let address = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(%address, "webhook server listening");
    axum::serve(listener, router(state)).await
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "clinic-bot-webhook" }))
}

type Reply = (StatusCode, Json<Value>);

fn reply(status: StatusCode, body: Value) -> Reply {
    (status, Json(body))
}

pub async fn bitrix24(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    if body.iter().all(u8::is_ascii_whitespace) {
        return reply(StatusCode::BAD_REQUEST, json!({ "error": "Empty request" }));
    }
    let Some((event, deal_id)) = parse_event(&body) else {
        return reply(
            StatusCode::BAD_REQUEST,
            json!({ "error": "No event specified" }),
        );
    };

    if let Some(expected) = state.secret.as_deref() {
        let given = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected) {
            warn!(event, "webhook secret mismatch");
            return reply(StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" }));
        }
    }

    match state
        .lifecycle
        .handle_event(CrmEvent::new(&event, deal_id))
        .await
    {
        Ok(IngestOutcome::NotHandled { .. }) => {
            reply(StatusCode::OK, json!({ "status": "ignored" }))
        }
        Ok(IngestOutcome::Rejected(reason)) => reply(
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "status": "rejected", "reason": reason.to_string() }),
        ),
        Ok(outcome) => {
            info!(?outcome, "webhook processed");
            reply(StatusCode::OK, json!({ "status": "ok" }))
        }
        Err(err) => {
            error!(?err, event, "webhook processing failed");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "status": "error" }),
            )
        }
    }
}

/// Event name and deal id from `{event, data: {FIELDS: {ID}}}`.
/// Bitrix24 sends the id as a string, so both forms are read.
fn parse_event(body: &[u8]) -> Option<(String, Option<i64>)> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let event = value
        .get("event")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|e| !e.is_empty())?
        .to_string();
    let deal_id = value.pointer("/data/FIELDS/ID").and_then(|id| match id {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    Some((event, deal_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deal_id_is_read_as_string_or_number() {
        let (event, id) =
            parse_event(br#"{"event":"DEAL_ADDED","data":{"FIELDS":{"ID":"42"}}}"#).unwrap();
        assert_eq!(event, "DEAL_ADDED");
        assert_eq!(id, Some(42));

        let (_, id) = parse_event(br#"{"event":"DEAL_UPDATED","data":{"FIELDS":{"ID":7}}}"#).unwrap();
        assert_eq!(id, Some(7));

        let (_, id) = parse_event(br#"{"event":"DEAL_ADDED"}"#).unwrap();
        assert_eq!(id, None);
    }

    #[test]
    fn missing_event_is_not_parsed() {
        assert!(parse_event(b"{}").is_none());
        assert!(parse_event(br#"{"event":"  "}"#).is_none());
        assert!(parse_event(b"not json").is_none());
    }
}
