use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use leadline_agent::planner::QueryPlanner;
use leadline_webhook::events::{handshake_ack, DeliveryPayload, WebhookEnvelope};
use leadline_webhook::processor::MessageProcessor;
use leadline_webhook::push::DeliveryClient;

use crate::bootstrap::Application;

#[derive(Clone)]
pub struct CallbackState {
    pub processor: Arc<MessageProcessor<Box<dyn QueryPlanner>>>,
    pub delivery: Arc<dyn DeliveryClient>,
}

pub fn router(app: &Application) -> Router {
    let state =
        CallbackState { processor: Arc::clone(&app.processor), delivery: Arc::clone(&app.delivery) };
    Router::new()
        .route("/callback", get(callback_probe).post(callback_delivery))
        .with_state(state)
}

/// Handshake probe. Answered statically so the relay can verify
/// connectivity before any delivery.
pub async fn callback_probe() -> Json<Value> {
    Json(handshake_ack())
}

/// Message delivery. The acknowledgement is always well-formed and always
/// returned; only retryable storage faults use a non-2xx status so the
/// relay redelivers (dedup keeps the retry harmless).
pub async fn callback_delivery(
    State(state): State<CallbackState>,
    Json(payload): Json<DeliveryPayload>,
) -> (StatusCode, Json<Value>) {
    let group_name = payload.group_name.clone();
    let envelope = WebhookEnvelope::delivery(Uuid::new_v4().to_string(), payload, Utc::now());

    tracing::info!(
        event_name = "ingress.webhook.delivery_received",
        correlation_id = %envelope.envelope_id,
        "received webhook delivery"
    );

    let ack = state.processor.handle(&envelope).await;

    if let (Some(content), Some(group)) = (&ack.content, group_name.as_deref()) {
        if group.is_empty() {
            tracing::warn!(
                event_name = "egress.push.skipped",
                correlation_id = %envelope.envelope_id,
                "missing group name; not pushing the reply"
            );
        } else if let Err(error) = state.delivery.send_group_text(group, content).await {
            // Push failure degrades to ack-only delivery of the reply.
            tracing::warn!(
                event_name = "egress.push.failed",
                correlation_id = %envelope.envelope_id,
                error = %error,
                "reply push failed; relay still receives the content in the ack"
            );
        }
    }

    let status = if ack.success { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = json!({
        "success": ack.success,
        "handled": ack.handled,
        "content": ack.content,
        "timestamp": Utc::now().to_rfc3339(),
    });
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use serde_json::json;

    use leadline_core::config::{AppConfig, ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap_with_config;

    use super::{callback_delivery, callback_probe, CallbackState};

    async fn state() -> CallbackState {
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:?cache=shared".to_owned()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("config");
        let app = bootstrap_with_config(config).await.expect("bootstrap");
        CallbackState { processor: app.processor, delivery: app.delivery }
    }

    #[tokio::test]
    async fn probe_returns_the_static_handshake() {
        let Json(body) = callback_probe().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn delivery_acknowledges_a_template_message() {
        let payload = serde_json::from_value(json!({
            "messageId": "m-1",
            "groupId": "G-1",
            "groupName": "招生一群",
            "receivedName": "SM_小赵",
            "rawSpoken": "新家长，孩子叫小明，电话13800000000",
            "atMe": "false",
        }))
        .expect("payload");

        let (status, Json(body)) = callback_delivery(State(state().await), Json(payload)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["content"].as_str().expect("content").contains("新家长已登记"));
    }

    #[tokio::test]
    async fn delivery_acknowledges_chatter_with_no_content() {
        let payload = serde_json::from_value(json!({
            "messageId": "m-2",
            "groupName": "招生一群",
            "receivedName": "SM_小赵",
            "rawSpoken": "大家早上好",
            "atMe": "false",
        }))
        .expect("payload");

        let (status, Json(body)) = callback_delivery(State(state().await), Json(payload)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["handled"], false);
        assert!(body["content"].is_null());
    }
}
