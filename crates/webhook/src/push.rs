use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("push request failed: {0}")]
    Request(String),
    #[error("push endpoint returned {0}")]
    Status(u16),
}

/// Outbound delivery collaborator. The core produces reply text and a
/// target group; transmitting it is this trait's job.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn send_group_text(&self, group_name: &str, content: &str)
        -> Result<(), DeliveryError>;
}

/// Push client for the relay's send API. TLS certificate verification is
/// on by default in the underlying client; do not disable it.
pub struct HttpDeliveryClient {
    http: reqwest::Client,
    base_url: String,
    robot_id: String,
}

impl HttpDeliveryClient {
    pub fn new(
        base_url: impl Into<String>,
        robot_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            robot_id: robot_id.into(),
        })
    }
}

/// Raw-message payload shape the relay expects: type 203 text addressed by
/// group title list.
pub(crate) fn push_payload(group_name: &str, content: &str) -> Value {
    json!({
        "socketType": 2,
        "list": [
            {
                "type": 203,
                "titleList": [group_name],
                "receivedContent": content,
            }
        ]
    })
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn send_group_text(
        &self,
        group_name: &str,
        content: &str,
    ) -> Result<(), DeliveryError> {
        let url = format!(
            "{}/wework/sendRawMessage?robotId={}",
            self.base_url, self.robot_id
        );
        let response = self
            .http
            .post(&url)
            .json(&push_payload(group_name, content))
            .send()
            .await
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        tracing::info!(
            event_name = "egress.push.sent",
            group = group_name,
            content_len = content.chars().count(),
            "group reply pushed"
        );
        Ok(())
    }
}

/// Drops replies on the floor (the ack still carries the content). Used
/// when no robot id is configured and in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDeliveryClient;

#[async_trait]
impl DeliveryClient for NoopDeliveryClient {
    async fn send_group_text(
        &self,
        group_name: &str,
        content: &str,
    ) -> Result<(), DeliveryError> {
        tracing::debug!(
            event_name = "egress.push.skipped",
            group = group_name,
            content_len = content.chars().count(),
            "push disabled; reply travels in the acknowledgement only"
        );
        Ok(())
    }
}
