//! Outbound alarm delivery.
//!
//! The dispatch engine only needs one capability from this crate: hand a
//! rendered alarm to a named platform and learn whether it went through.
//! That capability is the [`AlarmSender`] trait; [`WebhookSender`] is the
//! production implementation, posting text messages to per-platform
//! incoming-webhook URLs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use herald_common::error::AppError;
use herald_common::types::AlarmTextMessage;

/// Delivers a rendered alarm to an outbound platform.
#[async_trait]
pub trait AlarmSender: Send + Sync {
    async fn send(&self, platform: &str, message: &AlarmTextMessage) -> Result<(), AppError>;
}

/// Text webhook body understood by chat-bot incoming webhooks.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    msg_type: &'static str,
    content: WebhookContent<'a>,
}

#[derive(Debug, Serialize)]
struct WebhookContent<'a> {
    text: &'a str,
}

/// Sends alarms as text messages to incoming webhooks, one URL per platform.
pub struct WebhookSender {
    client: reqwest::Client,
    service_name: String,
    webhooks: HashMap<String, String>,
}

impl WebhookSender {
    /// Build a sender for `webhooks` (platform name → URL).
    ///
    /// `request_timeout` bounds each HTTP round trip independently of the
    /// dispatcher's own send timeout.
    pub fn new(
        service_name: impl Into<String>,
        webhooks: HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            service_name: service_name.into(),
            webhooks,
        })
    }

    /// Render the alarm as the multi-line text body posted to the webhook.
    pub fn render_text(service_name: &str, message: &AlarmTextMessage) -> String {
        format!(
            "{}\nservice: {}\ntrace_id: {}\noperation: {}\n\n{}",
            message.title, service_name, message.trace_id, message.operation, message.info
        )
    }
}

#[async_trait]
impl AlarmSender for WebhookSender {
    async fn send(&self, platform: &str, message: &AlarmTextMessage) -> Result<(), AppError> {
        let url = self.webhooks.get(platform).ok_or_else(|| {
            AppError::Delivery(format!("No webhook configured for platform '{}'", platform))
        })?;

        let text = Self::render_text(&self.service_name, message);
        let payload = WebhookPayload {
            msg_type: "text",
            content: WebhookContent { text: &text },
        };

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Delivery(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Delivery(format!(
                "Webhook for platform '{}' returned {}: {}",
                platform, status, body
            )));
        }

        tracing::debug!(platform, trace_id = %message.trace_id, "Webhook accepted alarm");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> AlarmTextMessage {
        AlarmTextMessage {
            trace_id: "trace-42".to_string(),
            operation: "Billing.Charge".to_string(),
            title: "[ops] [PROD] charge failed".to_string(),
            info: "card declined".to_string(),
        }
    }

    fn sender_for(server: &MockServer) -> WebhookSender {
        let hooks = HashMap::from([("ops".to_string(), format!("{}/hook/ops", server.uri()))]);
        WebhookSender::new("billing", hooks, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_render_text_includes_all_fields() {
        let text = WebhookSender::render_text("billing", &message());
        assert!(text.starts_with("[ops] [PROD] charge failed"));
        assert!(text.contains("service: billing"));
        assert!(text.contains("trace_id: trace-42"));
        assert!(text.contains("operation: Billing.Charge"));
        assert!(text.ends_with("card declined"));
    }

    #[tokio::test]
    async fn test_send_posts_text_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook/ops"))
            .and(body_partial_json(serde_json::json!({ "msg_type": "text" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = sender_for(&server);
        sender.send("ops", &message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_non_success_is_delivery_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook/ops"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let sender = sender_for(&server);
        let err = sender.send("ops", &message()).await.unwrap_err();
        match err {
            AppError::Delivery(msg) => {
                assert!(msg.contains("500"));
                assert!(msg.contains("boom"));
            }
            other => panic!("Expected Delivery error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_unknown_platform() {
        let server = MockServer::start().await;
        let sender = sender_for(&server);
        let err = sender.send("biz", &message()).await.unwrap_err();
        assert!(matches!(err, AppError::Delivery(_)));
    }
}
