//! Notification delivery.
//!
//! Delivery is at-most-once: one request, no retry. Callers log failures and
//! move on.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DeliveryError;

/// Payload posted to the notification endpoint.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub workspace_id: Option<String>,
    pub channel: String,
    /// The unrendered template, for display alongside the text.
    pub template: String,
    pub text: String,
    pub sample_document: Value,
    pub event_type: String,
    pub database: String,
    pub collection: String,
}

/// A delivery channel for notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification. Returns the endpoint's JSON response.
    async fn notify(&self, notification: &Notification) -> Result<Value, DeliveryError>;

    /// Channel name for identification in logs.
    fn name(&self) -> &str;
}

/// Posts notifications as JSON to `<base_url>/notifySlack`.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    /// Path appended to the base URL.
    pub const PATH: &'static str = "/notifySlack";

    /// Build a notifier with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Build a notifier around an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), Self::PATH),
        }
    }

    /// Full URL notifications are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<Value, DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| DeliveryError::InvalidResponse(e.to_string()))
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    type Captured = Arc<Mutex<Vec<Value>>>;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    fn test_notifier(base: &str) -> WebhookNotifier {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .no_proxy()
            .build()
            .unwrap();
        WebhookNotifier::with_client(client, base)
    }

    fn sample() -> Notification {
        Notification {
            workspace_id: Some("ws1".to_string()),
            channel: "#sales".to_string(),
            template: "New order {{_id}}".to_string(),
            text: "New order 42".to_string(),
            sample_document: json!({"_id": "42"}),
            event_type: "insert".to_string(),
            database: "shop".to_string(),
            collection: "orders".to_string(),
        }
    }

    #[tokio::test]
    async fn posts_camel_case_body() {
        let captured: Captured = Arc::default();
        let router = Router::new()
            .route(
                "/notifySlack",
                post(|State(c): State<Captured>, Json(body): Json<Value>| async move {
                    c.lock().unwrap().push(body);
                    Json(json!({"ok": true}))
                }),
            )
            .with_state(Arc::clone(&captured));
        let base = serve(router).await;

        let notifier = test_notifier(&format!("{base}/"));
        let resp = notifier.notify(&sample()).await.unwrap();
        assert_eq!(resp, json!({"ok": true}));

        let bodies = captured.lock().unwrap();
        assert_eq!(bodies[0]["workspaceId"], "ws1");
        assert_eq!(bodies[0]["sampleDocument"]["_id"], "42");
        assert_eq!(bodies[0]["eventType"], "insert");
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let router = Router::new().route("/notifySlack", post(|| async { StatusCode::NO_CONTENT }));
        let base = serve(router).await;

        let notifier = test_notifier(&base);
        assert_eq!(notifier.notify(&sample()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn non_success_carries_body() {
        let router = Router::new().route(
            "/notifySlack",
            post(|| async { (StatusCode::BAD_GATEWAY, "channel_not_found") }),
        );
        let base = serve(router).await;

        let notifier = test_notifier(&base);
        match notifier.notify(&sample()).await {
            Err(DeliveryError::Status { status, body }) => {
                assert_eq!(status, 502);
                assert_eq!(body, "channel_not_found");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let notifier = test_notifier(&format!("http://{addr}"));
        assert!(matches!(
            notifier.notify(&sample()).await,
            Err(DeliveryError::Transport(_))
        ));
    }
}
