//! HTTP-backed channels (web push, SMS, WhatsApp, email)
//!
//! Each channel posts a JSON document to a relay endpoint configured in
//! `config.toml`. The bearer token is read from the environment variable named in
//! the channel config, never from the config file itself.

use super::{Channel, ChannelDispatcher, DeliveryResult, ErrorCode, Recipient};
use crate::config::ChannelEndpointConfig;
use crate::notifications::ProactiveMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace, warn};
use url::Url;

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Classify an HTTP status into the closed error set.
/// Returns `None` for success.
pub fn classify_status(status: u16) -> Option<(ErrorCode, bool)> {
    match status {
        200..=299 => None,
        429 => Some((ErrorCode::RateLimited, true)),
        401 | 403 => Some((ErrorCode::ExternalServiceError, false)),
        400..=499 => Some((ErrorCode::DeliveryFailed, false)),
        _ => Some((ErrorCode::ExternalServiceError, true)),
    }
}

/// Pull the provider's message id out of a response body
fn provider_message_id(body: &Value) -> Option<String> {
    ["id", "sid", "messageId", "message_id"]
        .iter()
        .find_map(|key| match body.get(*key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
}

/// Shared JSON-over-HTTP transport
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
    sender: Option<String>,
}

impl HttpTransport {
    pub fn new(
        endpoint: Url,
        token: Option<String>,
        sender: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            token,
            sender,
        })
    }

    pub fn from_config(config: &ChannelEndpointConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("Invalid channel endpoint '{}'", config.endpoint))?;
        let token = config
            .token_env
            .as_deref()
            .and_then(|var| match std::env::var(var) {
                Ok(token) => Some(token),
                Err(_) => {
                    warn!("Channels: token variable {} is not set", var);
                    None
                }
            });
        let timeout = Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        Self::new(endpoint, token, config.sender.clone(), timeout)
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// POST `body` and turn whatever happens into a [`DeliveryResult`].
    /// The notification id is sent as idempotency key so relays can deduplicate
    /// at-least-once re-sends.
    pub async fn post(&self, body: Value, idempotency_key: &str) -> DeliveryResult {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("Idempotency-Key", idempotency_key)
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Channels: request to {} failed: {}", self.endpoint, e);
                let kind = if e.is_timeout() { "timed out" } else { "failed" };
                return DeliveryResult::failed_with(
                    ErrorCode::ExternalServiceError,
                    format!("request {}: {}", kind, e),
                    true,
                );
            }
        };

        let status = response.status().as_u16();
        if let Some((code, retryable)) = classify_status(status) {
            let text = response.text().await.unwrap_or_default();
            trace!("Channels: {} answered {}: {}", self.endpoint, status, text);
            return DeliveryResult::failed_with(
                code,
                format!("HTTP {}: {}", status, crate::logging::ellipse(&text, 200)),
                retryable,
            );
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message_id =
            provider_message_id(&body).unwrap_or_else(|| idempotency_key.to_string());
        DeliveryResult::delivered(message_id)
    }
}

/// Address for `channel` or the failure to report instead of sending
fn resolve_address(channel: Channel, recipient: &Recipient) -> Result<String, DeliveryResult> {
    if recipient.is_disabled(channel) {
        return Err(DeliveryResult::failed(
            ErrorCode::UserDisabled,
            format!("{} disabled by user", channel),
        ));
    }
    recipient
        .address_for(channel)
        .map(str::to_string)
        .ok_or_else(|| {
            DeliveryResult::failed(
                ErrorCode::InvalidChannel,
                format!("no {} address for user {}", channel, recipient.contact.user_id),
            )
        })
}

fn title_of(message: &ProactiveMessage) -> String {
    message
        .metadata
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| "Aura update".to_string())
}

fn reachable(channel: Channel, recipient: &Recipient) -> bool {
    !recipient.is_disabled(channel) && recipient.address_for(channel).is_some()
}

/// Web push via a push relay
pub struct WebPushChannel {
    transport: HttpTransport,
}

impl WebPushChannel {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ChannelDispatcher for WebPushChannel {
    fn channel(&self) -> Channel {
        Channel::WebPush
    }

    fn is_available(&self, recipient: &Recipient) -> bool {
        reachable(Channel::WebPush, recipient)
    }

    async fn send(&self, message: &ProactiveMessage, recipient: &Recipient) -> DeliveryResult {
        let endpoint = match resolve_address(Channel::WebPush, recipient) {
            Ok(endpoint) => endpoint,
            Err(result) => return result,
        };
        let body = json!({
            "subscription": endpoint,
            "title": title_of(message),
            "body": message.message,
            "data": {
                "notificationId": message.id,
                "entityId": message.entity_id,
                "priority": message.priority,
            },
        });
        self.transport.post(body, &message.id).await
    }
}

/// SMS via an SMS gateway
pub struct SmsChannel {
    transport: HttpTransport,
}

impl SmsChannel {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ChannelDispatcher for SmsChannel {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn is_available(&self, recipient: &Recipient) -> bool {
        reachable(Channel::Sms, recipient)
    }

    async fn send(&self, message: &ProactiveMessage, recipient: &Recipient) -> DeliveryResult {
        let to = match resolve_address(Channel::Sms, recipient) {
            Ok(to) => to,
            Err(result) => return result,
        };
        let body = json!({
            "to": to,
            "from": self.transport.sender(),
            "body": message.message,
        });
        self.transport.post(body, &message.id).await
    }
}

/// WhatsApp via a business messaging relay
pub struct WhatsAppChannel {
    transport: HttpTransport,
}

impl WhatsAppChannel {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ChannelDispatcher for WhatsAppChannel {
    fn channel(&self) -> Channel {
        Channel::WhatsApp
    }

    fn is_available(&self, recipient: &Recipient) -> bool {
        reachable(Channel::WhatsApp, recipient)
    }

    async fn send(&self, message: &ProactiveMessage, recipient: &Recipient) -> DeliveryResult {
        let to = match resolve_address(Channel::WhatsApp, recipient) {
            Ok(to) => to,
            Err(result) => return result,
        };
        let body = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "body": message.message },
        });
        self.transport.post(body, &message.id).await
    }
}

/// Email via a transactional mail API
pub struct EmailChannel {
    transport: HttpTransport,
}

impl EmailChannel {
    pub fn new(transport: HttpTransport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ChannelDispatcher for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn is_available(&self, recipient: &Recipient) -> bool {
        reachable(Channel::Email, recipient)
    }

    async fn send(&self, message: &ProactiveMessage, recipient: &Recipient) -> DeliveryResult {
        let to = match resolve_address(Channel::Email, recipient) {
            Ok(to) => to,
            Err(result) => return result,
        };
        let body = json!({
            "from": self.transport.sender(),
            "to": [to],
            "subject": title_of(message),
            "text": message.message,
        });
        self.transport.post(body, &message.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Contact;
    use crate::notifications::NotificationPayload;
    use chrono::Utc;

    fn transport() -> HttpTransport {
        HttpTransport::new(
            Url::parse("http://127.0.0.1:9/relay").unwrap(),
            None,
            Some("Aura".to_string()),
            Duration::from_millis(200),
        )
        .unwrap()
    }

    fn message() -> ProactiveMessage {
        ProactiveMessage::from_payload(
            NotificationPayload::new("u1", "e1", "Heron at the pond"),
            vec![Channel::Sms],
            Utc::now(),
        )
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(200), None);
        assert_eq!(classify_status(202), None);
        assert_eq!(classify_status(429), Some((ErrorCode::RateLimited, true)));
        assert_eq!(classify_status(401), Some((ErrorCode::ExternalServiceError, false)));
        assert_eq!(classify_status(422), Some((ErrorCode::DeliveryFailed, false)));
        assert_eq!(classify_status(503), Some((ErrorCode::ExternalServiceError, true)));
    }

    #[test]
    fn test_provider_message_id() {
        assert_eq!(provider_message_id(&json!({"sid": "SM1"})), Some("SM1".to_string()));
        assert_eq!(provider_message_id(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(provider_message_id(&json!({"ok": true})), None);
    }

    #[tokio::test]
    async fn test_missing_address_is_invalid_channel() {
        let sms = SmsChannel::new(transport());
        let recipient = Recipient::new(Contact {
            user_id: "u1".to_string(),
            ..Default::default()
        });
        assert!(!sms.is_available(&recipient));
        let result = sms.send(&message(), &recipient).await;
        assert_eq!(result.error_code, Some(ErrorCode::InvalidChannel));
        assert!(!result.retryable);
    }

    #[tokio::test]
    async fn test_disabled_channel_is_user_disabled() {
        let email = EmailChannel::new(transport());
        let mut recipient = Recipient::new(Contact {
            user_id: "u1".to_string(),
            email: Some("owner@example.com".to_string()),
            ..Default::default()
        });
        recipient.disabled.insert(Channel::Email);
        let result = email.send(&message(), &recipient).await;
        assert_eq!(result.error_code, Some(ErrorCode::UserDisabled));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_retryable() {
        let sms = SmsChannel::new(transport());
        let recipient = Recipient::new(Contact {
            user_id: "u1".to_string(),
            phone: Some("+41790000000".to_string()),
            ..Default::default()
        });
        let result = sms.send(&message(), &recipient).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::ExternalServiceError));
        assert!(result.retryable);
    }
}
