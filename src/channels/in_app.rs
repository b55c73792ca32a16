//! In-app channel
//!
//! No external transport: the persisted message is what the app shows. The
//! channel keeps a per-user inbox of delivered message ids and only fails when the
//! user switched in-app notifications off.

use super::{Channel, ChannelDispatcher, DeliveryResult, ErrorCode, Recipient};
use crate::notifications::ProactiveMessage;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Default)]
pub struct InAppChannel {
    inbox: RwLock<HashMap<String, Vec<String>>>,
}

impl InAppChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message ids delivered in-app to `user_id`, oldest first
    pub fn inbox(&self, user_id: &str) -> Vec<String> {
        self.inbox.read().get(user_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ChannelDispatcher for InAppChannel {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    fn is_available(&self, _recipient: &Recipient) -> bool {
        true
    }

    async fn send(&self, message: &ProactiveMessage, recipient: &Recipient) -> DeliveryResult {
        if recipient.is_disabled(Channel::InApp) {
            return DeliveryResult::failed(
                ErrorCode::UserDisabled,
                "in-app notifications disabled by user",
            );
        }

        let mut inbox = self.inbox.write();
        let entries = inbox.entry(message.user_id.clone()).or_default();
        // A re-dispatch of the same message is harmless: keep one inbox entry
        if !entries.contains(&message.id) {
            entries.push(message.id.clone());
        }
        trace!("InApp: delivered {} to user {}", message.id, message.user_id);
        DeliveryResult::delivered(format!("in_app:{}", message.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Contact;
    use crate::notifications::{NotificationPayload, ProactiveMessage};
    use chrono::Utc;

    fn message() -> ProactiveMessage {
        let payload = NotificationPayload::new("u1", "e1", "Your fern is thirsty");
        ProactiveMessage::from_payload(payload, vec![Channel::InApp], Utc::now())
    }

    #[tokio::test]
    async fn test_in_app_delivers_once_per_message() {
        let channel = InAppChannel::new();
        let recipient = Recipient::new(Contact {
            user_id: "u1".to_string(),
            ..Default::default()
        });
        let msg = message();

        let first = channel.send(&msg, &recipient).await;
        let second = channel.send(&msg, &recipient).await;
        assert!(first.success && second.success);
        assert_eq!(channel.inbox("u1"), vec![msg.id.clone()]);
    }

    #[tokio::test]
    async fn test_in_app_user_disabled() {
        let channel = InAppChannel::new();
        let mut recipient = Recipient::default();
        recipient.disabled.insert(Channel::InApp);

        assert!(channel.is_available(&recipient));
        let result = channel.send(&message(), &recipient).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::UserDisabled));
        assert!(!result.retryable);
    }
}
