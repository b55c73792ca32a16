//! Delivery channels
//!
//! Every channel implements [`ChannelDispatcher`] and reports a uniform
//! [`DeliveryResult`]. Transport-specific failures are classified into the closed
//! [`ErrorCode`] set, so retry decisions never look at transport error shapes.
//! Dispatchers are registered in a [`ChannelRegistry`] keyed by [`Channel`].

pub mod external;
pub mod in_app;

use crate::config::ChannelsConfig;
use crate::notifications::ProactiveMessage;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

pub use external::{EmailChannel, HttpTransport, SmsChannel, WebPushChannel, WhatsAppChannel};
pub use in_app::InAppChannel;

/// Delivery transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "IN_APP")]
    InApp,
    #[serde(rename = "WEB_PUSH")]
    WebPush,
    #[serde(rename = "SMS")]
    Sms,
    #[serde(rename = "WHATSAPP")]
    WhatsApp,
    #[serde(rename = "EMAIL")]
    Email,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::InApp,
        Channel::WebPush,
        Channel::Sms,
        Channel::WhatsApp,
        Channel::Email,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InApp => "IN_APP",
            Channel::WebPush => "WEB_PUSH",
            Channel::Sms => "SMS",
            Channel::WhatsApp => "WHATSAPP",
            Channel::Email => "EMAIL",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        Channel::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown channel '{}'", s))
    }
}

/// Closed set of delivery failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DeliveryFailed,
    RateLimited,
    QuietHours,
    UserDisabled,
    InvalidChannel,
    ExternalServiceError,
}

impl ErrorCode {
    /// Whether a failure with this code is worth retrying when the dispatcher
    /// does not say otherwise
    pub fn retryable_by_default(&self) -> bool {
        matches!(self, ErrorCode::RateLimited | ErrorCode::ExternalServiceError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::DeliveryFailed => "DELIVERY_FAILED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::QuietHours => "QUIET_HOURS",
            ErrorCode::UserDisabled => "USER_DISABLED",
            ErrorCode::InvalidChannel => "INVALID_CHANNEL",
            ErrorCode::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
        };
        f.write_str(code)
    }
}

/// Outcome of one send attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub retryable: bool,
}

impl DeliveryResult {
    pub fn delivered(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
            error_code: None,
            retryable: false,
        }
    }

    pub fn failed(code: ErrorCode, error: impl Into<String>) -> Self {
        Self::failed_with(code, error, code.retryable_by_default())
    }

    pub fn failed_with(code: ErrorCode, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
            error_code: Some(code),
            retryable,
        }
    }
}

/// Addresses a user can be reached at (contact directory collaborator)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub whatsapp: Option<String>,
    #[serde(default)]
    pub push_endpoint: Option<String>,
}

/// Contact details plus the channels the user switched off
#[derive(Debug, Clone, Default)]
pub struct Recipient {
    pub contact: Contact,
    pub disabled: HashSet<Channel>,
}

impl Recipient {
    pub fn new(contact: Contact) -> Self {
        Self {
            contact,
            disabled: HashSet::new(),
        }
    }

    pub fn is_disabled(&self, channel: Channel) -> bool {
        self.disabled.contains(&channel)
    }

    /// Address for an external channel; `None` for IN_APP or when unknown
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        let address = match channel {
            Channel::InApp => None,
            Channel::WebPush => self.contact.push_endpoint.as_deref(),
            Channel::Sms => self.contact.phone.as_deref(),
            Channel::WhatsApp => self
                .contact
                .whatsapp
                .as_deref()
                .or(self.contact.phone.as_deref()),
            Channel::Email => self.contact.email.as_deref(),
        };
        address.filter(|a| !a.trim().is_empty())
    }
}

/// Uniform channel adapter. `send` never fails: every failure is a
/// [`DeliveryResult`] with an error code.
#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    fn channel(&self) -> Channel;

    /// Whether this channel can currently reach `recipient`
    fn is_available(&self, recipient: &Recipient) -> bool {
        !recipient.is_disabled(self.channel())
    }

    async fn send(&self, message: &ProactiveMessage, recipient: &Recipient) -> DeliveryResult;
}

/// Channel → dispatcher lookup table. IN_APP is always registered.
pub struct ChannelRegistry {
    dispatchers: HashMap<Channel, Arc<dyn ChannelDispatcher>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            dispatchers: HashMap::new(),
        };
        registry.register(Arc::new(InAppChannel::new()));
        registry
    }

    /// Registry with every external channel that has an endpoint configured
    pub fn from_config(config: &ChannelsConfig) -> Result<Self> {
        let mut registry = Self::new();
        if let Some(cfg) = &config.web_push {
            registry.register(Arc::new(WebPushChannel::new(HttpTransport::from_config(cfg)?)));
        }
        if let Some(cfg) = &config.sms {
            registry.register(Arc::new(SmsChannel::new(HttpTransport::from_config(cfg)?)));
        }
        if let Some(cfg) = &config.whatsapp {
            registry.register(Arc::new(WhatsAppChannel::new(HttpTransport::from_config(cfg)?)));
        }
        if let Some(cfg) = &config.email {
            registry.register(Arc::new(EmailChannel::new(HttpTransport::from_config(cfg)?)));
        }
        info!(
            "Channels: registered {:?}",
            registry.channels().iter().map(|c| c.as_str()).collect::<Vec<_>>()
        );
        Ok(registry)
    }

    /// Add or replace the dispatcher for its channel
    pub fn register(&mut self, dispatcher: Arc<dyn ChannelDispatcher>) {
        self.dispatchers.insert(dispatcher.channel(), dispatcher);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelDispatcher>> {
        self.dispatchers.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.dispatchers.keys().copied().collect();
        channels.sort();
        channels
    }

    /// First requested channel that is registered and available for the
    /// recipient, falling back to IN_APP.
    pub fn select(&self, requested: &[Channel], recipient: &Recipient) -> Channel {
        for channel in requested {
            match self.dispatchers.get(channel) {
                Some(dispatcher) if dispatcher.is_available(recipient) => return *channel,
                Some(_) => debug!(
                    "Channels: {} unavailable for user {}",
                    channel, recipient.contact.user_id
                ),
                None => debug!("Channels: {} not registered", channel),
            }
        }
        Channel::InApp
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
