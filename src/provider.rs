use serde::Serialize;
use std::collections::HashMap;

use crate::apns::ApnsProvider;
use crate::expo::ExpoProvider;

/// One device-addressed message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    pub priority: PushPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPriority {
    Default,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketErrorKind {
    /// The endpoint is permanently gone and must be deactivated.
    DeviceNotRegistered,
    MessageTooBig,
    RateExceeded,
    InvalidCredentials,
    Other,
}

impl TicketErrorKind {
    pub fn from_code(code: &str) -> Self {
        match code {
            "DeviceNotRegistered" | "Unregistered" | "BadDeviceToken" => {
                TicketErrorKind::DeviceNotRegistered
            }
            "MessageTooBig" | "PayloadTooLarge" => TicketErrorKind::MessageTooBig,
            "MessageRateExceeded" | "TooManyRequests" => TicketErrorKind::RateExceeded,
            "InvalidCredentials" | "InvalidProviderToken" | "ExpiredProviderToken" => {
                TicketErrorKind::InvalidCredentials
            }
            _ => TicketErrorKind::Other,
        }
    }
}

/// Per-message outcome reported by the provider, in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum PushTicket {
    Ok { id: Option<String> },
    Error { kind: TicketErrorKind, message: String },
}

/// Failure of a whole batch submission.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode provider response: {0}")]
    Decode(String),
    #[error("provider returned {got} tickets for {expected} messages")]
    TicketCount { expected: usize, got: usize },
}

#[trait_variant::make(PushProvider: Send)]
pub trait LocalPushProvider {
    fn name(&self) -> &'static str;

    /// Largest number of messages accepted in one request.
    fn max_batch_size(&self) -> usize;

    fn is_valid_token(&self, token: &str) -> bool;

    /// Whether an accepted message counts as delivered rather than merely sent.
    fn confirms_delivery(&self) -> bool;

    /// Submits one batch, returning one ticket per message in order.
    async fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, ProviderError>;
}

/// Provider selected at start-up.
pub enum Provider {
    Expo(ExpoProvider),
    Apns(ApnsProvider),
}

impl PushProvider for Provider {
    fn name(&self) -> &'static str {
        match self {
            Provider::Expo(p) => PushProvider::name(p),
            Provider::Apns(p) => PushProvider::name(p),
        }
    }

    fn max_batch_size(&self) -> usize {
        match self {
            Provider::Expo(p) => PushProvider::max_batch_size(p),
            Provider::Apns(p) => PushProvider::max_batch_size(p),
        }
    }

    fn is_valid_token(&self, token: &str) -> bool {
        match self {
            Provider::Expo(p) => PushProvider::is_valid_token(p, token),
            Provider::Apns(p) => PushProvider::is_valid_token(p, token),
        }
    }

    fn confirms_delivery(&self) -> bool {
        match self {
            Provider::Expo(p) => PushProvider::confirms_delivery(p),
            Provider::Apns(p) => PushProvider::confirms_delivery(p),
        }
    }

    async fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, ProviderError> {
        match self {
            Provider::Expo(p) => PushProvider::send_batch(p, messages).await,
            Provider::Apns(p) => PushProvider::send_batch(p, messages).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_error_kind_from_code() {
        assert_eq!(
            TicketErrorKind::from_code("DeviceNotRegistered"),
            TicketErrorKind::DeviceNotRegistered
        );
        assert_eq!(
            TicketErrorKind::from_code("Unregistered"),
            TicketErrorKind::DeviceNotRegistered
        );
        assert_eq!(TicketErrorKind::from_code("MessageTooBig"), TicketErrorKind::MessageTooBig);
        assert_eq!(
            TicketErrorKind::from_code("MessageRateExceeded"),
            TicketErrorKind::RateExceeded
        );
        assert_eq!(TicketErrorKind::from_code("Mystery"), TicketErrorKind::Other);
    }

    #[test]
    fn test_message_serializes_like_expo_expects() {
        let message = PushMessage {
            to: "ExponentPushToken[abc]".to_string(),
            title: "t".to_string(),
            body: "b".to_string(),
            data: HashMap::new(),
            sound: Some("default".to_string()),
            badge: None,
            priority: PushPriority::High,
            channel_id: Some("default".to_string()),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["to"], "ExponentPushToken[abc]");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["channelId"], "default");
        assert!(json.get("badge").is_none());
    }
}
