use a2::{Client, DefaultNotificationBuilder, NotificationBuilder, NotificationOptions, Priority};
use anyhow::{Context, Result};
use futures::future::join_all;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::ApnsConfig;
use crate::crypto::token_fingerprint;
use crate::provider::{
    ProviderError, PushMessage, PushPriority, PushProvider, PushTicket, TicketErrorKind,
};

/// Messages in one APNs "batch" are independent HTTP/2 requests sent concurrently.
const APNS_MAX_BATCH: usize = 50;

pub struct ApnsProvider {
    client: Client,
    topic: String,
}

impl ApnsProvider {
    pub fn new(config: &ApnsConfig) -> Result<Self> {
        let key_path = Path::new(&config.key_path);
        let key = std::fs::File::open(key_path).context(format!(
            "Failed to read APNs key file: {}",
            key_path.display()
        ))?;

        let endpoint = if config.production {
            a2::Endpoint::Production
        } else {
            a2::Endpoint::Sandbox
        };

        let client = Client::token(
            key,
            &config.key_id,
            &config.team_id,
            a2::ClientConfig::new(endpoint),
        )?;

        Ok(Self {
            client,
            topic: config.topic.clone(),
        })
    }

    async fn send_one(&self, message: &PushMessage) -> Result<PushTicket, a2::Error> {
        let mut builder = DefaultNotificationBuilder::new()
            .set_title(&message.title)
            .set_body(&message.body);
        if let Some(sound) = &message.sound {
            builder = builder.set_sound(sound);
        }
        if let Some(badge) = message.badge {
            builder = builder.set_badge(badge);
        }

        let mut payload = builder.build(
            &message.to,
            NotificationOptions {
                apns_topic: Some(&self.topic),
                apns_priority: Some(match message.priority {
                    PushPriority::High => Priority::High,
                    PushPriority::Default | PushPriority::Normal => Priority::Normal,
                }),
                apns_collapse_id: None,
                apns_expiration: None,
                apns_push_type: None,
                apns_id: None,
            },
        );

        for (key, value) in &message.data {
            payload.add_custom_data(key, value)?;
        }

        match self.client.send(payload).await {
            Ok(response) => Ok(PushTicket::Ok {
                id: response.apns_id,
            }),
            Err(a2::Error::ResponseError(response)) => {
                let reason = response
                    .error
                    .as_ref()
                    .map(|body| format!("{:?}", body.reason))
                    .unwrap_or_default();
                let kind = if response.code == 410 {
                    TicketErrorKind::DeviceNotRegistered
                } else {
                    TicketErrorKind::from_code(&reason)
                };
                Ok(PushTicket::Error {
                    kind,
                    message: format!("APNs returned {} {}", response.code, reason),
                })
            }
            Err(e) => Err(e),
        }
    }
}

pub fn is_apns_token(token: &str) -> bool {
    token.len() >= 64 && token.len() % 2 == 0 && token.chars().all(|c| c.is_ascii_hexdigit())
}

impl PushProvider for ApnsProvider {
    fn name(&self) -> &'static str {
        "apns"
    }

    fn max_batch_size(&self) -> usize {
        APNS_MAX_BATCH
    }

    fn is_valid_token(&self, token: &str) -> bool {
        is_apns_token(token)
    }

    fn confirms_delivery(&self) -> bool {
        true
    }

    async fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, ProviderError> {
        let results = join_all(messages.iter().map(|m| self.send_one(m))).await;

        let mut transport_errors = 0;
        let tickets: Vec<PushTicket> = results
            .into_iter()
            .zip(messages)
            .map(|(result, message)| match result {
                Ok(ticket) => ticket,
                Err(e) => {
                    transport_errors += 1;
                    warn!(
                        token = %token_fingerprint(&message.to),
                        error = %e,
                        "APNs request failed"
                    );
                    PushTicket::Error {
                        kind: TicketErrorKind::Other,
                        message: e.to_string(),
                    }
                }
            })
            .collect();

        if !messages.is_empty() && transport_errors == messages.len() {
            return Err(ProviderError::Transport(format!(
                "all {} APNs requests failed",
                transport_errors
            )));
        }

        debug!(messages = messages.len(), transport_errors, "APNs batch finished");
        Ok(tickets)
    }
}
