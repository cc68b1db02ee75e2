use reqwest::Client as HttpClient;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::provider::{ProviderError, PushMessage, PushProvider, PushTicket, TicketErrorKind};

const EXPO_MAX_BATCH: usize = 100;

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    data: Option<Vec<ExpoTicket>>,
    errors: Option<Vec<ExpoRequestError>>,
}

#[derive(Debug, Deserialize)]
struct ExpoTicket {
    status: String,
    id: Option<String>,
    message: Option<String>,
    details: Option<ExpoTicketDetails>,
}

#[derive(Debug, Deserialize)]
struct ExpoTicketDetails {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpoRequestError {
    code: Option<String>,
    message: String,
}

/// Expo push service client. Tickets only acknowledge submission.
pub struct ExpoProvider {
    http_client: HttpClient,
    push_url: String,
    access_token: Option<String>,
}

impl ExpoProvider {
    pub fn new(push_url: String, access_token: Option<String>) -> anyhow::Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http_client,
            push_url,
            access_token,
        })
    }
}

pub fn is_expo_token(token: &str) -> bool {
    ["ExponentPushToken[", "ExpoPushToken["].iter().any(|prefix| {
        token
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(']'))
            .is_some_and(|inner| !inner.is_empty() && !inner.contains(['[', ']']))
    })
}

fn tickets_from_response(
    response: ExpoResponse,
    expected: usize,
) -> Result<Vec<PushTicket>, ProviderError> {
    if let Some(errors) = response.errors.filter(|e| !e.is_empty()) {
        let body = errors
            .iter()
            .map(|e| match &e.code {
                Some(code) => format!("{}: {}", code, e.message),
                None => e.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ProviderError::Status { status: 200, body });
    }

    let data = response
        .data
        .ok_or_else(|| ProviderError::Decode("response has no data".to_string()))?;
    if data.len() != expected {
        return Err(ProviderError::TicketCount {
            expected,
            got: data.len(),
        });
    }

    Ok(data
        .into_iter()
        .map(|ticket| {
            if ticket.status == "ok" {
                PushTicket::Ok { id: ticket.id }
            } else {
                let code = ticket.details.and_then(|d| d.error).unwrap_or_default();
                PushTicket::Error {
                    kind: TicketErrorKind::from_code(&code),
                    message: ticket.message.unwrap_or(code),
                }
            }
        })
        .collect())
}

impl PushProvider for ExpoProvider {
    fn name(&self) -> &'static str {
        "expo"
    }

    fn max_batch_size(&self) -> usize {
        EXPO_MAX_BATCH
    }

    fn is_valid_token(&self, token: &str) -> bool {
        is_expo_token(token)
    }

    fn confirms_delivery(&self) -> bool {
        false
    }

    async fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, ProviderError> {
        let mut request = self
            .http_client
            .post(&self.push_url)
            .header("Accept", "application/json")
            .json(messages);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: ExpoResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        debug!(messages = messages.len(), "Expo accepted push batch");

        tickets_from_response(body, messages.len())
    }
}
