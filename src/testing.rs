//! Scripted collaborators shared by the unit tests.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::expo::is_expo_token;
use crate::memory::MemoryStore;
use crate::models::PushToken;
use crate::provider::{ProviderError, PushMessage, PushProvider, PushTicket, TicketErrorKind};
use crate::scheduler::{LocalNotificationPlatform, LocalNotificationRequest};
use crate::store::EndpointRegistry;

pub fn expo_token(device: &str) -> String {
    format!("ExponentPushToken[{}]", device)
}

#[derive(Default)]
pub struct FakeProvider {
    unregistered: HashSet<String>,
    max_batch: Option<usize>,
    fail_batches: bool,
    confirms: bool,
    batches: Mutex<Vec<Vec<PushMessage>>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unregistered(mut self, token: &str) -> Self {
        self.unregistered.insert(token.to_string());
        self
    }

    pub fn max_batch(mut self, size: usize) -> Self {
        self.max_batch = Some(size);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_batches = true;
        self
    }

    pub fn confirming(mut self) -> Self {
        self.confirms = true;
        self
    }

    pub fn sent_messages(&self) -> Vec<PushMessage> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn sent_tokens(&self) -> Vec<String> {
        self.sent_messages().into_iter().map(|m| m.to).collect()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }
}

impl PushProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch.unwrap_or(100)
    }

    fn is_valid_token(&self, token: &str) -> bool {
        is_expo_token(token)
    }

    fn confirms_delivery(&self) -> bool {
        self.confirms
    }

    async fn send_batch(&self, messages: &[PushMessage]) -> Result<Vec<PushTicket>, ProviderError> {
        if self.fail_batches {
            return Err(ProviderError::Transport("connection reset".to_string()));
        }

        self.batches.lock().unwrap().push(messages.to_vec());
        Ok(messages
            .iter()
            .map(|m| {
                if self.unregistered.contains(&m.to) {
                    PushTicket::Error {
                        kind: TicketErrorKind::DeviceNotRegistered,
                        message: "not registered".to_string(),
                    }
                } else {
                    PushTicket::Ok {
                        id: Some(Uuid::new_v4().to_string()),
                    }
                }
            })
            .collect())
    }
}

/// Endpoint registry that fails every lookup for one user.
pub struct FlakyEndpoints {
    inner: Arc<MemoryStore>,
    broken_user: Uuid,
}

impl FlakyEndpoints {
    pub fn new(inner: Arc<MemoryStore>, broken_user: Uuid) -> Self {
        Self { inner, broken_user }
    }
}

impl EndpointRegistry for FlakyEndpoints {
    async fn register_token(&self, user_id: Uuid, token: &str) -> Result<PushToken> {
        self.inner.register_token(user_id, token).await
    }

    async fn active_tokens(&self, user_id: Uuid) -> Result<Vec<PushToken>> {
        if user_id == self.broken_user {
            return Err(anyhow!("connection pool exhausted"));
        }
        self.inner.active_tokens(user_id).await
    }

    async fn deactivate_token(&self, token_id: Uuid) -> Result<bool> {
        self.inner.deactivate_token(token_id).await
    }

    async fn touch_tokens(&self, token_ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
        self.inner.touch_tokens(token_ids, at).await
    }

    async fn deactivate_unused_since(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.deactivate_unused_since(cutoff).await
    }

    async fn users_with_active_tokens(&self) -> Result<Vec<Uuid>> {
        self.inner.users_with_active_tokens().await
    }
}

/// Platform that records registrations instead of arming timers.
#[derive(Default)]
pub struct RecordingPlatform {
    pub registered: Mutex<Vec<(LocalNotificationRequest, Duration)>>,
    pub cancelled: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingPlatform {
    /// Rejects every registration.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl LocalNotificationPlatform for RecordingPlatform {
    async fn register(&self, request: LocalNotificationRequest, delay: Duration) -> Result<String> {
        if self.fail {
            return Err(anyhow!("timer facility unavailable"));
        }
        let handle = request.identifier.clone();
        self.registered.lock().unwrap().push((request, delay));
        Ok(handle)
    }

    async fn cancel(&self, handle: &str) -> Result<bool> {
        self.cancelled.lock().unwrap().push(handle.to_string());
        let registered = self.registered.lock().unwrap();
        Ok(registered.iter().any(|(r, _)| r.identifier == handle))
    }

    async fn shutdown(&self) {}
}
