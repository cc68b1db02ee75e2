//! Server-to-device push delivery.
//!
//! A send resolves the user's active endpoints, checks preferences, fans the
//! payload out to one message per endpoint, submits bounded batches and folds
//! the per-message tickets back into endpoint lifecycle and history updates.
//! Nothing here retries: a send either completes or is recorded as failed.

use anyhow::Result;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::crypto::token_fingerprint;
use crate::gate::{self, GateOptions};
use crate::metrics;
use crate::models::{
    HistoryStatus, NotificationHistory, NotificationType, Priority, PushPayload, PushToken,
    SendTarget,
};
use crate::provider::{PushMessage, PushPriority, PushProvider, PushTicket, TicketErrorKind};
use crate::store::{EndpointRegistry, HistoryStore, PreferenceStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserSendResult {
    pub user_id: Uuid,
    pub success: bool,
}

/// Outcome of a fan-out to several users; every user is reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MultiSendReport {
    pub results: Vec<UserSendResult>,
}

impl MultiSendReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn outcome(&self, user_id: Uuid) -> Option<bool> {
        self.results
            .iter()
            .find(|r| r.user_id == user_id)
            .map(|r| r.success)
    }
}

#[derive(Debug, Default)]
struct BatchTally {
    attempted: usize,
    accepted: usize,
    failed: usize,
    deactivated: usize,
}

pub struct DeliveryService<P, E, H, X> {
    preferences: Arc<P>,
    endpoints: Arc<E>,
    history: Arc<H>,
    provider: Arc<X>,
    config: DeliveryConfig,
    local_offset: FixedOffset,
}

impl<P, E, H, X> DeliveryService<P, E, H, X>
where
    P: PreferenceStore + Sync,
    E: EndpointRegistry + Sync,
    H: HistoryStore + Sync,
    X: PushProvider + Sync,
{
    pub fn new(
        preferences: Arc<P>,
        endpoints: Arc<E>,
        history: Arc<H>,
        provider: Arc<X>,
        config: DeliveryConfig,
        local_offset: FixedOffset,
    ) -> Self {
        Self {
            preferences,
            endpoints,
            history,
            provider,
            config,
            local_offset,
        }
    }

    /// `true` iff every batch was accepted and no endpoint proved undeliverable.
    pub async fn send_to_user(&self, target: SendTarget, payload: &PushPayload) -> bool {
        self.send_logged(target, payload, false).await
    }

    /// Sends to every user concurrently and waits for all of them to settle.
    pub async fn send_to_multiple_users(
        &self,
        user_ids: &[Uuid],
        payload: &PushPayload,
        notification_type: Option<NotificationType>,
    ) -> MultiSendReport {
        self.fan_out(user_ids, payload, notification_type, false).await
    }

    pub async fn broadcast_to_all_users(
        &self,
        payload: &PushPayload,
        notification_type: Option<NotificationType>,
    ) -> MultiSendReport {
        let user_ids = match self.endpoints.users_with_active_tokens().await {
            Ok(users) => users,
            Err(e) => {
                error!("Failed to resolve broadcast audience: {:#}", e);
                return MultiSendReport::default();
            }
        };

        info!(users = user_ids.len(), "Broadcasting push notification");
        self.fan_out(&user_ids, payload, notification_type, false).await
    }

    /// High-priority send that ignores quiet hours, and the per-type toggles
    /// when `emergency_bypasses_category_toggles` is set.
    pub async fn send_emergency_notification(
        &self,
        user_ids: &[Uuid],
        payload: &PushPayload,
    ) -> MultiSendReport {
        let payload = PushPayload {
            priority: Some(Priority::Critical),
            ..payload.clone()
        };
        warn!(users = user_ids.len(), title = %payload.title, "Sending emergency notification");
        self.fan_out(user_ids, &payload, Some(NotificationType::Emergency), true)
            .await
    }

    /// Deactivates every active endpoint unused for more than `days_old` days.
    pub async fn cleanup_old_tokens(&self, days_old: i64) -> Result<u64> {
        self.cleanup_old_tokens_at(days_old, Utc::now()).await
    }

    pub async fn cleanup_old_tokens_at(&self, days_old: i64, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::days(days_old);
        let deactivated = self.endpoints.deactivate_unused_since(cutoff).await?;

        metrics::TOKENS_DEACTIVATED.inc_by(deactivated as f64);
        info!(days_old, deactivated, "Stale push token sweep finished");
        Ok(deactivated)
    }

    async fn fan_out(
        &self,
        user_ids: &[Uuid],
        payload: &PushPayload,
        notification_type: Option<NotificationType>,
        emergency: bool,
    ) -> MultiSendReport {
        let sends = stream::iter(user_ids.iter().copied()).map(|user_id| async move {
            let target = SendTarget {
                user_id,
                notification_type,
            };
            UserSendResult {
                user_id,
                success: self.send_logged(target, payload, emergency).await,
            }
        });

        let report = MultiSendReport {
            results: sends
                .buffer_unordered(self.config.max_concurrent_users.max(1))
                .collect()
                .await,
        };
        info!(
            users = user_ids.len(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Multi-user send settled"
        );
        report
    }

    async fn send_logged(&self, target: SendTarget, payload: &PushPayload, emergency: bool) -> bool {
        match self.try_send(target, payload, emergency, Utc::now()).await {
            Ok(success) => success,
            Err(e) => {
                error!(user_id = %target.user_id, "Push send failed: {:#}", e);
                false
            }
        }
    }

    async fn try_send(
        &self,
        target: SendTarget,
        payload: &PushPayload,
        emergency: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let user_id = target.user_id;

        // A linked reminder is only delivered while it is still live
        if let Some(id) = payload.history_id {
            let live = self
                .history
                .get(user_id, id)
                .await?
                .is_some_and(|entry| entry.status == HistoryStatus::Scheduled);
            if !live {
                debug!(user_id = %user_id, notification_id = %id, "Reminder no longer scheduled, skipping");
                return Ok(false);
            }
        }

        let tokens = self.endpoints.active_tokens(user_id).await?;
        if tokens.is_empty() {
            debug!(user_id = %user_id, "No active push tokens");
            if let Some(id) = payload.history_id {
                self.finish(user_id, id, HistoryStatus::Failed, None).await;
            }
            return Ok(false);
        }

        // Unreadable settings fail open
        let settings = match self.preferences.get_or_create_settings(user_id).await {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!(user_id = %user_id, "Settings unavailable, allowing send: {:#}", e);
                None
            }
        };

        let options = if emergency {
            GateOptions::emergency(self.config.emergency_bypasses_category_toggles)
        } else {
            GateOptions::default()
        };
        let local_now = now.with_timezone(&self.local_offset);
        if !gate::should_fire_with(settings.as_ref(), target.notification_type, &local_now, options) {
            metrics::NOTIFICATIONS_SUPPRESSED.inc();
            info!(
                user_id = %user_id,
                notification_type = ?target.notification_type,
                "Push suppressed by user preferences"
            );
            if let Some(id) = payload.history_id {
                self.finish(user_id, id, HistoryStatus::Cancelled, None).await;
            }
            return Ok(false);
        }

        let history_id = match payload.history_id {
            Some(id) => id,
            None => self.record_ad_hoc(target, payload, now).await?,
        };

        let play_sound = settings.as_ref().map_or(true, |s| s.general.sound);
        let (valid, malformed): (Vec<&PushToken>, Vec<&PushToken>) = tokens
            .iter()
            .partition(|t| self.provider.is_valid_token(&t.token));
        for token in &malformed {
            warn!(
                user_id = %user_id,
                token = %token_fingerprint(&token.token),
                "Skipping malformed push token"
            );
        }
        if valid.is_empty() {
            self.finish(user_id, history_id, HistoryStatus::Failed, None).await;
            return Ok(false);
        }

        let messages: Vec<PushMessage> = valid
            .iter()
            .map(|token| self.build_message(token, payload, history_id, play_sound, emergency))
            .collect();

        let tally = self.submit(user_id, &valid, &messages).await;

        let attempted: Vec<Uuid> = valid.iter().map(|t| t.id).collect();
        if let Err(e) = self.endpoints.touch_tokens(&attempted, now).await {
            warn!(user_id = %user_id, "Failed to stamp token usage: {:#}", e);
        }

        let status = if tally.accepted == 0 {
            HistoryStatus::Failed
        } else if self.provider.confirms_delivery() {
            HistoryStatus::Delivered
        } else {
            HistoryStatus::Sent
        };
        let sent_at = (tally.accepted > 0).then_some(now);
        self.finish(user_id, history_id, status, sent_at).await;

        info!(
            user_id = %user_id,
            notification_id = %history_id,
            provider = self.provider.name(),
            attempted = tally.attempted,
            accepted = tally.accepted,
            failed = tally.failed,
            deactivated = tally.deactivated,
            "Push send finished"
        );

        Ok(tally.failed == 0 && tally.accepted == tally.attempted)
    }

    async fn submit(&self, user_id: Uuid, tokens: &[&PushToken], messages: &[PushMessage]) -> BatchTally {
        let batch_size = self
            .config
            .batch_size
            .min(self.provider.max_batch_size())
            .max(1);
        let mut tally = BatchTally::default();

        for (batch_tokens, batch) in tokens.chunks(batch_size).zip(messages.chunks(batch_size)) {
            tally.attempted += batch.len();
            metrics::PUSH_BATCH_SIZE.observe(batch.len() as f64);

            let started = Instant::now();
            let result = self.provider.send_batch(batch).await;
            metrics::PUSH_BATCH_LATENCY.observe(started.elapsed().as_secs_f64());

            let tickets = match result {
                Ok(tickets) => tickets,
                Err(e) => {
                    error!(
                        user_id = %user_id,
                        messages = batch.len(),
                        error = %e,
                        "Push batch submission failed"
                    );
                    tally.failed += batch.len();
                    metrics::PUSH_MESSAGES_FAILED.inc_by(batch.len() as f64);
                    continue;
                }
            };

            for (token, ticket) in batch_tokens.iter().zip(tickets) {
                match ticket {
                    PushTicket::Ok { .. } => {
                        tally.accepted += 1;
                        metrics::PUSH_MESSAGES_SENT.inc();
                    }
                    PushTicket::Error { kind, message } => {
                        tally.failed += 1;
                        metrics::PUSH_MESSAGES_FAILED.inc();
                        warn!(
                            user_id = %user_id,
                            token = %token_fingerprint(&token.token),
                            kind = ?kind,
                            error = %message,
                            "Push message rejected"
                        );

                        if kind == TicketErrorKind::DeviceNotRegistered {
                            match self.endpoints.deactivate_token(token.id).await {
                                Ok(true) => {
                                    tally.deactivated += 1;
                                    metrics::TOKENS_DEACTIVATED.inc();
                                    info!(
                                        user_id = %user_id,
                                        token = %token_fingerprint(&token.token),
                                        "Deactivated unregistered push token"
                                    );
                                }
                                Ok(false) => {}
                                Err(e) => error!("Failed to deactivate push token: {:#}", e),
                            }
                        }
                    }
                }
            }
        }

        tally
    }

    fn build_message(
        &self,
        token: &PushToken,
        payload: &PushPayload,
        history_id: Uuid,
        play_sound: bool,
        emergency: bool,
    ) -> PushMessage {
        let mut data = payload.data.clone();
        data.insert("notificationId".to_string(), history_id.to_string());

        let priority = match payload.priority {
            _ if emergency => PushPriority::High,
            Some(Priority::High | Priority::Critical) => PushPriority::High,
            _ => PushPriority::Default,
        };

        PushMessage {
            to: token.token.clone(),
            title: payload.title.clone(),
            body: payload.body.clone(),
            data,
            sound: (play_sound || emergency).then(|| {
                payload
                    .sound
                    .clone()
                    .unwrap_or_else(|| self.config.default_sound.clone())
            }),
            badge: payload.badge,
            priority,
            channel_id: Some(
                payload
                    .channel_id
                    .clone()
                    .unwrap_or_else(|| self.config.default_channel.clone()),
            ),
        }
    }

    async fn record_ad_hoc(
        &self,
        target: SendTarget,
        payload: &PushPayload,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let entry = NotificationHistory {
            id: Uuid::new_v4(),
            user_id: target.user_id,
            vehicle_id: None,
            rule_id: None,
            notification_type: target
                .notification_type
                .map_or("push", |t| t.as_str())
                .to_string(),
            category: category_label(target.notification_type).to_string(),
            title: payload.title.clone(),
            message: payload.body.clone(),
            scheduled_for: now,
            sent_at: None,
            status: HistoryStatus::Scheduled,
            priority: payload.priority.unwrap_or(Priority::Medium),
            action_taken: None,
            related_id: None,
            created_at: now,
        };
        self.history.insert_scheduled(&entry).await?;
        Ok(entry.id)
    }

    async fn finish(
        &self,
        user_id: Uuid,
        id: Uuid,
        status: HistoryStatus,
        sent_at: Option<DateTime<Utc>>,
    ) {
        match self.history.transition(user_id, id, status, sent_at).await {
            Ok(true) => {}
            Ok(false) => debug!(
                notification_id = %id,
                status = %status,
                "History entry missing or already terminal"
            ),
            Err(e) => error!(notification_id = %id, "Failed to record push outcome: {:#}", e),
        }
    }
}

fn category_label(notification_type: Option<NotificationType>) -> &'static str {
    match notification_type {
        Some(NotificationType::MaintenanceReminder) => "maintenance",
        Some(NotificationType::InspectionReminder) => "inspection",
        Some(NotificationType::PaymentReminder) => "documents",
        Some(NotificationType::Promotional) => "tips",
        Some(NotificationType::SystemUpdate) => "system",
        Some(NotificationType::Emergency) => "emergency",
        None => "general",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::{PushToken, QuietHours};
    use crate::store::{HistoryStore, PreferenceStore};
    use crate::testing::{expo_token, FakeProvider, FlakyEndpoints};
    use chrono::TimeZone;

    type Service<E = MemoryStore> = DeliveryService<MemoryStore, E, MemoryStore, FakeProvider>;

    fn service(store: &Arc<MemoryStore>, provider: &Arc<FakeProvider>) -> Service {
        DeliveryService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            provider.clone(),
            DeliveryConfig::default(),
            FixedOffset::east_opt(0).unwrap(),
        )
    }

    async fn add_token(store: &MemoryStore, user_id: Uuid, token: &str, last_used: DateTime<Utc>) -> Uuid {
        let row = PushToken {
            id: Uuid::new_v4(),
            user_id,
            token: token.to_string(),
            is_active: true,
            last_used,
        };
        let id = row.id;
        store.insert_token(row).await;
        id
    }

    fn payload() -> PushPayload {
        PushPayload {
            title: "Oil change".to_string(),
            body: "Your car needs an oil change".to_string(),
            ..Default::default()
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
    }

    fn live_entry(user_id: Uuid) -> NotificationHistory {
        NotificationHistory {
            id: Uuid::new_v4(),
            user_id,
            vehicle_id: None,
            rule_id: Some(format!("time-maintenance:{}", Uuid::new_v4())),
            notification_type: "time-maintenance".to_string(),
            category: "maintenance".to_string(),
            title: "t".to_string(),
            message: "m".to_string(),
            scheduled_for: noon(),
            sent_at: None,
            status: HistoryStatus::Scheduled,
            priority: Priority::Medium,
            action_taken: None,
            related_id: None,
            created_at: noon(),
        }
    }

    #[tokio::test]
    async fn test_malformed_endpoint_skipped_and_unregistered_deactivated() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        let t0 = noon() - Duration::days(3);
        let first = add_token(&store, user_id, &expo_token("first"), t0).await;
        let second = add_token(&store, user_id, &expo_token("second"), t0 + Duration::minutes(1)).await;
        let broken = add_token(&store, user_id, "garbage", t0 + Duration::minutes(2)).await;

        let provider = Arc::new(FakeProvider::new().unregistered(&expo_token("first")));
        let service = service(&store, &provider);

        let target = SendTarget {
            user_id,
            notification_type: Some(NotificationType::MaintenanceReminder),
        };
        let ok = service.try_send(target, &payload(), false, noon()).await.unwrap();

        assert!(!ok);
        let sent = provider.sent_tokens();
        assert_eq!(sent, vec![expo_token("first"), expo_token("second")]);
        assert!(!store.token(first).await.unwrap().is_active);
        assert!(store.token(second).await.unwrap().is_active);
        assert!(store.token(broken).await.unwrap().is_active);

        // Attempted endpoints are stamped, the skipped one is not
        assert_eq!(store.token(second).await.unwrap().last_used, noon());
        assert_eq!(store.token(broken).await.unwrap().last_used, t0 + Duration::minutes(2));
    }

    #[tokio::test]
    async fn test_successful_send_records_sent_history() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        add_token(&store, user_id, &expo_token("a"), noon()).await;
        let provider = Arc::new(FakeProvider::new());
        let service = service(&store, &provider);

        let target = SendTarget {
            user_id,
            notification_type: None,
        };
        assert!(service.try_send(target, &payload(), false, noon()).await.unwrap());

        let history = store.list(user_id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Sent);
        assert_eq!(history[0].sent_at, Some(noon()));
        assert_eq!(
            provider.sent_messages()[0].data["notificationId"],
            history[0].id.to_string()
        );
    }

    #[tokio::test]
    async fn test_confirming_provider_records_delivered() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        add_token(&store, user_id, &expo_token("a"), noon()).await;
        let provider = Arc::new(FakeProvider::new().confirming());
        let service = service(&store, &provider);

        let target = SendTarget {
            user_id,
            notification_type: None,
        };
        assert!(service.try_send(target, &payload(), false, noon()).await.unwrap());
        let history = store.list(user_id, 10).await.unwrap();
        assert_eq!(history[0].status, HistoryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_no_active_endpoints_returns_false() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::new());
        let service = service(&store, &provider);

        let ok = service
            .send_to_user(
                SendTarget {
                    user_id: Uuid::new_v4(),
                    notification_type: None,
                },
                &payload(),
            )
            .await;
        assert!(!ok);
        assert!(provider.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        for i in 0..5 {
            add_token(&store, user_id, &expo_token(&format!("device{}", i)), noon()).await;
        }
        let provider = Arc::new(FakeProvider::new().max_batch(2));
        let service = service(&store, &provider);

        let target = SendTarget {
            user_id,
            notification_type: None,
        };
        assert!(service.try_send(target, &payload(), false, noon()).await.unwrap());
        assert_eq!(provider.batch_sizes(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_failed_batch_marks_call_unsuccessful_without_deactivation() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        let token = add_token(&store, user_id, &expo_token("a"), noon()).await;
        let provider = Arc::new(FakeProvider::new().failing());
        let service = service(&store, &provider);

        let target = SendTarget {
            user_id,
            notification_type: None,
        };
        assert!(!service.try_send(target, &payload(), false, noon()).await.unwrap());
        assert!(store.token(token).await.unwrap().is_active);

        let history = store.list(user_id, 10).await.unwrap();
        assert_eq!(history[0].status, HistoryStatus::Failed);
        assert_eq!(history[0].sent_at, None);
    }

    #[tokio::test]
    async fn test_quiet_hours_suppress_and_cancel_linked_history() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        add_token(&store, user_id, &expo_token("a"), noon()).await;

        let mut settings = store.get_or_create_settings(user_id).await.unwrap();
        settings.quiet_hours = QuietHours {
            start: Some("11:00".to_string()),
            end: Some("13:00".to_string()),
        };
        store.save_settings(&settings).await.unwrap();

        let entry = live_entry(user_id);
        store.insert_scheduled(&entry).await.unwrap();

        let provider = Arc::new(FakeProvider::new());
        let service = service(&store, &provider);
        let linked = PushPayload {
            history_id: Some(entry.id),
            ..payload()
        };
        let target = SendTarget {
            user_id,
            notification_type: Some(NotificationType::MaintenanceReminder),
        };

        assert!(!service.try_send(target, &linked, false, noon()).await.unwrap());
        assert!(provider.sent_messages().is_empty());
        let stored = store.get(user_id, entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Cancelled);

        // Emergency sends ignore the window
        assert!(service.try_send(target, &payload(), true, noon()).await.unwrap());
        assert_eq!(provider.sent_messages()[0].priority, PushPriority::High);
    }

    #[tokio::test]
    async fn test_linked_send_requires_live_history() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        add_token(&store, user_id, &expo_token("a"), noon()).await;

        let cancelled = live_entry(user_id);
        store.insert_scheduled(&cancelled).await.unwrap();
        store
            .transition(user_id, cancelled.id, HistoryStatus::Cancelled, None)
            .await
            .unwrap();

        let provider = Arc::new(FakeProvider::new());
        let service = service(&store, &provider);
        let target = SendTarget {
            user_id,
            notification_type: Some(NotificationType::MaintenanceReminder),
        };

        let linked = PushPayload {
            history_id: Some(cancelled.id),
            ..payload()
        };
        assert!(!service.try_send(target, &linked, false, noon()).await.unwrap());
        // Unknown ids are refused too
        let unknown = PushPayload {
            history_id: Some(Uuid::new_v4()),
            ..payload()
        };
        assert!(!service.try_send(target, &unknown, false, noon()).await.unwrap());
        assert!(provider.sent_messages().is_empty());
        let stored = store.get(user_id, cancelled.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Cancelled);

        // A live entry goes out once, then stays terminal
        let live = live_entry(user_id);
        store.insert_scheduled(&live).await.unwrap();
        let linked = PushPayload {
            history_id: Some(live.id),
            ..payload()
        };
        assert!(service.try_send(target, &linked, false, noon()).await.unwrap());
        assert!(!service.try_send(target, &linked, false, noon()).await.unwrap());
        assert_eq!(provider.sent_messages().len(), 1);
        let stored = store.get(user_id, live.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Sent);
    }

    #[tokio::test]
    async fn test_emergency_category_bypass_follows_config() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        add_token(&store, user_id, &expo_token("a"), noon()).await;

        let mut settings = store.get_or_create_settings(user_id).await.unwrap();
        settings.push_categories.emergency_alerts = false;
        store.save_settings(&settings).await.unwrap();

        let provider = Arc::new(FakeProvider::new());
        let strict = DeliveryService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            provider.clone(),
            DeliveryConfig {
                emergency_bypasses_category_toggles: false,
                ..DeliveryConfig::default()
            },
            FixedOffset::east_opt(0).unwrap(),
        );
        let report = strict.send_emergency_notification(&[user_id], &payload()).await;
        assert_eq!(report.outcome(user_id), Some(false));

        let lenient = service(&store, &provider);
        let report = lenient.send_emergency_notification(&[user_id], &payload()).await;
        assert_eq!(report.outcome(user_id), Some(true));
    }

    #[tokio::test]
    async fn test_multi_user_send_is_all_settled() {
        let store = Arc::new(MemoryStore::new());
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        add_token(&store, user_a, &expo_token("a"), noon()).await;
        add_token(&store, user_b, &expo_token("b"), noon()).await;

        let endpoints = Arc::new(FlakyEndpoints::new(store.clone(), user_a));
        let provider = Arc::new(FakeProvider::new());
        let service: Service<FlakyEndpoints> = DeliveryService::new(
            store.clone(),
            endpoints,
            store.clone(),
            provider.clone(),
            DeliveryConfig::default(),
            FixedOffset::east_opt(0).unwrap(),
        );

        let report = service
            .send_to_multiple_users(&[user_a, user_b], &payload(), None)
            .await;

        assert_eq!(report.outcome(user_a), Some(false));
        assert_eq!(report.outcome(user_b), Some(true));
        assert_eq!(report.succeeded(), 1);
        assert_eq!(provider.sent_tokens(), vec![expo_token("b")]);
    }

    #[tokio::test]
    async fn test_fan_out_with_single_slot_settles_every_user() {
        let store = Arc::new(MemoryStore::new());
        let flaky = Uuid::new_v4();
        let users = [flaky, Uuid::new_v4(), Uuid::new_v4()];
        for (i, user_id) in users.iter().enumerate() {
            add_token(&store, *user_id, &expo_token(&format!("u{}", i)), noon()).await;
        }

        let provider = Arc::new(FakeProvider::new());
        let service: Service<FlakyEndpoints> = DeliveryService::new(
            store.clone(),
            Arc::new(FlakyEndpoints::new(store.clone(), flaky)),
            store.clone(),
            provider.clone(),
            DeliveryConfig {
                max_concurrent_users: 1,
                ..DeliveryConfig::default()
            },
            FixedOffset::east_opt(0).unwrap(),
        );

        let report = service.send_to_multiple_users(&users, &payload(), None).await;

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.outcome(flaky), Some(false));
        assert_eq!(report.succeeded(), 2);
        assert_eq!(provider.sent_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_targets_users_with_active_tokens() {
        let store = Arc::new(MemoryStore::new());
        let active_user = Uuid::new_v4();
        let inactive_user = Uuid::new_v4();
        add_token(&store, active_user, &expo_token("a"), noon()).await;
        let dead = add_token(&store, inactive_user, &expo_token("b"), noon()).await;
        store.deactivate_token(dead).await.unwrap();

        let provider = Arc::new(FakeProvider::new());
        let service = service(&store, &provider);
        let report = service.broadcast_to_all_users(&payload(), None).await;

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.outcome(active_user), Some(true));
    }

    #[tokio::test]
    async fn test_cleanup_old_tokens_respects_cutoff() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        let stale = add_token(&store, user_id, &expo_token("stale"), noon() - Duration::days(31)).await;
        let recent = add_token(&store, user_id, &expo_token("recent"), noon() - Duration::days(29)).await;
        let provider = Arc::new(FakeProvider::new());
        let service = service(&store, &provider);

        let deactivated = service.cleanup_old_tokens_at(30, noon()).await.unwrap();
        assert_eq!(deactivated, 1);
        assert!(!store.token(stale).await.unwrap().is_active);
        assert!(store.token(recent).await.unwrap().is_active);

        // A second sweep finds nothing left to do
        assert_eq!(service.cleanup_old_tokens_at(30, noon()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deactivation_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let id = add_token(&store, Uuid::new_v4(), &expo_token("a"), noon()).await;

        assert!(store.deactivate_token(id).await.unwrap());
        assert!(!store.deactivate_token(id).await.unwrap());
        assert!(!store.token(id).await.unwrap().is_active);
    }
}
