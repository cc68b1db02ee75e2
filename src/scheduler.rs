use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::delivery::DeliveryService;
use crate::gate::parse_minutes;
use crate::metrics;
use crate::models::{
    GeneralSettings, HistoryStatus, NotificationHistory, NotificationSettings, Priority,
    PushPayload, RuleCategory, ScheduledNotification, SendTarget,
};
use crate::provider::PushProvider;
use crate::store::{EndpointRegistry, HistoryStore, PreferenceStore};
use crate::template;

/// Native priority levels of the local notification facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformPriority {
    Min,
    Low,
    Default,
    High,
    Max,
}

impl From<Priority> for PlatformPriority {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Low => PlatformPriority::Low,
            Priority::Medium => PlatformPriority::Default,
            Priority::High => PlatformPriority::High,
            Priority::Critical => PlatformPriority::Max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalNotificationRequest {
    /// Also the history id of the reminder.
    pub identifier: String,
    pub user_id: Uuid,
    pub category: RuleCategory,
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
    pub priority: Priority,
    pub platform_priority: PlatformPriority,
    pub show_alert: bool,
    pub sound: bool,
    pub vibrate: bool,
    pub badge: bool,
}

/// One-shot timer facility of the host.
#[trait_variant::make(LocalNotificationPlatform: Send)]
pub trait ThreadLocalNotificationPlatform {
    /// Arms a timer firing after `delay`, returning its handle.
    async fn register(&self, request: LocalNotificationRequest, delay: Duration) -> Result<String>;

    /// Disarms a pending timer. Returns `false` when it already fired or never existed.
    async fn cancel(&self, handle: &str) -> Result<bool>;

    async fn shutdown(&self);
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryHandle {
    pub id: Option<String>,
}

impl DeliveryHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_none()
    }
}

/// Moves `scheduled_for` to the user's preferred time of day on the same local date.
///
/// An unparseable preferred time keeps the original time of day.
pub fn resolve_fire_time(
    scheduled_for: DateTime<Utc>,
    preferred_time: &str,
    offset: FixedOffset,
) -> DateTime<Utc> {
    let local = scheduled_for.with_timezone(&offset);
    let time = parse_minutes(preferred_time)
        .and_then(|m| NaiveTime::from_hms_opt(m / 60, m % 60, 0))
        .unwrap_or_else(|| local.time());

    offset
        .from_local_datetime(&local.date_naive().and_time(time))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(scheduled_for)
}

/// Seconds from `now` until `fire_at`; past instants fire immediately.
pub fn delay_until(fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    Duration::from_secs((fire_at - now).num_seconds().max(0) as u64)
}

pub struct LocalScheduler<P, H, L> {
    preferences: Arc<P>,
    history: Arc<H>,
    platform: Arc<L>,
    config: SchedulerConfig,
    local_offset: FixedOffset,
    started: AtomicBool,
}

impl<P, H, L> LocalScheduler<P, H, L>
where
    P: PreferenceStore + Sync,
    H: HistoryStore + Sync,
    L: LocalNotificationPlatform + Sync,
{
    pub fn new(
        preferences: Arc<P>,
        history: Arc<H>,
        platform: Arc<L>,
        config: SchedulerConfig,
        local_offset: FixedOffset,
    ) -> Self {
        Self {
            preferences,
            history,
            platform,
            config,
            local_offset,
            started: AtomicBool::new(false),
        }
    }

    pub fn init(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!(
            show_alert = self.config.show_alert,
            play_sound = self.config.play_sound,
            set_badge = self.config.set_badge,
            "Local scheduler started"
        );
    }

    pub async fn shutdown(&self) {
        self.started.store(false, Ordering::SeqCst);
        LocalNotificationPlatform::shutdown(self.platform.as_ref()).await;
        info!("Local scheduler stopped");
    }

    pub async fn schedule(&self, notification: &ScheduledNotification) -> DeliveryHandle {
        match self.schedule_at(notification, Utc::now()).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    notification_id = %notification.id,
                    user_id = %notification.user_id,
                    "Failed to schedule local notification: {:#}",
                    e
                );
                DeliveryHandle::empty()
            }
        }
    }

    pub async fn schedule_at(
        &self,
        notification: &ScheduledNotification,
        now: DateTime<Utc>,
    ) -> Result<DeliveryHandle> {
        if !self.started.load(Ordering::SeqCst) {
            warn!(notification_id = %notification.id, "Scheduler not started, dropping notification");
            return Ok(DeliveryHandle::empty());
        }

        let settings = self
            .preferences
            .get_or_create_settings(notification.user_id)
            .await?;
        if !settings.general.push_enabled {
            debug!(user_id = %notification.user_id, "Push disabled, not scheduling");
            return Ok(DeliveryHandle::empty());
        }

        let fire_at = resolve_fire_time(
            notification.scheduled_for,
            &settings.general.preferred_time,
            self.local_offset,
        );
        let delay = delay_until(fire_at, now);

        let title = template::render(&notification.rule.title, &notification.data);
        let body = template::render(&notification.rule.message, &notification.data);
        let mut entry = NotificationHistory::scheduled_from(notification, title, body);
        entry.scheduled_for = fire_at;

        let request = self.request_for(
            &entry,
            notification.rule.category,
            notification.data.clone(),
            &settings.general,
        );
        let handle =
            LocalNotificationPlatform::register(self.platform.as_ref(), request, delay).await?;
        self.history.upsert_scheduled(&entry).await?;

        metrics::LOCAL_NOTIFICATIONS_SCHEDULED.inc();
        info!(
            notification_id = %notification.id,
            user_id = %notification.user_id,
            rule_id = %notification.rule.id,
            fire_at = %fire_at,
            delay_secs = delay.as_secs(),
            "Scheduled local notification"
        );

        Ok(DeliveryHandle { id: Some(handle) })
    }

    /// Schedules a reminder the generator just recorded.
    ///
    /// When no timer ends up armed, the live history row is cancelled so the
    /// next generation pass can emit the rule again.
    pub async fn schedule_generated(&self, notification: &ScheduledNotification) -> DeliveryHandle {
        let handle = self.schedule(notification).await;
        if handle.is_empty() {
            self.release(notification.user_id, notification.id).await;
        }
        handle
    }

    /// Re-arms a timer for every live reminder in history, from its stored fire time and text.
    pub async fn restore_pending(&self) -> Result<usize> {
        self.restore_pending_at(Utc::now()).await
    }

    pub async fn restore_pending_at(&self, now: DateTime<Utc>) -> Result<usize> {
        if !self.started.load(Ordering::SeqCst) {
            warn!("Scheduler not started, nothing restored");
            return Ok(0);
        }

        let pending = self.history.pending_reminders().await?;
        let mut restored = 0;

        for entry in &pending {
            let category = match entry.category.parse::<RuleCategory>() {
                Ok(category) => category,
                Err(e) => {
                    warn!(notification_id = %entry.id, "Cannot restore reminder: {}", e);
                    continue;
                }
            };
            let general = match self.preferences.get_or_create_settings(entry.user_id).await {
                Ok(settings) => settings.general,
                Err(e) => {
                    warn!(user_id = %entry.user_id, "Settings unavailable, using defaults: {:#}", e);
                    NotificationSettings::default_for_user(entry.user_id).general
                }
            };

            let mut data = HashMap::new();
            if let Some(vehicle_id) = entry.vehicle_id {
                data.insert("vehicleId".to_string(), vehicle_id.to_string());
            }

            let request = self.request_for(entry, category, data, &general);
            let delay = delay_until(entry.scheduled_for, now);
            match LocalNotificationPlatform::register(self.platform.as_ref(), request, delay).await {
                Ok(_) => restored += 1,
                Err(e) => error!(notification_id = %entry.id, "Failed to restore reminder: {:#}", e),
            }
        }

        info!(pending = pending.len(), restored, "Restored local reminders");
        Ok(restored)
    }

    /// Cancels a live reminder and disarms its timer. Returns `false` for
    /// missing, foreign or terminal entries, which keep their timers.
    pub async fn cancel_notification(&self, user_id: Uuid, id: Uuid) -> Result<bool> {
        let cancelled = self
            .history
            .transition(user_id, id, HistoryStatus::Cancelled, None)
            .await?;
        if cancelled {
            let disarmed = self.cancel(&id.to_string()).await;
            info!(user_id = %user_id, notification_id = %id, disarmed, "Cancelled notification");
        }
        Ok(cancelled)
    }

    /// Disarms a pending timer; a no-op once it has fired.
    pub async fn cancel(&self, handle: &str) -> bool {
        match LocalNotificationPlatform::cancel(self.platform.as_ref(), handle).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                error!(handle = %handle, "Failed to cancel local notification: {:#}", e);
                false
            }
        }
    }

    async fn release(&self, user_id: Uuid, id: Uuid) {
        self.cancel(&id.to_string()).await;
        match self
            .history
            .transition(user_id, id, HistoryStatus::Cancelled, None)
            .await
        {
            Ok(released) => debug!(notification_id = %id, released, "Released unscheduled reminder"),
            Err(e) => error!(notification_id = %id, "Failed to release unscheduled reminder: {:#}", e),
        }
    }

    fn request_for(
        &self,
        entry: &NotificationHistory,
        category: RuleCategory,
        data: HashMap<String, String>,
        general: &GeneralSettings,
    ) -> LocalNotificationRequest {
        LocalNotificationRequest {
            identifier: entry.id.to_string(),
            user_id: entry.user_id,
            category,
            title: entry.title.clone(),
            body: entry.message.clone(),
            data,
            priority: entry.priority,
            platform_priority: entry.priority.into(),
            show_alert: self.config.show_alert,
            sound: self.config.play_sound && general.sound,
            vibrate: general.vibration,
            badge: self.config.set_badge,
        }
    }
}

/// Timer platform backed by sleeping Tokio tasks. Fired requests are emitted on a channel.
pub struct TokioTimerPlatform {
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    fired: mpsc::Sender<LocalNotificationRequest>,
}

impl TokioTimerPlatform {
    pub fn new(fired: mpsc::Sender<LocalNotificationRequest>) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            fired,
        }
    }

    pub async fn pending(&self) -> usize {
        self.timers.lock().await.len()
    }
}

impl LocalNotificationPlatform for TokioTimerPlatform {
    async fn register(&self, request: LocalNotificationRequest, delay: Duration) -> Result<String> {
        let handle = request.identifier.clone();

        // Spawn under the lock so the task cannot remove its entry before it is inserted
        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.remove(&handle) {
            previous.abort();
        }

        let task_timers = self.timers.clone();
        let fired = self.fired.clone();
        let task_handle = handle.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task_timers.lock().await.remove(&task_handle);
            if let Err(e) = fired.send(request).await {
                error!("Failed to dispatch fired notification: {}", e);
            }
        });
        timers.insert(handle.clone(), task);

        Ok(handle)
    }

    async fn cancel(&self, handle: &str) -> Result<bool> {
        Ok(match self.timers.lock().await.remove(handle) {
            Some(task) if !task.is_finished() => {
                task.abort();
                true
            }
            _ => false,
        })
    }

    async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        let pending = timers.len();
        for (_, task) in timers.drain() {
            task.abort();
        }
        info!(pending, "Aborted pending local timers");
    }
}

/// Hands fired reminders to push delivery, where preferences are checked again.
pub async fn run_fire_dispatcher<P, E, H, X>(
    mut fired: mpsc::Receiver<LocalNotificationRequest>,
    delivery: Arc<DeliveryService<P, E, H, X>>,
) -> Result<()>
where
    P: PreferenceStore + Sync,
    E: EndpointRegistry + Sync,
    H: HistoryStore + Sync,
    X: PushProvider + Sync,
{
    info!("Starting fire dispatcher");

    while let Some(request) = fired.recv().await {
        let history_id = match request.identifier.parse::<Uuid>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(identifier = %request.identifier, "Fired notification has no history id");
                None
            }
        };

        let target = SendTarget {
            user_id: request.user_id,
            notification_type: Some(request.category.push_type()),
        };
        let payload = PushPayload {
            title: request.title,
            body: request.body,
            data: request.data,
            sound: request.sound.then(|| "default".to_string()),
            badge: request.badge.then_some(1),
            priority: Some(request.priority),
            channel_id: None,
            history_id,
        };

        let delivered = delivery.send_to_user(target, &payload).await;
        debug!(user_id = %target.user_id, delivered, "Fired notification dispatched");
    }

    info!("Fire dispatcher stopped");
    Ok(())
}
