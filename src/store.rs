//! Storage seams of the notification core.
//!
//! Each store is a narrow trait so services can run against Postgres in
//! production and against [`crate::memory::MemoryStore`] in tests. Every write
//! is scoped to a single row and idempotent, so concurrent callers need no
//! locking beyond what the backing store already provides.

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    ActionTaken, HistoryStatus, HistoryStats, NotificationHistory, NotificationSettings, PushToken,
    Vehicle,
};

#[trait_variant::make(PreferenceStore: Send)]
pub trait LocalPreferenceStore {
    /// Returns the user's settings, persisting synthesized defaults on first read.
    async fn get_or_create_settings(&self, user_id: Uuid) -> Result<NotificationSettings>;

    async fn save_settings(&self, settings: &NotificationSettings) -> Result<()>;
}

#[trait_variant::make(EndpointRegistry: Send)]
pub trait LocalEndpointRegistry {
    /// Registers a device token, reactivating nothing: a token that was
    /// deactivated stays inactive and a fresh row is never created for it.
    async fn register_token(&self, user_id: Uuid, token: &str) -> Result<PushToken>;

    async fn active_tokens(&self, user_id: Uuid) -> Result<Vec<PushToken>>;

    /// Marks the endpoint inactive. Returns `false` when it already was.
    async fn deactivate_token(&self, token_id: Uuid) -> Result<bool>;

    async fn touch_tokens(&self, token_ids: &[Uuid], at: DateTime<Utc>) -> Result<()>;

    /// Deactivates every active endpoint last used before `cutoff`.
    async fn deactivate_unused_since(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn users_with_active_tokens(&self) -> Result<Vec<Uuid>>;
}

#[trait_variant::make(HistoryStore: Send)]
pub trait LocalHistoryStore {
    /// Inserts a `scheduled` entry unless one with the same id, or a live
    /// entry with the same `(user_id, rule_id)`, already exists.
    async fn insert_scheduled(&self, entry: &NotificationHistory) -> Result<bool>;

    /// Refreshes the fire time and text of a still-`scheduled` entry, inserting
    /// it when absent. Terminal entries are left untouched.
    async fn upsert_scheduled(&self, entry: &NotificationHistory) -> Result<()>;

    /// Moves a `scheduled` entry to `next`. Returns `false` when the entry is
    /// missing or already terminal.
    async fn transition(
        &self,
        user_id: Uuid,
        id: Uuid,
        next: HistoryStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn set_action(&self, user_id: Uuid, id: Uuid, action: ActionTaken) -> Result<bool>;

    async fn get(&self, user_id: Uuid, id: Uuid) -> Result<Option<NotificationHistory>>;

    /// Newest first.
    async fn list(&self, user_id: Uuid, limit: usize) -> Result<Vec<NotificationHistory>>;

    async fn stats(&self, user_id: Uuid) -> Result<HistoryStats>;

    /// Every `scheduled` entry that came from a rule, earliest fire time first.
    async fn pending_reminders(&self) -> Result<Vec<NotificationHistory>>;
}

/// Read-only view of the vehicle records owned by the CRUD layer.
#[trait_variant::make(VehicleSource: Send)]
pub trait LocalVehicleSource {
    async fn vehicles_for_user(&self, user_id: Uuid) -> Result<Vec<Vehicle>>;

    async fn users_with_vehicles(&self) -> Result<Vec<Uuid>>;
}
