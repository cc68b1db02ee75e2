use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    ActionTaken, HistoryStatus, HistoryStats, NotificationHistory, NotificationSettings, PushToken,
    Vehicle,
};
use crate::store::{EndpointRegistry, HistoryStore, PreferenceStore, VehicleSource};

/// In-process implementation of every store, used by tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    settings: RwLock<HashMap<Uuid, NotificationSettings>>,
    tokens: RwLock<HashMap<Uuid, PushToken>>,
    history: RwLock<HashMap<Uuid, NotificationHistory>>,
    vehicles: RwLock<Vec<Vehicle>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a token row as-is, including its activity flag and last-used time.
    pub async fn insert_token(&self, token: PushToken) {
        self.tokens.write().await.insert(token.id, token);
    }

    pub async fn token(&self, token_id: Uuid) -> Option<PushToken> {
        self.tokens.read().await.get(&token_id).cloned()
    }

    pub async fn add_vehicle(&self, vehicle: Vehicle) {
        self.vehicles.write().await.push(vehicle);
    }

    pub async fn has_settings(&self, user_id: Uuid) -> bool {
        self.settings.read().await.contains_key(&user_id)
    }
}

impl PreferenceStore for MemoryStore {
    async fn get_or_create_settings(&self, user_id: Uuid) -> Result<NotificationSettings> {
        let mut settings = self.settings.write().await;
        Ok(settings
            .entry(user_id)
            .or_insert_with(|| NotificationSettings::default_for_user(user_id))
            .clone())
    }

    async fn save_settings(&self, settings: &NotificationSettings) -> Result<()> {
        self.settings
            .write()
            .await
            .insert(settings.user_id, settings.clone());
        Ok(())
    }
}

impl EndpointRegistry for MemoryStore {
    async fn register_token(&self, user_id: Uuid, token: &str) -> Result<PushToken> {
        let mut tokens = self.tokens.write().await;
        if let Some(existing) = tokens.values_mut().find(|t| t.token == token) {
            existing.user_id = user_id;
            return Ok(existing.clone());
        }

        let row = PushToken {
            id: Uuid::new_v4(),
            user_id,
            token: token.to_string(),
            is_active: true,
            last_used: Utc::now(),
        };
        tokens.insert(row.id, row.clone());
        Ok(row)
    }

    async fn active_tokens(&self, user_id: Uuid) -> Result<Vec<PushToken>> {
        let tokens = self.tokens.read().await;
        let mut active: Vec<PushToken> = tokens
            .values()
            .filter(|t| t.user_id == user_id && t.is_active)
            .cloned()
            .collect();
        active.sort_by_key(|t| t.last_used);
        Ok(active)
    }

    async fn deactivate_token(&self, token_id: Uuid) -> Result<bool> {
        let mut tokens = self.tokens.write().await;
        Ok(match tokens.get_mut(&token_id) {
            Some(token) if token.is_active => {
                token.is_active = false;
                true
            }
            _ => false,
        })
    }

    async fn touch_tokens(&self, token_ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        for id in token_ids {
            if let Some(token) = tokens.get_mut(id) {
                token.last_used = at;
            }
        }
        Ok(())
    }

    async fn deactivate_unused_since(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tokens = self.tokens.write().await;
        let mut count = 0;
        for token in tokens.values_mut() {
            if token.is_active && token.last_used < cutoff {
                token.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn users_with_active_tokens(&self) -> Result<Vec<Uuid>> {
        let tokens = self.tokens.read().await;
        let users: HashSet<Uuid> = tokens
            .values()
            .filter(|t| t.is_active)
            .map(|t| t.user_id)
            .collect();
        Ok(users.into_iter().collect())
    }
}

impl HistoryStore for MemoryStore {
    async fn insert_scheduled(&self, entry: &NotificationHistory) -> Result<bool> {
        let mut history = self.history.write().await;
        if history.contains_key(&entry.id) {
            return Ok(false);
        }
        if let Some(rule_id) = &entry.rule_id {
            let live = history.values().any(|h| {
                h.user_id == entry.user_id
                    && h.status == HistoryStatus::Scheduled
                    && h.rule_id.as_deref() == Some(rule_id.as_str())
            });
            if live {
                return Ok(false);
            }
        }
        history.insert(entry.id, entry.clone());
        Ok(true)
    }

    async fn upsert_scheduled(&self, entry: &NotificationHistory) -> Result<()> {
        let exists = {
            let mut history = self.history.write().await;
            match history.get_mut(&entry.id) {
                Some(existing) => {
                    if existing.status == HistoryStatus::Scheduled {
                        existing.title = entry.title.clone();
                        existing.message = entry.message.clone();
                        existing.scheduled_for = entry.scheduled_for;
                    }
                    true
                }
                None => false,
            }
        };
        if !exists {
            self.insert_scheduled(entry).await?;
        }
        Ok(())
    }

    async fn transition(
        &self,
        user_id: Uuid,
        id: Uuid,
        next: HistoryStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut history = self.history.write().await;
        Ok(match history.get_mut(&id) {
            Some(entry) if entry.user_id == user_id && entry.status.can_transition_to(next) => {
                entry.status = next;
                if sent_at.is_some() {
                    entry.sent_at = sent_at;
                }
                true
            }
            _ => false,
        })
    }

    async fn set_action(&self, user_id: Uuid, id: Uuid, action: ActionTaken) -> Result<bool> {
        let mut history = self.history.write().await;
        Ok(match history.get_mut(&id) {
            Some(entry) if entry.user_id == user_id => {
                entry.action_taken = Some(action);
                true
            }
            _ => false,
        })
    }

    async fn get(&self, user_id: Uuid, id: Uuid) -> Result<Option<NotificationHistory>> {
        let history = self.history.read().await;
        Ok(history.get(&id).filter(|h| h.user_id == user_id).cloned())
    }

    async fn list(&self, user_id: Uuid, limit: usize) -> Result<Vec<NotificationHistory>> {
        let history = self.history.read().await;
        let mut entries: Vec<NotificationHistory> = history
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn stats(&self, user_id: Uuid) -> Result<HistoryStats> {
        let history = self.history.read().await;
        Ok(HistoryStats::from_entries(
            history.values().filter(|h| h.user_id == user_id),
        ))
    }

    async fn pending_reminders(&self) -> Result<Vec<NotificationHistory>> {
        let history = self.history.read().await;
        let mut entries: Vec<NotificationHistory> = history
            .values()
            .filter(|h| h.status == HistoryStatus::Scheduled && h.rule_id.is_some())
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        Ok(entries)
    }
}

impl VehicleSource for MemoryStore {
    async fn vehicles_for_user(&self, user_id: Uuid) -> Result<Vec<Vehicle>> {
        let vehicles = self.vehicles.read().await;
        Ok(vehicles
            .iter()
            .filter(|v| v.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn users_with_vehicles(&self) -> Result<Vec<Uuid>> {
        let vehicles = self.vehicles.read().await;
        let users: HashSet<Uuid> = vehicles.iter().map(|v| v.user_id).collect();
        Ok(users.into_iter().collect())
    }
}
