use anyhow::Result;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::models::{ActionTaken, HistoryStats, NotificationHistory};
use crate::store::HistoryStore;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Read and update surface over the notification log for the app UI.
pub struct HistoryService<H> {
    history: Arc<H>,
}

impl<H> HistoryService<H>
where
    H: HistoryStore + Sync,
{
    pub fn new(history: Arc<H>) -> Self {
        Self { history }
    }

    pub async fn get_history(&self, user_id: Uuid, limit: Option<usize>) -> Result<Vec<NotificationHistory>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        self.history.list(user_id, limit).await
    }

    pub async fn get_stats(&self, user_id: Uuid) -> Result<HistoryStats> {
        self.history.stats(user_id).await
    }

    /// Records what the user did with a notification. Status is not touched.
    pub async fn mark_notification_action(
        &self,
        user_id: Uuid,
        id: Uuid,
        action: ActionTaken,
    ) -> Result<bool> {
        let updated = self.history.set_action(user_id, id, action).await?;
        debug!(user_id = %user_id, notification_id = %id, action = %action, updated, "Marked notification action");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::{HistoryStatus, Priority};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn entry(user_id: Uuid, created_at: DateTime<Utc>) -> NotificationHistory {
        NotificationHistory {
            id: Uuid::new_v4(),
            user_id,
            vehicle_id: None,
            rule_id: None,
            notification_type: "time-maintenance".to_string(),
            category: "maintenance".to_string(),
            title: "Routine maintenance".to_string(),
            message: "Book a check".to_string(),
            scheduled_for: created_at,
            sent_at: None,
            status: HistoryStatus::Scheduled,
            priority: Priority::Medium,
            action_taken: None,
            related_id: None,
            created_at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_limited() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for hours in 0..3 {
            let e = entry(user_id, t0() + Duration::hours(hours));
            ids.push(e.id);
            store.insert_scheduled(&e).await.unwrap();
        }
        store.insert_scheduled(&entry(Uuid::new_v4(), t0())).await.unwrap();

        let service = HistoryService::new(store);
        let all = service.get_history(user_id, None).await.unwrap();
        assert_eq!(all.iter().map(|h| h.id).collect::<Vec<_>>(), vec![ids[2], ids[1], ids[0]]);

        let latest = service.get_history(user_id, Some(1)).await.unwrap();
        assert_eq!(latest[0].id, ids[2]);
    }

    #[tokio::test]
    async fn test_action_and_stats() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        let first = entry(user_id, t0());
        let second = entry(user_id, t0() + Duration::hours(1));
        store.insert_scheduled(&first).await.unwrap();
        store.insert_scheduled(&second).await.unwrap();
        store
            .transition(user_id, first.id, HistoryStatus::Sent, Some(t0()))
            .await
            .unwrap();

        let service = HistoryService::new(store.clone());
        assert!(service
            .mark_notification_action(user_id, first.id, ActionTaken::Viewed)
            .await
            .unwrap());
        assert!(!service
            .mark_notification_action(user_id, Uuid::new_v4(), ActionTaken::Viewed)
            .await
            .unwrap());

        let stats = service.get_stats(user_id).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.acted_on, 1);
        assert_eq!(stats.by_status[&HistoryStatus::Sent], 1);
        assert_eq!(stats.by_status[&HistoryStatus::Scheduled], 1);
        assert_eq!(stats.last_sent_at, Some(t0()));

        // Marking an action does not move the status
        let stored = store.get(user_id, first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Sent);
    }
}
