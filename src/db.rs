use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, types::Json, Pool, Postgres, Row};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{
    ActionTaken, HistoryStatus, HistoryStats, NotificationHistory, NotificationSettings, PushToken,
    Vehicle,
};
use crate::store::{EndpointRegistry, HistoryStore, PreferenceStore, VehicleSource};

pub async fn init_db_pool(database_url: &str, max_connections: u32) -> Result<Pool<Postgres>> {
    info!("Initializing database connection pool");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Postgres-backed implementation of every store.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
    settings_cache: Cache<Uuid, NotificationSettings>,
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        let settings_cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(600))
            .build();

        Self {
            pool,
            settings_cache,
        }
    }
}

impl PreferenceStore for PgStore {
    async fn get_or_create_settings(&self, user_id: Uuid) -> Result<NotificationSettings> {
        if let Some(settings) = self.settings_cache.get(&user_id) {
            return Ok(settings);
        }

        let defaults = Json(NotificationSettings::default_for_user(user_id));

        // Insert-if-absent then read back, so concurrent first reads agree on one row
        sqlx::query(
            r#"
            INSERT INTO notification_settings (user_id, settings)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(&defaults)
        .execute(&self.pool)
        .await
        .context("Failed to synthesize default settings")?;

        let row = sqlx::query("SELECT settings FROM notification_settings WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to fetch notification settings")?;

        let Json(settings): Json<NotificationSettings> = row.try_get("settings")?;
        self.settings_cache.insert(user_id, settings.clone()).await;

        Ok(settings)
    }

    async fn save_settings(&self, settings: &NotificationSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_settings (user_id, settings, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE
            SET settings = $2, updated_at = NOW()
            "#,
        )
        .bind(settings.user_id)
        .bind(Json(settings))
        .execute(&self.pool)
        .await
        .context("Failed to save notification settings")?;

        self.settings_cache.invalidate(&settings.user_id).await;
        Ok(())
    }
}

fn token_from_row(row: &PgRow) -> Result<PushToken> {
    Ok(PushToken {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        is_active: row.try_get("is_active")?,
        last_used: row.try_get("last_used")?,
    })
}

impl EndpointRegistry for PgStore {
    async fn register_token(&self, user_id: Uuid, token: &str) -> Result<PushToken> {
        let row = sqlx::query(
            r#"
            INSERT INTO push_tokens (id, user_id, token)
            VALUES ($1, $2, $3)
            ON CONFLICT (token) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING id, user_id, token, is_active, last_used
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(token)
        .fetch_one(&self.pool)
        .await
        .context("Failed to register push token")?;

        token_from_row(&row)
    }

    async fn active_tokens(&self, user_id: Uuid) -> Result<Vec<PushToken>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, token, is_active, last_used
            FROM push_tokens
            WHERE user_id = $1 AND is_active
            ORDER BY last_used
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active push tokens")?;

        rows.iter().map(token_from_row).collect()
    }

    async fn deactivate_token(&self, token_id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE push_tokens SET is_active = FALSE WHERE id = $1 AND is_active")
            .bind(token_id)
            .execute(&self.pool)
            .await
            .context("Failed to deactivate push token")?;

        Ok(result.rows_affected() == 1)
    }

    async fn touch_tokens(&self, token_ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
        if token_ids.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE push_tokens SET last_used = $2 WHERE id = ANY($1)")
            .bind(token_ids)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("Failed to stamp push token usage")?;

        Ok(())
    }

    async fn deactivate_unused_since(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE push_tokens SET is_active = FALSE WHERE is_active AND last_used < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to deactivate stale push tokens")?;

        Ok(result.rows_affected())
    }

    async fn users_with_active_tokens(&self) -> Result<Vec<Uuid>> {
        let users = sqlx::query("SELECT DISTINCT user_id FROM push_tokens WHERE is_active")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.try_get("user_id"))
            .collect::<Result<Vec<Uuid>, _>>()?;

        Ok(users)
    }
}

const HISTORY_COLUMNS: &str = "id, user_id, vehicle_id, rule_id, notification_type, category, \
     title, message, scheduled_for, sent_at, status, priority, action_taken, related_id, created_at";

fn history_from_row(row: &PgRow) -> Result<NotificationHistory> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let action_taken: Option<String> = row.try_get("action_taken")?;

    Ok(NotificationHistory {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        vehicle_id: row.try_get("vehicle_id")?,
        rule_id: row.try_get("rule_id")?,
        notification_type: row.try_get("notification_type")?,
        category: row.try_get("category")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        scheduled_for: row.try_get("scheduled_for")?,
        sent_at: row.try_get("sent_at")?,
        status: status.parse()?,
        priority: priority.parse()?,
        action_taken: action_taken.map(|a| a.parse()).transpose()?,
        related_id: row.try_get("related_id")?,
        created_at: row.try_get("created_at")?,
    })
}

impl HistoryStore for PgStore {
    async fn insert_scheduled(&self, entry: &NotificationHistory) -> Result<bool> {
        // Conflicts on the id or on the live-rule unique index both mean "already there"
        let result = sqlx::query(
            r#"
            INSERT INTO notification_history (
                id, user_id, vehicle_id, rule_id, notification_type, category,
                title, message, scheduled_for, status, priority, related_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'scheduled', $10, $11, $12)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.vehicle_id)
        .bind(&entry.rule_id)
        .bind(&entry.notification_type)
        .bind(&entry.category)
        .bind(&entry.title)
        .bind(&entry.message)
        .bind(entry.scheduled_for)
        .bind(entry.priority.as_str())
        .bind(entry.related_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to record scheduled notification")?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_scheduled(&self, entry: &NotificationHistory) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE notification_history
            SET title = $2, message = $3, scheduled_for = $4
            WHERE id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(entry.id)
        .bind(&entry.title)
        .bind(&entry.message)
        .bind(entry.scheduled_for)
        .execute(&self.pool)
        .await
        .context("Failed to refresh scheduled notification")?;

        if updated.rows_affected() == 0 {
            let inserted = self.insert_scheduled(entry).await?;
            debug!(id = %entry.id, inserted, "Scheduled notification was not live, insert attempted");
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
        if !HistoryStatus::Scheduled.can_transition_to(next) {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE notification_history
            SET status = $3, sent_at = COALESCE($4, sent_at)
            WHERE id = $1 AND user_id = $2 AND status = 'scheduled'
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(next.as_str())
        .bind(sent_at)
        .execute(&self.pool)
        .await
        .context("Failed to update notification status")?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_action(&self, user_id: Uuid, id: Uuid, action: ActionTaken) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE notification_history SET action_taken = $3 WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .bind(action.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to record notification action")?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, user_id: Uuid, id: Uuid) -> Result<Option<NotificationHistory>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM notification_history WHERE id = $1 AND user_id = $2",
            HISTORY_COLUMNS
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(history_from_row).transpose()
    }

    async fn list(&self, user_id: Uuid, limit: usize) -> Result<Vec<NotificationHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notification_history WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            HISTORY_COLUMNS
        ))
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch notification history")?;

        rows.iter().map(history_from_row).collect()
    }

    async fn pending_reminders(&self) -> Result<Vec<NotificationHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notification_history \
             WHERE status = 'scheduled' AND rule_id IS NOT NULL ORDER BY scheduled_for",
            HISTORY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending reminders")?;

        rows.iter().map(history_from_row).collect()
    }

    async fn stats(&self, user_id: Uuid) -> Result<HistoryStats> {
        let mut stats = HistoryStats::default();

        let status_rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM notification_history WHERE user_id = $1 GROUP BY status",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        for row in status_rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            stats.by_status.insert(status.parse::<HistoryStatus>()?, n as usize);
            stats.total += n as usize;
        }

        let category_rows = sqlx::query(
            "SELECT category, COUNT(*) AS n FROM notification_history WHERE user_id = $1 GROUP BY category",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        for row in category_rows {
            let n: i64 = row.try_get("n")?;
            stats.by_category.insert(row.try_get("category")?, n as usize);
        }

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE action_taken IS NOT NULL) AS acted_on,
                   MAX(sent_at) AS last_sent_at
            FROM notification_history
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let acted_on: i64 = row.try_get("acted_on")?;
        stats.acted_on = acted_on as usize;
        stats.last_sent_at = row.try_get("last_sent_at")?;

        Ok(stats)
    }
}

impl VehicleSource for PgStore {
    async fn vehicles_for_user(&self, user_id: Uuid) -> Result<Vec<Vehicle>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, name, model_year, current_mileage, months_since_service
            FROM vehicles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch vehicles")?;

        rows.iter()
            .map(|row| -> Result<Vehicle> {
                Ok(Vehicle {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    name: row.try_get("name")?,
                    model_year: row.try_get("model_year")?,
                    current_mileage: row.try_get("current_mileage")?,
                    months_since_service: row.try_get("months_since_service")?,
                })
            })
            .collect()
    }

    async fn users_with_vehicles(&self) -> Result<Vec<Uuid>> {
        let users = sqlx::query("SELECT DISTINCT user_id FROM vehicles")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.try_get("user_id"))
            .collect::<Result<Vec<Uuid>, _>>()?;

        Ok(users)
    }
}
