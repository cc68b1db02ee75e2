use anyhow::Result;
use chrono::{DateTime, Duration, FixedOffset, Months, Offset, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::GeneratorConfig;
use crate::context::{ContextAnalyzer, NotificationContext, Season};
use crate::metrics;
use crate::models::{
    Comparator, NotificationHistory, NotificationRule, NotificationSettings, Priority, RuleType,
    ScheduledNotification, Trigger, TriggerKind, TriggerUnit, Vehicle,
};
use crate::store::{HistoryStore, PreferenceStore};
use crate::template;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipTemplate {
    pub title: String,
    pub message: String,
}

impl TipTemplate {
    fn new(title: &str, message: &str) -> Self {
        Self {
            title: title.to_string(),
            message: message.to_string(),
        }
    }
}

pub fn default_seasonal_tips() -> HashMap<Season, TipTemplate> {
    HashMap::from([
        (
            Season::Spring,
            TipTemplate::new(
                "Spring check for {vehicleName}",
                "Winter is over: swap to summer tyres and wash salt off the underbody of {vehicleName}.",
            ),
        ),
        (
            Season::Summer,
            TipTemplate::new(
                "Beat the heat",
                "Check coolant level and air-conditioning on {vehicleName} before long summer trips.",
            ),
        ),
        (
            Season::Autumn,
            TipTemplate::new(
                "Get ready for autumn",
                "Test the lights and wiper blades of {vehicleName} as the days get shorter.",
            ),
        ),
        (
            Season::Winter,
            TipTemplate::new(
                "Winter is coming",
                "Check the battery, antifreeze and winter tyres of {vehicleName}.",
            ),
        ),
    ])
}

/// Deterministic id for a rule instance, used to deduplicate live reminders.
pub fn rule_id(rule_type: RuleType, vehicle_id: Uuid, season: Option<Season>) -> String {
    match season {
        Some(season) => format!("{}:{}:{}", rule_type, vehicle_id, season.as_str()),
        None => format!("{}:{}", rule_type, vehicle_id),
    }
}

/// Next round service threshold at or above `mileage`.
///
/// `None` for a non-positive interval or a threshold past `i64::MAX`.
pub fn next_service_threshold(mileage: i64, interval_km: i64) -> Option<i64> {
    if interval_km <= 0 {
        return None;
    }
    let mileage = mileage.max(0);
    let intervals = mileage / interval_km + i64::from(mileage % interval_km != 0);
    intervals.checked_mul(interval_km)
}

/// Turns vehicle contexts and user settings into reminder candidates.
pub struct NotificationGenerator<P, H> {
    preferences: Arc<P>,
    history: Arc<H>,
    analyzer: ContextAnalyzer,
    config: GeneratorConfig,
    seasonal_tips: HashMap<Season, TipTemplate>,
    local_offset: FixedOffset,
}

impl<P, H> NotificationGenerator<P, H>
where
    P: PreferenceStore + Sync,
    H: HistoryStore + Sync,
{
    pub fn new(preferences: Arc<P>, history: Arc<H>, config: GeneratorConfig) -> Self {
        Self {
            preferences,
            history,
            analyzer: ContextAnalyzer::new(config.clone()),
            config,
            seasonal_tips: default_seasonal_tips(),
            local_offset: Utc.fix(),
        }
    }

    /// Offset that decides the local calendar date, and so the season.
    pub fn with_local_offset(mut self, offset: FixedOffset) -> Self {
        self.local_offset = offset;
        self
    }

    pub fn with_seasonal_tips(mut self, tips: HashMap<Season, TipTemplate>) -> Self {
        self.seasonal_tips = tips;
        self
    }

    /// Emits the candidates that are not already live for this user.
    ///
    /// Each emitted candidate is recorded as `scheduled` in history before it is
    /// returned, so a second call with unchanged state emits nothing new.
    pub async fn generate(&self, user_id: Uuid, vehicles: &[Vehicle]) -> Vec<ScheduledNotification> {
        match self.generate_at(user_id, vehicles, Utc::now()).await {
            Ok(notifications) => notifications,
            Err(e) => {
                error!(user_id = %user_id, "Failed to generate notifications: {:#}", e);
                Vec::new()
            }
        }
    }

    pub async fn generate_at(
        &self,
        user_id: Uuid,
        vehicles: &[Vehicle],
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledNotification>> {
        let settings = self.preferences.get_or_create_settings(user_id).await?;
        if !settings.general.push_enabled {
            debug!(user_id = %user_id, "Push disabled, skipping generation");
            return Ok(Vec::new());
        }

        let contexts = self.analyzer.analyze_on(
            user_id,
            vehicles,
            now.with_timezone(&self.local_offset).date_naive(),
        );
        let mut emitted = Vec::new();

        for ctx in &contexts {
            for candidate in self.candidates(&settings, ctx, now) {
                let title = template::render(&candidate.rule.title, &candidate.data);
                let message = template::render(&candidate.rule.message, &candidate.data);
                let entry = NotificationHistory::scheduled_from(&candidate, title, message);

                if self.history.insert_scheduled(&entry).await? {
                    emitted.push(candidate);
                } else {
                    debug!(
                        user_id = %user_id,
                        rule_id = %candidate.rule.id,
                        "Live reminder already exists for rule"
                    );
                }
            }
        }

        if !emitted.is_empty() {
            metrics::NOTIFICATIONS_GENERATED.inc_by(emitted.len() as f64);
            info!(
                user_id = %user_id,
                vehicles = vehicles.len(),
                emitted = emitted.len(),
                "Generated reminder notifications"
            );
        }

        Ok(emitted)
    }

    /// Pure rule evaluation for one vehicle context.
    pub fn candidates(
        &self,
        settings: &NotificationSettings,
        ctx: &NotificationContext,
        now: DateTime<Utc>,
    ) -> Vec<ScheduledNotification> {
        let mut out = Vec::new();

        if settings.maintenance.enabled && settings.maintenance.by_mileage {
            out.extend(self.mileage_candidate(ctx, now));
        }
        if settings.maintenance.enabled && settings.maintenance.by_time {
            out.push(self.time_candidate(ctx, now));
        }
        if settings.tips.enabled && settings.tips.seasonal {
            out.extend(self.seasonal_candidate(ctx, now));
        }

        out
    }

    fn mileage_candidate(
        &self,
        ctx: &NotificationContext,
        now: DateTime<Utc>,
    ) -> Option<ScheduledNotification> {
        let next = next_service_threshold(ctx.current_mileage, self.config.service_interval_km)?;
        let remaining = next - ctx.current_mileage;
        if remaining <= 0 || remaining > self.config.mileage_alert_window_km {
            return None;
        }

        let mut data = base_data(ctx);
        data.insert("currentMileage".to_string(), ctx.current_mileage.to_string());
        data.insert("nextMileage".to_string(), next.to_string());
        data.insert("remainingKm".to_string(), remaining.to_string());

        Some(candidate(
            ctx,
            NotificationRule {
                id: rule_id(RuleType::MileageMaintenance, ctx.vehicle_id, None),
                rule_type: RuleType::MileageMaintenance,
                category: RuleType::MileageMaintenance.category(),
                trigger: Trigger {
                    kind: TriggerKind::Mileage,
                    value: next,
                    unit: TriggerUnit::Km,
                    comparator: Comparator::Gte,
                },
                title: "Service due soon: {vehicleName}".to_string(),
                message: "{vehicleName} is {remainingKm} km away from its {nextMileage} km service."
                    .to_string(),
                priority: Priority::High,
                enabled: true,
            },
            now + Duration::days(self.config.mileage_lead_days),
            data,
            now,
        ))
    }

    fn time_candidate(&self, ctx: &NotificationContext, now: DateTime<Utc>) -> ScheduledNotification {
        let months = self.config.time_reminder_months;
        let scheduled_for = now
            .checked_add_months(Months::new(months))
            .unwrap_or_else(|| now + Duration::days(30 * months as i64));

        let mut data = base_data(ctx);
        data.insert("months".to_string(), months.to_string());

        candidate(
            ctx,
            NotificationRule {
                id: rule_id(RuleType::TimeMaintenance, ctx.vehicle_id, None),
                rule_type: RuleType::TimeMaintenance,
                category: RuleType::TimeMaintenance.category(),
                trigger: Trigger {
                    kind: TriggerKind::Time,
                    value: months as i64,
                    unit: TriggerUnit::Months,
                    comparator: Comparator::Gte,
                },
                title: "Routine maintenance for {vehicleName}".to_string(),
                message: "It has been {months} months. Time to book a routine check for {vehicleName}."
                    .to_string(),
                priority: Priority::Medium,
                enabled: true,
            },
            scheduled_for,
            data,
            now,
        )
    }

    fn seasonal_candidate(
        &self,
        ctx: &NotificationContext,
        now: DateTime<Utc>,
    ) -> Option<ScheduledNotification> {
        let tip = self.seasonal_tips.get(&ctx.season)?;

        let mut data = base_data(ctx);
        data.insert("season".to_string(), ctx.season.as_str().to_string());

        Some(candidate(
            ctx,
            NotificationRule {
                id: rule_id(RuleType::SeasonalTip, ctx.vehicle_id, Some(ctx.season)),
                rule_type: RuleType::SeasonalTip,
                category: RuleType::SeasonalTip.category(),
                trigger: Trigger {
                    kind: TriggerKind::Date,
                    value: self.config.seasonal_lead_days,
                    unit: TriggerUnit::Days,
                    comparator: Comparator::Gte,
                },
                title: tip.title.clone(),
                message: tip.message.clone(),
                priority: Priority::Low,
                enabled: true,
            },
            now + Duration::days(self.config.seasonal_lead_days),
            data,
            now,
        ))
    }
}

fn base_data(ctx: &NotificationContext) -> HashMap<String, String> {
    HashMap::from([
        ("vehicleId".to_string(), ctx.vehicle_id.to_string()),
        ("vehicleName".to_string(), ctx.vehicle_name.clone()),
    ])
}

fn candidate(
    ctx: &NotificationContext,
    rule: NotificationRule,
    scheduled_for: DateTime<Utc>,
    data: HashMap<String, String>,
    now: DateTime<Utc>,
) -> ScheduledNotification {
    ScheduledNotification {
        id: Uuid::new_v4(),
        user_id: ctx.user_id,
        vehicle_id: Some(ctx.vehicle_id),
        rule,
        scheduled_for,
        data,
        created: now,
    }
}
