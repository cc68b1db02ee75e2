use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Generates `as_str`, `Display` and `FromStr` for enums stored as text columns.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaxFrequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceSettings {
    pub enabled: bool,
    pub by_mileage: bool,
    pub by_time: bool,
    pub recommendations: bool,
    pub advance_notice_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionSettings {
    pub enabled: bool,
    pub selling: bool,
    pub buying: bool,
    pub annual: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipsSettings {
    pub enabled: bool,
    pub seasonal: bool,
    pub personalized: bool,
    pub performance: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralSettings {
    /// Local time of day reminders are delivered at, `HH:MM`.
    pub preferred_time: String,
    pub max_frequency: MaxFrequency,
    pub sound: bool,
    pub vibration: bool,
    pub push_enabled: bool,
}

/// Quiet-hours window as `HH:MM` strings. Missing or malformed bounds disable it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Per-type toggles consulted by the preference gate at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushCategories {
    pub maintenance_reminders: bool,
    pub inspection_reminders: bool,
    pub payment_reminders: bool,
    pub promotions: bool,
    pub system_updates: bool,
    pub emergency_alerts: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSettings {
    pub user_id: Uuid,
    pub maintenance: MaintenanceSettings,
    pub inspection: InspectionSettings,
    pub tips: TipsSettings,
    pub general: GeneralSettings,
    #[serde(default)]
    pub quiet_hours: QuietHours,
    pub push_categories: PushCategories,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationSettings {
    /// Settings synthesized for a user who never saved any.
    pub fn default_for_user(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            maintenance: MaintenanceSettings {
                enabled: true,
                by_mileage: true,
                by_time: true,
                recommendations: true,
                advance_notice_days: 7,
            },
            inspection: InspectionSettings {
                enabled: true,
                selling: true,
                buying: true,
                annual: true,
            },
            tips: TipsSettings {
                enabled: true,
                seasonal: true,
                personalized: true,
                performance: false,
            },
            general: GeneralSettings {
                preferred_time: "09:00".to_string(),
                max_frequency: MaxFrequency::Weekly,
                sound: true,
                vibration: true,
                push_enabled: true,
            },
            quiet_hours: QuietHours::default(),
            push_categories: PushCategories {
                maintenance_reminders: true,
                inspection_reminders: true,
                payment_reminders: true,
                promotions: false,
                system_updates: true,
                emergency_alerts: true,
            },
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Rules and scheduled notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleType {
    MileageMaintenance,
    TimeMaintenance,
    MaintenanceRecommendation,
    InspectionSelling,
    InspectionBuying,
    InspectionAnnual,
    SeasonalTip,
    PersonalizedTip,
    PerformanceTip,
    DocumentExpiry,
}

text_enum!(RuleType, "rule type", {
    MileageMaintenance => "mileage-maintenance",
    TimeMaintenance => "time-maintenance",
    MaintenanceRecommendation => "maintenance-recommendation",
    InspectionSelling => "inspection-selling",
    InspectionBuying => "inspection-buying",
    InspectionAnnual => "inspection-annual",
    SeasonalTip => "seasonal-tip",
    PersonalizedTip => "personalized-tip",
    PerformanceTip => "performance-tip",
    DocumentExpiry => "document-expiry",
});

impl RuleType {
    pub fn category(&self) -> RuleCategory {
        match self {
            RuleType::MileageMaintenance
            | RuleType::TimeMaintenance
            | RuleType::MaintenanceRecommendation => RuleCategory::Maintenance,
            RuleType::InspectionSelling
            | RuleType::InspectionBuying
            | RuleType::InspectionAnnual => RuleCategory::Inspection,
            RuleType::SeasonalTip | RuleType::PersonalizedTip | RuleType::PerformanceTip => {
                RuleCategory::Tips
            }
            RuleType::DocumentExpiry => RuleCategory::Documents,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Maintenance,
    Inspection,
    Tips,
    Documents,
}

text_enum!(RuleCategory, "rule category", {
    Maintenance => "maintenance",
    Inspection => "inspection",
    Tips => "tips",
    Documents => "documents",
});

impl RuleCategory {
    /// Push type used when a reminder of this category is delivered from the server.
    pub fn push_type(&self) -> NotificationType {
        match self {
            RuleCategory::Maintenance => NotificationType::MaintenanceReminder,
            RuleCategory::Inspection => NotificationType::InspectionReminder,
            RuleCategory::Tips => NotificationType::Promotional,
            RuleCategory::Documents => NotificationType::PaymentReminder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

text_enum!(Priority, "priority", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Mileage,
    Time,
    Date,
    Event,
    Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerUnit {
    Km,
    Days,
    Months,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Gte,
    Lte,
    Eq,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    pub value: i64,
    pub unit: TriggerUnit,
    pub comparator: Comparator,
}

/// Template a reminder is instantiated from. `id` is the deterministic rule id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRule {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub category: RuleCategory,
    pub trigger: Trigger,
    pub title: String,
    pub message: String,
    pub priority: Priority,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub vehicle_id: Option<Uuid>,
    pub rule: NotificationRule,
    pub scheduled_for: DateTime<Utc>,
    pub data: HashMap<String, String>,
    pub created: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Scheduled,
    Sent,
    Delivered,
    Failed,
    Cancelled,
}

text_enum!(HistoryStatus, "history status", {
    Scheduled => "scheduled",
    Sent => "sent",
    Delivered => "delivered",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl HistoryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HistoryStatus::Scheduled)
    }

    /// `scheduled` is the only state with successors; every successor is terminal.
    pub fn can_transition_to(&self, next: HistoryStatus) -> bool {
        *self == HistoryStatus::Scheduled && next != HistoryStatus::Scheduled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    Viewed,
    Dismissed,
    Acted,
    ScheduledMaintenance,
}

text_enum!(ActionTaken, "action", {
    Viewed => "viewed",
    Dismissed => "dismissed",
    Acted => "acted",
    ScheduledMaintenance => "scheduled_maintenance",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationHistory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub vehicle_id: Option<Uuid>,
    /// Deterministic rule id for generated reminders, `None` for ad-hoc pushes.
    pub rule_id: Option<String>,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub category: String,
    pub title: String,
    pub message: String,
    pub scheduled_for: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub status: HistoryStatus,
    pub priority: Priority,
    pub action_taken: Option<ActionTaken>,
    pub related_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl NotificationHistory {
    /// A `scheduled` entry mirroring a generated notification, with its text already rendered.
    pub fn scheduled_from(notification: &ScheduledNotification, title: String, message: String) -> Self {
        Self {
            id: notification.id,
            user_id: notification.user_id,
            vehicle_id: notification.vehicle_id,
            rule_id: Some(notification.rule.id.clone()),
            notification_type: notification.rule.rule_type.as_str().to_string(),
            category: notification.rule.category.as_str().to_string(),
            title,
            message,
            scheduled_for: notification.scheduled_for,
            sent_at: None,
            status: HistoryStatus::Scheduled,
            priority: notification.rule.priority,
            action_taken: None,
            related_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total: usize,
    pub by_status: HashMap<HistoryStatus, usize>,
    pub by_category: HashMap<String, usize>,
    pub acted_on: usize,
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl HistoryStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a NotificationHistory>) -> Self {
        let mut stats = HistoryStats::default();
        for entry in entries {
            stats.total += 1;
            *stats.by_status.entry(entry.status).or_default() += 1;
            *stats.by_category.entry(entry.category.clone()).or_default() += 1;
            if entry.action_taken.is_some() {
                stats.acted_on += 1;
            }
            if let Some(sent_at) = entry.sent_at {
                stats.last_sent_at = Some(stats.last_sent_at.map_or(sent_at, |last| last.max(sent_at)));
            }
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Endpoints, vehicles, push payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub is_active: bool,
    pub last_used: DateTime<Utc>,
}

/// Minimal vehicle view consumed from the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: Option<String>,
    pub model_year: Option<i32>,
    pub current_mileage: Option<i64>,
    pub months_since_service: Option<i32>,
}

/// Push notification types understood by the preference gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    MaintenanceReminder,
    InspectionReminder,
    PaymentReminder,
    Promotional,
    SystemUpdate,
    Emergency,
}

text_enum!(NotificationType, "notification type", {
    MaintenanceReminder => "maintenance_reminder",
    InspectionReminder => "inspection_reminder",
    PaymentReminder => "payment_reminder",
    Promotional => "promotional",
    SystemUpdate => "system_update",
    Emergency => "emergency",
});

/// Content of a server push, independent of the endpoints it fans out to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub badge: Option<u32>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub channel_id: Option<String>,
    /// History entry this send fulfils; a fresh entry is recorded when absent.
    #[serde(default)]
    pub history_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTarget {
    pub user_id: Uuid,
    /// Untyped sends skip the category toggle check.
    pub notification_type: Option<NotificationType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_status_transitions_are_monotonic() {
        use HistoryStatus::*;
        for next in [Sent, Delivered, Failed, Cancelled] {
            assert!(Scheduled.can_transition_to(next));
        }
        assert!(!Scheduled.can_transition_to(Scheduled));

        for terminal in [Sent, Delivered, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Scheduled, Sent, Delivered, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_rule_type_categories() {
        assert_eq!(RuleType::MileageMaintenance.category(), RuleCategory::Maintenance);
        assert_eq!(RuleType::InspectionAnnual.category(), RuleCategory::Inspection);
        assert_eq!(RuleType::SeasonalTip.category(), RuleCategory::Tips);
        assert_eq!(RuleType::DocumentExpiry.category(), RuleCategory::Documents);
    }

    #[test]
    fn test_text_enums_parse_their_own_output() {
        assert_eq!("seasonal-tip".parse::<RuleType>().unwrap(), RuleType::SeasonalTip);
        assert_eq!(
            "scheduled_maintenance".parse::<ActionTaken>().unwrap(),
            ActionTaken::ScheduledMaintenance
        );
        assert_eq!(HistoryStatus::Cancelled.to_string(), "cancelled");

        let err = "sometimes".parse::<HistoryStatus>().unwrap_err();
        assert_eq!(err.value, "sometimes");
    }

    #[test]
    fn test_settings_json_uses_camel_case() {
        let settings = NotificationSettings::default_for_user(Uuid::new_v4());
        let json = serde_json::to_value(&settings).unwrap();

        assert_eq!(json["general"]["preferredTime"], "09:00");
        assert_eq!(json["general"]["pushEnabled"], true);
        assert_eq!(json["pushCategories"]["emergencyAlerts"], true);

        let back: NotificationSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_stats_from_entries() {
        let user_id = Uuid::new_v4();
        let base = NotificationHistory {
            id: Uuid::new_v4(),
            user_id,
            vehicle_id: None,
            rule_id: None,
            notification_type: "time-maintenance".to_string(),
            category: "maintenance".to_string(),
            title: "t".to_string(),
            message: "m".to_string(),
            scheduled_for: Utc::now(),
            sent_at: None,
            status: HistoryStatus::Scheduled,
            priority: Priority::Medium,
            action_taken: None,
            related_id: None,
            created_at: Utc::now(),
        };
        let sent_at = Utc::now();
        let delivered = NotificationHistory {
            id: Uuid::new_v4(),
            status: HistoryStatus::Delivered,
            sent_at: Some(sent_at),
            action_taken: Some(ActionTaken::Viewed),
            category: "tips".to_string(),
            ..base.clone()
        };

        let stats = HistoryStats::from_entries([&base, &delivered]);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status[&HistoryStatus::Scheduled], 1);
        assert_eq!(stats.by_status[&HistoryStatus::Delivered], 1);
        assert_eq!(stats.by_category["tips"], 1);
        assert_eq!(stats.acted_on, 1);
        assert_eq!(stats.last_sent_at, Some(sent_at));
    }
}
