use chrono::{DateTime, TimeZone, Timelike};

use crate::models::{NotificationSettings, NotificationType, QuietHours};

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Parses `HH:MM` into minutes since midnight.
pub fn parse_minutes(value: &str) -> Option<u32> {
    let (hours, minutes) = value.trim().split_once(':')?;
    let hours: u32 = hours.trim().parse().ok()?;
    let minutes: u32 = minutes.trim().parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

/// Whether `minute_of_day` falls inside the quiet window, bounds inclusive.
///
/// A window whose start is after its end wraps past midnight. Missing or
/// unparseable bounds mean there is no window.
pub fn in_quiet_hours(quiet_hours: &QuietHours, minute_of_day: u32) -> bool {
    let bounds = quiet_hours
        .start
        .as_deref()
        .and_then(parse_minutes)
        .zip(quiet_hours.end.as_deref().and_then(parse_minutes));

    match bounds {
        Some((start, end)) if start <= end => (start..=end).contains(&minute_of_day),
        Some((start, end)) => {
            (start..MINUTES_PER_DAY).contains(&minute_of_day) || minute_of_day <= end
        }
        None => false,
    }
}

/// The user toggle that governs a notification type.
pub fn category_enabled(settings: &NotificationSettings, notification_type: NotificationType) -> bool {
    let toggles = &settings.push_categories;
    match notification_type {
        NotificationType::MaintenanceReminder => toggles.maintenance_reminders,
        NotificationType::InspectionReminder => toggles.inspection_reminders,
        NotificationType::PaymentReminder => toggles.payment_reminders,
        NotificationType::Promotional => toggles.promotions,
        NotificationType::SystemUpdate => toggles.system_updates,
        NotificationType::Emergency => toggles.emergency_alerts,
    }
}

/// How an individual send is evaluated against preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateOptions {
    /// Skip the quiet-hours check.
    pub bypass_quiet_hours: bool,
    /// Skip the per-type toggle check.
    pub bypass_category: bool,
}

impl GateOptions {
    pub fn emergency(bypass_category: bool) -> Self {
        Self {
            bypass_quiet_hours: true,
            bypass_category,
        }
    }
}

/// Decides whether a notification may fire at `at` (evaluated in `at`'s zone).
///
/// Fails open: absent settings and untyped notifications are allowed.
pub fn should_fire<Tz: TimeZone>(
    settings: Option<&NotificationSettings>,
    notification_type: Option<NotificationType>,
    at: &DateTime<Tz>,
) -> bool {
    should_fire_with(settings, notification_type, at, GateOptions::default())
}

pub fn should_fire_with<Tz: TimeZone>(
    settings: Option<&NotificationSettings>,
    notification_type: Option<NotificationType>,
    at: &DateTime<Tz>,
    options: GateOptions,
) -> bool {
    let Some(settings) = settings else {
        return true;
    };

    if !settings.general.push_enabled {
        return false;
    }

    if !options.bypass_quiet_hours {
        let minute_of_day = at.hour() * 60 + at.minute();
        if in_quiet_hours(&settings.quiet_hours, minute_of_day) {
            return false;
        }
    }

    match notification_type {
        Some(notification_type) if !options.bypass_category => {
            category_enabled(settings, notification_type)
        }
        _ => true,
    }
}
