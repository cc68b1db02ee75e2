use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Expo,
    Apns,
}

#[derive(Debug, Clone)]
pub struct ApnsConfig {
    pub key_path: String,
    pub key_id: String,
    pub team_id: String,
    pub topic: String,
    pub production: bool,
}

/// Knobs of the context analyzer and rule engine.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub annual_distance_km: i64,
    pub default_monthly_distance_km: i64,
    pub irregular_age_years: i32,
    pub delayed_after_months: i32,
    pub service_interval_km: i64,
    pub mileage_alert_window_km: i64,
    pub mileage_lead_days: i64,
    pub time_reminder_months: u32,
    pub seasonal_lead_days: i64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            annual_distance_km: 15_000,
            default_monthly_distance_km: 1_000,
            irregular_age_years: 10,
            delayed_after_months: 12,
            service_interval_km: 10_000,
            mileage_alert_window_km: 1_000,
            mileage_lead_days: 7,
            time_reminder_months: 6,
            seasonal_lead_days: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Upper bound on messages per provider request; clamped to the provider's own limit.
    pub batch_size: usize,
    /// Whether emergency sends also skip the per-type toggles, not only quiet hours.
    pub emergency_bypasses_category_toggles: bool,
    /// Users served at once by a multi-user send or broadcast.
    pub max_concurrent_users: usize,
    pub default_sound: String,
    pub default_channel: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            emergency_bypasses_category_toggles: true,
            max_concurrent_users: 16,
            default_sound: "default".to_string(),
            default_channel: "default".to_string(),
        }
    }
}

/// Display policy for locally scheduled reminders, handed to the scheduler at start-up.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub show_alert: bool,
    pub play_sound: bool,
    pub set_badge: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            show_alert: true,
            play_sound: true,
            set_badge: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub api_bind_address: String,
    pub provider: ProviderKind,
    pub expo_push_url: String,
    pub expo_access_token: Option<String>,
    pub apns: Option<ApnsConfig>,
    pub local_offset: FixedOffset,
    pub token_max_idle_days: i64,
    pub token_cleanup_interval_secs: u64,
    pub generation_interval_secs: u64,
    pub generator: GeneratorConfig,
    pub delivery: DeliveryConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let provider = match env::var("PUSH_PROVIDER")
            .unwrap_or_else(|_| "expo".to_string())
            .to_lowercase()
            .as_str()
        {
            "expo" => ProviderKind::Expo,
            "apns" => ProviderKind::Apns,
            other => bail!("Unsupported PUSH_PROVIDER: {}", other),
        };

        let apns = if provider == ProviderKind::Apns {
            Some(ApnsConfig {
                key_path: env::var("APNS_KEY_PATH").context("APNS_KEY_PATH must be set")?,
                key_id: env::var("APNS_KEY_ID").context("APNS_KEY_ID must be set")?,
                team_id: env::var("APNS_TEAM_ID").context("APNS_TEAM_ID must be set")?,
                topic: env::var("APNS_TOPIC").context("APNS_TOPIC must be set")?,
                production: env::var("APNS_PRODUCTION")
                    .map(|v| v == "true")
                    .unwrap_or(false),
            })
        } else {
            None
        };

        let offset_minutes: i32 = parse_or("LOCAL_UTC_OFFSET_MINUTES", 0)?;
        let local_offset = FixedOffset::east_opt(offset_minutes * 60)
            .context("LOCAL_UTC_OFFSET_MINUTES is out of range")?;

        let defaults = GeneratorConfig::default();
        let generator = GeneratorConfig {
            annual_distance_km: parse_or("ANNUAL_DISTANCE_KM", defaults.annual_distance_km)?,
            default_monthly_distance_km: parse_or(
                "DEFAULT_MONTHLY_DISTANCE_KM",
                defaults.default_monthly_distance_km,
            )?,
            irregular_age_years: parse_or("IRREGULAR_AGE_YEARS", defaults.irregular_age_years)?,
            service_interval_km: parse_or("SERVICE_INTERVAL_KM", defaults.service_interval_km)?,
            mileage_alert_window_km: parse_or(
                "MILEAGE_ALERT_WINDOW_KM",
                defaults.mileage_alert_window_km,
            )?,
            ..defaults
        };
        if generator.service_interval_km <= 0 {
            bail!("SERVICE_INTERVAL_KM must be positive");
        }

        let delivery_defaults = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            batch_size: parse_or("PUSH_BATCH_SIZE", delivery_defaults.batch_size)?.max(1),
            emergency_bypasses_category_toggles: parse_or(
                "EMERGENCY_BYPASSES_CATEGORY_TOGGLES",
                delivery_defaults.emergency_bypasses_category_toggles,
            )?,
            max_concurrent_users: parse_or(
                "PUSH_MAX_CONCURRENT_USERS",
                delivery_defaults.max_concurrent_users,
            )?
            .max(1),
            ..delivery_defaults
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 5)?,
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            provider,
            expo_push_url: env::var("EXPO_PUSH_URL")
                .unwrap_or_else(|_| "https://exp.host/--/api/v2/push/send".to_string()),
            expo_access_token: env::var("EXPO_ACCESS_TOKEN").ok(),
            apns,
            local_offset,
            token_max_idle_days: parse_or("TOKEN_MAX_IDLE_DAYS", 30)?,
            token_cleanup_interval_secs: parse_or("TOKEN_CLEANUP_INTERVAL_SECS", 86_400)?,
            generation_interval_secs: parse_or("GENERATION_INTERVAL_SECS", 21_600)?,
            generator,
            delivery,
            scheduler: SchedulerConfig::default(),
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(default),
    }
}
