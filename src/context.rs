use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::GeneratorConfig;
use crate::models::Vehicle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenancePattern {
    Regular,
    Irregular,
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    Spring,
    Summer,
    Autumn,
    Winter,
}

impl Season {
    /// Northern-hemisphere meteorological seasons.
    pub fn from_month(month: u32) -> Self {
        match month {
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            9..=11 => Season::Autumn,
            _ => Season::Winter,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Spring => "spring",
            Season::Summer => "summer",
            Season::Autumn => "autumn",
            Season::Winter => "winter",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationContext {
    pub user_id: Uuid,
    pub vehicle_id: Uuid,
    pub vehicle_name: String,
    pub current_mileage: i64,
    pub vehicle_age_years: i32,
    pub monthly_distance_km: i64,
    pub pattern: MaintenancePattern,
    pub season: Season,
}

pub struct ContextAnalyzer {
    config: GeneratorConfig,
}

impl ContextAnalyzer {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, user_id: Uuid, vehicles: &[Vehicle]) -> Vec<NotificationContext> {
        self.analyze_on(user_id, vehicles, Utc::now().date_naive())
    }

    /// One best-effort context per vehicle; unknown inputs fall back to defaults.
    pub fn analyze_on(
        &self,
        user_id: Uuid,
        vehicles: &[Vehicle],
        today: NaiveDate,
    ) -> Vec<NotificationContext> {
        let season = Season::from_month(today.month());

        vehicles
            .iter()
            .map(|vehicle| {
                let age = vehicle
                    .model_year
                    .map(|year| (today.year() - year).max(0));

                let monthly_distance_km = match age {
                    Some(_) => self.config.annual_distance_km / 12,
                    None => self.config.default_monthly_distance_km,
                };

                NotificationContext {
                    user_id,
                    vehicle_id: vehicle.id,
                    vehicle_name: vehicle
                        .name
                        .clone()
                        .unwrap_or_else(|| "your vehicle".to_string()),
                    current_mileage: vehicle.current_mileage.unwrap_or(0).max(0),
                    vehicle_age_years: age.unwrap_or(0),
                    monthly_distance_km,
                    pattern: self.classify(age, vehicle.months_since_service),
                    season,
                }
            })
            .collect()
    }

    fn classify(&self, age: Option<i32>, months_since_service: Option<i32>) -> MaintenancePattern {
        if months_since_service.is_some_and(|m| m > self.config.delayed_after_months) {
            return MaintenancePattern::Delayed;
        }
        match age {
            Some(age) if age > self.config.irregular_age_years => MaintenancePattern::Irregular,
            _ => MaintenancePattern::Regular,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle(model_year: Option<i32>, mileage: Option<i64>) -> Vehicle {
        Vehicle {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: Some("Civic".to_string()),
            model_year,
            current_mileage: mileage,
            months_since_service: None,
        }
    }

    #[test]
    fn test_season_from_month() {
        assert_eq!(Season::from_month(1), Season::Winter);
        assert_eq!(Season::from_month(4), Season::Spring);
        assert_eq!(Season::from_month(7), Season::Summer);
        assert_eq!(Season::from_month(10), Season::Autumn);
        assert_eq!(Season::from_month(12), Season::Winter);
    }

    #[test]
    fn test_context_with_known_model_year() {
        let analyzer = ContextAnalyzer::new(GeneratorConfig::default());
        let today = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let contexts = analyzer.analyze_on(Uuid::new_v4(), &[vehicle(Some(2020), Some(9_200))], today);

        assert_eq!(contexts.len(), 1);
        let ctx = &contexts[0];
        assert_eq!(ctx.vehicle_age_years, 6);
        assert_eq!(ctx.monthly_distance_km, 1_250);
        assert_eq!(ctx.current_mileage, 9_200);
        assert_eq!(ctx.pattern, MaintenancePattern::Regular);
        assert_eq!(ctx.season, Season::Summer);
    }

    #[test]
    fn test_context_defaults_for_unknown_vehicle_data() {
        let analyzer = ContextAnalyzer::new(GeneratorConfig::default());
        let today = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        let contexts = analyzer.analyze_on(Uuid::new_v4(), &[vehicle(None, None)], today);

        let ctx = &contexts[0];
        assert_eq!(ctx.current_mileage, 0);
        assert_eq!(ctx.vehicle_age_years, 0);
        assert_eq!(ctx.monthly_distance_km, 1_000);
        assert_eq!(ctx.season, Season::Winter);
    }

    #[test]
    fn test_pattern_classification() {
        let analyzer = ContextAnalyzer::new(GeneratorConfig::default());
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        let old = vehicle(Some(2005), None);
        let mut overdue = vehicle(Some(2024), None);
        overdue.months_since_service = Some(18);

        let contexts = analyzer.analyze_on(Uuid::new_v4(), &[old, overdue], today);
        assert_eq!(contexts[0].pattern, MaintenancePattern::Irregular);
        assert_eq!(contexts[1].pattern, MaintenancePattern::Delayed);
    }
}
