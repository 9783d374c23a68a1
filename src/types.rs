//! Core data types for the mood pipeline
//!
//! These types represent the records flowing through the pipeline:
//! raw events → daily feature vectors → trained models → predictions.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Number of named features in a daily feature vector
pub const FEATURE_COUNT: usize = 12;

/// Raw event types produced by the collectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AppUsage,
    Notification,
    Location,
    Activity,
    MoodLog,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AppUsage => "app_usage",
            EventType::Notification => "notification",
            EventType::Location => "location",
            EventType::Activity => "activity",
            EventType::MoodLog => "mood_log",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "app_usage" => Some(EventType::AppUsage),
            "notification" => Some(EventType::Notification),
            "location" => Some(EventType::Location),
            "activity" => Some(EventType::Activity),
            "mood_log" => Some(EventType::MoodLog),
            _ => None,
        }
    }
}

/// A single append-only event from the `system_events` log.
///
/// Only the fields relevant to `event_type` are populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    /// Foreground application (app_usage)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Duration in seconds (app_usage, location, activity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    /// Place category such as "work", "home" or "commute" (location)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_category: Option<String>,
    /// Activity kind: "sleep", "idle", "active", "steps" or "hrv" (activity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_after: Option<String>,
    /// "work" or "personal" (notification)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_sender_type: Option<String>,
    /// Sentiment score of the notification text (notification)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_sentiment: Option<f64>,
    /// Self-reported mood, 1-5 (mood_log)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood_rating: Option<i32>,
    /// Step count or HRV reading in ms (activity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
}

impl RawEvent {
    /// Create an event with no type-specific fields set
    pub fn new(user_id: impl Into<String>, timestamp: DateTime<Utc>, event_type: EventType) -> Self {
        Self {
            user_id: user_id.into(),
            timestamp,
            event_type,
            app_name: None,
            duration_sec: None,
            location_category: None,
            action_after: None,
            notification_sender_type: None,
            message_sentiment: None,
            mood_rating: None,
            metric_value: None,
        }
    }
}

/// The twelve model features, in the fixed order used for design matrices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureName {
    SessionAvgSec,
    IdleRatio,
    AppSwitchCount,
    WorkNotifCount,
    PersonalNotifCount,
    AvgNotifSentiment,
    HoursSlept,
    Steps,
    Hrv,
    TimeAtWorkRatio,
    LocationSwitches,
    CommuteMin,
}

impl FeatureName {
    pub const ALL: [FeatureName; FEATURE_COUNT] = [
        FeatureName::SessionAvgSec,
        FeatureName::IdleRatio,
        FeatureName::AppSwitchCount,
        FeatureName::WorkNotifCount,
        FeatureName::PersonalNotifCount,
        FeatureName::AvgNotifSentiment,
        FeatureName::HoursSlept,
        FeatureName::Steps,
        FeatureName::Hrv,
        FeatureName::TimeAtWorkRatio,
        FeatureName::LocationSwitches,
        FeatureName::CommuteMin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureName::SessionAvgSec => "session_avg_sec",
            FeatureName::IdleRatio => "idle_ratio",
            FeatureName::AppSwitchCount => "app_switch_count",
            FeatureName::WorkNotifCount => "work_notif_count",
            FeatureName::PersonalNotifCount => "personal_notif_count",
            FeatureName::AvgNotifSentiment => "avg_notif_sentiment",
            FeatureName::HoursSlept => "hours_slept",
            FeatureName::Steps => "steps",
            FeatureName::Hrv => "hrv",
            FeatureName::TimeAtWorkRatio => "time_at_work_ratio",
            FeatureName::LocationSwitches => "location_switches",
            FeatureName::CommuteMin => "commute_min",
        }
    }

    /// Feature names as stored on a model record
    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|f| f.as_str().to_string()).collect()
    }
}

/// One user's behavioral summary for one UTC calendar day.
///
/// Unique per `(user_id, day)`; recomputation overwrites the stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyFeature {
    pub user_id: String,
    pub day: NaiveDate,
    pub session_avg_sec: Option<f64>,
    pub idle_ratio: Option<f64>,
    pub app_switch_count: Option<f64>,
    pub work_notif_count: Option<f64>,
    pub personal_notif_count: Option<f64>,
    pub avg_notif_sentiment: Option<f64>,
    pub hours_slept: Option<f64>,
    pub steps: Option<f64>,
    pub hrv: Option<f64>,
    pub time_at_work_ratio: Option<f64>,
    pub location_switches: Option<f64>,
    pub commute_min: Option<f64>,
    /// Rounded mean mood rating (1-5)
    pub mood_label: Option<i32>,
}

impl DailyFeature {
    /// An all-null row for `(user_id, day)`
    pub fn empty(user_id: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            day,
            session_avg_sec: None,
            idle_ratio: None,
            app_switch_count: None,
            work_notif_count: None,
            personal_notif_count: None,
            avg_notif_sentiment: None,
            hours_slept: None,
            steps: None,
            hrv: None,
            time_at_work_ratio: None,
            location_switches: None,
            commute_min: None,
            mood_label: None,
        }
    }

    pub fn get(&self, feature: FeatureName) -> Option<f64> {
        match feature {
            FeatureName::SessionAvgSec => self.session_avg_sec,
            FeatureName::IdleRatio => self.idle_ratio,
            FeatureName::AppSwitchCount => self.app_switch_count,
            FeatureName::WorkNotifCount => self.work_notif_count,
            FeatureName::PersonalNotifCount => self.personal_notif_count,
            FeatureName::AvgNotifSentiment => self.avg_notif_sentiment,
            FeatureName::HoursSlept => self.hours_slept,
            FeatureName::Steps => self.steps,
            FeatureName::Hrv => self.hrv,
            FeatureName::TimeAtWorkRatio => self.time_at_work_ratio,
            FeatureName::LocationSwitches => self.location_switches,
            FeatureName::CommuteMin => self.commute_min,
        }
    }

    pub fn set(&mut self, feature: FeatureName, value: Option<f64>) {
        let slot = match feature {
            FeatureName::SessionAvgSec => &mut self.session_avg_sec,
            FeatureName::IdleRatio => &mut self.idle_ratio,
            FeatureName::AppSwitchCount => &mut self.app_switch_count,
            FeatureName::WorkNotifCount => &mut self.work_notif_count,
            FeatureName::PersonalNotifCount => &mut self.personal_notif_count,
            FeatureName::AvgNotifSentiment => &mut self.avg_notif_sentiment,
            FeatureName::HoursSlept => &mut self.hours_slept,
            FeatureName::Steps => &mut self.steps,
            FeatureName::Hrv => &mut self.hrv,
            FeatureName::TimeAtWorkRatio => &mut self.time_at_work_ratio,
            FeatureName::LocationSwitches => &mut self.location_switches,
            FeatureName::CommuteMin => &mut self.commute_min,
        };
        *slot = value;
    }

    /// Feature values in model order
    pub fn values(&self) -> [Option<f64>; FEATURE_COUNT] {
        FeatureName::ALL.map(|f| self.get(f))
    }

    /// Number of non-null features
    pub fn present_count(&self) -> usize {
        self.values().iter().filter(|v| v.is_some()).count()
    }
}

/// A fitted ridge model. Created once per training run and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// Immutable registry key
    pub model_version: String,
    /// Feature names, aligned with `coefficients`
    pub features: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub lambda: f64,
    /// In-sample mean absolute error
    pub train_mae: f64,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// Raw linear response `intercept + Σ coef_i · x_i`
    pub fn predict(&self, x: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(x)
                .map(|(c, v)| c * v)
                .sum::<f64>()
    }
}

/// Normalized |coefficient| share of one model feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub model_version: String,
    pub feature: String,
    pub importance: f64,
}

/// A scored user-day, unique per `(model_version, user_id, day)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_version: String,
    pub user_id: String,
    pub day: NaiveDate,
    pub y_true: Option<i32>,
    pub y_pred: f64,
    /// Reserved for a future classifier head; always null
    pub proba_at_risk: Option<f64>,
}

/// Everything one training run writes, committed as a single unit
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRun {
    pub model: Model,
    pub importances: Vec<FeatureImportance>,
    pub predictions: Vec<Prediction>,
}

impl TrainingRun {
    /// Move the model and every child row to `version`
    pub fn reassign_version(&mut self, version: &str) {
        self.model.model_version = version.to_string();
        for importance in &mut self.importances {
            importance.model_version = version.to_string();
        }
        for prediction in &mut self.predictions {
            prediction.model_version = version.to_string();
        }
    }
}

/// Summary printed by the `train` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainReport {
    pub model_version: String,
    pub train_rows: usize,
    pub train_mae: f64,
}

/// Summary of a scoring pass over the trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub model_version: String,
    pub window_start: NaiveDate,
    pub scored_rows: usize,
}

/// Summary of one day's aggregation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    pub day: NaiveDate,
    pub users: usize,
    #[serde(skip)]
    pub features: Vec<DailyFeature>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_order_is_stable() {
        let names = FeatureName::names();
        assert_eq!(names.len(), FEATURE_COUNT);
        assert_eq!(names[0], "session_avg_sec");
        assert_eq!(names[11], "commute_min");
    }

    #[test]
    fn test_get_set_roundtrip_per_feature() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut row = DailyFeature::empty("u1", day);
        for (i, f) in FeatureName::ALL.iter().enumerate() {
            row.set(*f, Some(i as f64));
        }
        assert_eq!(row.present_count(), FEATURE_COUNT);
        assert_eq!(row.get(FeatureName::Hrv), Some(8.0));
        assert_eq!(row.values()[11], Some(11.0));
    }

    #[test]
    fn test_event_type_strings() {
        for t in [
            EventType::AppUsage,
            EventType::Notification,
            EventType::Location,
            EventType::Activity,
            EventType::MoodLog,
        ] {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EventType::parse("keystroke"), None);
    }

    #[test]
    fn test_model_predict() {
        let model = Model {
            model_version: "v".to_string(),
            features: vec!["a".to_string(), "b".to_string()],
            coefficients: vec![2.0, -1.0],
            intercept: 0.5,
            lambda: 0.0,
            train_mae: 0.0,
            created_at: Utc::now(),
        };
        assert!((model.predict(&[3.0, 1.0]) - 5.5).abs() < 1e-12);
    }
}
