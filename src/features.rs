//! Daily feature aggregation
//!
//! Reduces one user-day of raw events into a [`DailyFeature`] row:
//! - App usage: mean session length, app switches
//! - Notifications: work/personal counts, mean sentiment
//! - Activity: idle ratio, sleep, steps, HRV
//! - Location: time at work, place switches, commute minutes
//! - Mood log: rounded mean rating as the label

use std::cmp::Ordering;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::policy::{Count, CountPolicy};
use crate::store::{with_timeout, EventStore, FeatureStore};
use crate::types::{AggregationReport, DailyFeature, EventType, RawEvent};

const SECONDS_PER_HOUR: f64 = 3600.0;
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Pure reduction from a day's events to a feature row
pub struct FeatureDeriver;

impl FeatureDeriver {
    /// Derive the feature row for `(user_id, day)` from its events.
    ///
    /// Events are re-sorted on a total key (timestamp, then every payload
    /// field) so the result does not depend on the order the store returned
    /// them in, even when timestamps tie.
    pub fn derive(
        user_id: &str,
        day: NaiveDate,
        events: &[RawEvent],
        count_policy: CountPolicy,
    ) -> DailyFeature {
        let mut sorted: Vec<&RawEvent> = events.iter().collect();
        sorted.sort_by(|a, b| event_order(a, b));

        let of_type = |t: EventType| {
            sorted
                .iter()
                .copied()
                .filter(|e| e.event_type == t)
                .collect::<Vec<_>>()
        };
        let app_usage = of_type(EventType::AppUsage);
        let notifications = of_type(EventType::Notification);
        let locations = of_type(EventType::Location);
        let activity = of_type(EventType::Activity);
        let mood_logs = of_type(EventType::MoodLog);

        DailyFeature {
            user_id: user_id.to_string(),
            day,
            session_avg_sec: compute_session_avg(&app_usage),
            idle_ratio: compute_idle_ratio(&activity),
            app_switch_count: count_policy.resolve(count_app_switches(&app_usage)),
            work_notif_count: count_policy.resolve(count_sender(&notifications, "work")),
            personal_notif_count: count_policy
                .resolve(count_sender(&notifications, "personal")),
            avg_notif_sentiment: mean(notifications.iter().filter_map(|e| e.message_sentiment)),
            hours_slept: compute_hours_slept(&activity),
            steps: compute_steps(&activity),
            hrv: mean(activity_values(&activity, "hrv")),
            time_at_work_ratio: compute_time_at_work_ratio(&locations),
            location_switches: count_policy.resolve(count_location_switches(&locations)),
            commute_min: count_policy.resolve(compute_commute_min(&locations)),
            mood_label: compute_mood_label(&mood_logs),
        }
    }
}

/// First and last representable instants of a UTC calendar day
pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN));
    let end = start + Duration::days(1) - Duration::milliseconds(1);
    (start, end)
}

/// Store-driven aggregation for one day at a time
pub struct FeatureAggregator<'a> {
    events: &'a dyn EventStore,
    features: &'a dyn FeatureStore,
    config: &'a PipelineConfig,
}

impl<'a> FeatureAggregator<'a> {
    pub fn new(
        events: &'a dyn EventStore,
        features: &'a dyn FeatureStore,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            events,
            features,
            config,
        }
    }

    /// Compute (without storing) the feature row for one user-day
    pub async fn aggregate_user_day(&self, user_id: &str, day: NaiveDate) -> Result<DailyFeature> {
        let (start, end) = day_bounds(day);
        let events = with_timeout(
            "events_for_user",
            self.config.store_timeout,
            self.events.events_for_user(user_id, start, end),
        )
        .await?;

        debug!(user_id, %day, events = events.len(), "aggregating user day");
        Ok(FeatureDeriver::derive(
            user_id,
            day,
            &events,
            self.config.count_policy,
        ))
    }

    /// Overwrite the stored row for `(row.user_id, row.day)`
    pub async fn upsert_daily_feature(&self, row: &DailyFeature) -> Result<()> {
        with_timeout(
            "upsert_daily_feature",
            self.config.store_timeout,
            self.features.upsert_daily_feature(row),
        )
        .await
    }

    /// Aggregate and store every user with events on `day`.
    ///
    /// Users are processed with at most `aggregation_workers` in flight. The
    /// first failure cancels the remaining users and is returned; rows already
    /// written stay written.
    pub async fn aggregate_all_users_for_day(&self, day: NaiveDate) -> Result<AggregationReport> {
        let (start, end) = day_bounds(day);
        let users = with_timeout(
            "users_with_events",
            self.config.store_timeout,
            self.events.users_with_events(start, end),
        )
        .await?;

        info!(%day, users = users.len(), workers = self.config.aggregation_workers, "aggregating day");

        let mut features: Vec<DailyFeature> = stream::iter(users)
            .map(|user_id| async move {
                let row = self.aggregate_user_day(&user_id, day).await?;
                self.upsert_daily_feature(&row).await?;
                Ok::<_, crate::error::PipelineError>(row)
            })
            .buffer_unordered(self.config.aggregation_workers.max(1))
            .try_collect()
            .await?;

        features.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        Ok(AggregationReport {
            day,
            users: features.len(),
            features,
        })
    }
}

/// Mean `duration_sec` across app sessions
fn compute_session_avg(app_usage: &[&RawEvent]) -> Option<f64> {
    mean(app_usage.iter().filter_map(|e| e.duration_sec))
}

/// Consecutive app sessions in different apps
fn count_app_switches(app_usage: &[&RawEvent]) -> Count {
    let apps: Vec<&str> = app_usage
        .iter()
        .filter_map(|e| e.app_name.as_deref())
        .collect();
    Count::new(count_changes(&apps), !app_usage.is_empty())
}

fn count_sender(notifications: &[&RawEvent], sender: &str) -> Count {
    let n = notifications
        .iter()
        .filter(|e| e.notification_sender_type.as_deref() == Some(sender))
        .count();
    Count::new(n as f64, !notifications.is_empty())
}

/// Idle time as a share of idle + active time
fn compute_idle_ratio(activity: &[&RawEvent]) -> Option<f64> {
    let idle = activity_duration(activity, "idle");
    let active = activity_duration(activity, "active");
    let total = idle + active;
    if total > 0.0 {
        Some(idle / total)
    } else {
        None
    }
}

fn compute_hours_slept(activity: &[&RawEvent]) -> Option<f64> {
    if !activity.iter().any(|e| is_activity(e, "sleep")) {
        return None;
    }
    Some(activity_duration(activity, "sleep") / SECONDS_PER_HOUR)
}

fn compute_steps(activity: &[&RawEvent]) -> Option<f64> {
    let mut values = activity_values(activity, "steps").peekable();
    values.peek()?;
    Some(values.sum())
}

/// Work-tagged location time as a share of all location time
fn compute_time_at_work_ratio(locations: &[&RawEvent]) -> Option<f64> {
    let total: f64 = locations.iter().filter_map(|e| e.duration_sec).sum();
    if total <= 0.0 {
        return None;
    }
    Some(location_duration(locations, "work") / total)
}

/// Consecutive location events in different place categories
fn count_location_switches(locations: &[&RawEvent]) -> Count {
    let places: Vec<&str> = locations
        .iter()
        .filter_map(|e| e.location_category.as_deref())
        .collect();
    Count::new(count_changes(&places), !locations.is_empty())
}

fn compute_commute_min(locations: &[&RawEvent]) -> Count {
    Count::new(
        location_duration(locations, "commute") / SECONDS_PER_MINUTE,
        !locations.is_empty(),
    )
}

/// Mean mood rating rounded half away from zero
fn compute_mood_label(mood_logs: &[&RawEvent]) -> Option<i32> {
    mean(mood_logs.iter().filter_map(|e| e.mood_rating.map(f64::from))).map(|m| m.round() as i32)
}

/// Total order over events; events equal under it are interchangeable
fn event_order(a: &RawEvent, b: &RawEvent) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.event_type.as_str().cmp(b.event_type.as_str()))
        .then_with(|| a.app_name.cmp(&b.app_name))
        .then_with(|| a.location_category.cmp(&b.location_category))
        .then_with(|| a.action_after.cmp(&b.action_after))
        .then_with(|| a.notification_sender_type.cmp(&b.notification_sender_type))
        .then_with(|| a.mood_rating.cmp(&b.mood_rating))
        .then_with(|| cmp_value(a.duration_sec, b.duration_sec))
        .then_with(|| cmp_value(a.message_sentiment, b.message_sentiment))
        .then_with(|| cmp_value(a.metric_value, b.metric_value))
}

fn cmp_value(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (a, b) => a.is_some().cmp(&b.is_some()),
    }
}

fn is_activity(event: &RawEvent, kind: &str) -> bool {
    event.action_after.as_deref() == Some(kind)
}

fn activity_duration(activity: &[&RawEvent], kind: &str) -> f64 {
    activity
        .iter()
        .filter(|e| is_activity(e, kind))
        .filter_map(|e| e.duration_sec)
        .sum()
}

fn activity_values<'e>(
    activity: &'e [&'e RawEvent],
    kind: &'e str,
) -> impl Iterator<Item = f64> + 'e {
    activity
        .iter()
        .filter(move |e| is_activity(e, kind))
        .filter_map(|e| e.metric_value)
}

fn location_duration(locations: &[&RawEvent], category: &str) -> f64 {
    locations
        .iter()
        .filter(|e| e.location_category.as_deref() == Some(category))
        .filter_map(|e| e.duration_sec)
        .sum()
}

fn count_changes(sequence: &[&str]) -> f64 {
    sequence.windows(2).filter(|w| w[0] != w[1]).count() as f64
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Timelike;
    use pretty_assertions::assert_eq;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, hour, minute, 0).unwrap()
    }

    fn app(hour: u32, name: &str, duration: f64) -> RawEvent {
        let mut e = RawEvent::new("u1", at(hour, 0), EventType::AppUsage);
        e.app_name = Some(name.to_string());
        e.duration_sec = Some(duration);
        e
    }

    fn notification(minute: u32, sender: &str, sentiment: Option<f64>) -> RawEvent {
        let mut e = RawEvent::new("u1", at(10, minute), EventType::Notification);
        e.notification_sender_type = Some(sender.to_string());
        e.message_sentiment = sentiment;
        e
    }

    fn activity(hour: u32, kind: &str, duration: Option<f64>, value: Option<f64>) -> RawEvent {
        let mut e = RawEvent::new("u1", at(hour, 30), EventType::Activity);
        e.action_after = Some(kind.to_string());
        e.duration_sec = duration;
        e.metric_value = value;
        e
    }

    fn location(hour: u32, category: &str, duration: f64) -> RawEvent {
        let mut e = RawEvent::new("u1", at(hour, 15), EventType::Location);
        e.location_category = Some(category.to_string());
        e.duration_sec = Some(duration);
        e
    }

    fn mood(hour: u32, rating: i32) -> RawEvent {
        let mut e = RawEvent::new("u1", at(hour, 45), EventType::MoodLog);
        e.mood_rating = Some(rating);
        e
    }

    fn full_day() -> Vec<RawEvent> {
        vec![
            app(9, "mail", 120.0),
            app(10, "chat", 60.0),
            app(11, "chat", 30.0),
            app(12, "mail", 90.0),
            notification(1, "work", Some(0.5)),
            notification(2, "work", Some(-0.1)),
            notification(3, "personal", None),
            activity(0, "sleep", Some(7.5 * 3600.0), None),
            activity(13, "idle", Some(600.0), None),
            activity(14, "active", Some(1800.0), None),
            activity(15, "steps", None, Some(4000.0)),
            activity(16, "steps", None, Some(2500.0)),
            activity(17, "hrv", None, Some(60.0)),
            activity(18, "hrv", None, Some(70.0)),
            location(8, "commute", 1800.0),
            location(9, "work", 28800.0),
            location(18, "commute", 2400.0),
            location(19, "home", 10800.0),
            mood(20, 3),
            mood(21, 4),
        ]
    }

    #[test]
    fn test_full_day_reduction() {
        let row = FeatureDeriver::derive("u1", day(), &full_day(), CountPolicy::CollapseZero);

        assert_eq!(row.session_avg_sec, Some(75.0));
        assert_eq!(row.app_switch_count, Some(2.0));
        assert_eq!(row.work_notif_count, Some(2.0));
        assert_eq!(row.personal_notif_count, Some(1.0));
        assert!((row.avg_notif_sentiment.unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(row.hours_slept, Some(7.5));
        assert_eq!(row.idle_ratio, Some(0.25));
        assert_eq!(row.steps, Some(6500.0));
        assert_eq!(row.hrv, Some(65.0));
        assert_eq!(row.time_at_work_ratio, Some(28800.0 / 43800.0));
        assert_eq!(row.location_switches, Some(3.0));
        assert_eq!(row.commute_min, Some(70.0));
        // mean 3.5 rounds away from zero
        assert_eq!(row.mood_label, Some(4));
        assert_eq!(row.present_count(), 12);
    }

    #[test]
    fn test_no_events_is_all_null() {
        let row = FeatureDeriver::derive("u1", day(), &[], CountPolicy::CollapseZero);
        assert_eq!(row, DailyFeature::empty("u1", day()));
    }

    #[test]
    fn test_zero_counts_collapse_to_null_by_default() {
        // Many app sessions in one app, notifications from neither sender type,
        // one location all day: every count is 0 despite plenty of events
        let events = vec![
            app(9, "mail", 60.0),
            app(10, "mail", 60.0),
            notification(5, "system", Some(0.0)),
            location(9, "home", 3600.0),
            location(10, "home", 3600.0),
        ];

        let collapsed = FeatureDeriver::derive("u1", day(), &events, CountPolicy::CollapseZero);
        assert_eq!(collapsed.app_switch_count, None);
        assert_eq!(collapsed.work_notif_count, None);
        assert_eq!(collapsed.personal_notif_count, None);
        assert_eq!(collapsed.location_switches, None);
        assert_eq!(collapsed.commute_min, None);

        let kept = FeatureDeriver::derive("u1", day(), &events, CountPolicy::KeepZero);
        assert_eq!(kept.app_switch_count, Some(0.0));
        assert_eq!(kept.work_notif_count, Some(0.0));
        assert_eq!(kept.personal_notif_count, Some(0.0));
        assert_eq!(kept.location_switches, Some(0.0));
        assert_eq!(kept.commute_min, Some(0.0));

        // Non-count features are unaffected by the policy
        assert_eq!(collapsed.time_at_work_ratio, Some(0.0));
        assert_eq!(kept.time_at_work_ratio, Some(0.0));
    }

    #[test]
    fn test_keep_zero_still_null_without_events() {
        let events = vec![mood(20, 2)];
        let row = FeatureDeriver::derive("u1", day(), &events, CountPolicy::KeepZero);
        assert_eq!(row.app_switch_count, None);
        assert_eq!(row.work_notif_count, None);
        assert_eq!(row.location_switches, None);
        assert_eq!(row.mood_label, Some(2));
    }

    #[test]
    fn test_ratio_denominators_of_zero_are_null() {
        let events = vec![
            activity(13, "idle", Some(0.0), None),
            activity(14, "active", Some(0.0), None),
            location(9, "work", 0.0),
        ];
        let row = FeatureDeriver::derive("u1", day(), &events, CountPolicy::CollapseZero);
        assert_eq!(row.idle_ratio, None);
        assert_eq!(row.time_at_work_ratio, None);
    }

    #[test]
    fn test_order_independent() {
        let events = full_day();
        let mut reversed = events.clone();
        reversed.reverse();

        let a = FeatureDeriver::derive("u1", day(), &events, CountPolicy::CollapseZero);
        let b = FeatureDeriver::derive("u1", day(), &reversed, CountPolicy::CollapseZero);
        assert_eq!(a, b);
    }

    #[test]
    fn test_tied_timestamps_order_independent() {
        let tied = |name: &str| {
            let mut e = app(9, name, 60.0);
            e.timestamp = at(9, 0);
            e
        };
        let a = vec![tied("mail"), tied("mail"), tied("chat")];
        let b = vec![tied("mail"), tied("chat"), tied("mail")];

        let from_a = FeatureDeriver::derive("u1", day(), &a, CountPolicy::CollapseZero);
        let from_b = FeatureDeriver::derive("u1", day(), &b, CountPolicy::CollapseZero);
        assert_eq!(from_a, from_b);
        assert_eq!(from_a.app_switch_count, Some(1.0));
    }

    #[test]
    fn test_day_bounds() {
        let (start, end) = day_bounds(day());
        assert_eq!(start, at(0, 0));
        assert_eq!(end.date_naive(), day());
        assert_eq!((end.hour(), end.minute(), end.second()), (23, 59, 59));
        assert_eq!(end.timestamp_subsec_millis(), 999);
    }

    #[tokio::test]
    async fn test_aggregate_user_day_is_idempotent() {
        let store = InMemoryStore::new();
        store.append_events(full_day()).await;
        let config = PipelineConfig::default();
        let aggregator = FeatureAggregator::new(&store, &store, &config);

        let first = aggregator.aggregate_user_day("u1", day()).await.unwrap();
        let second = aggregator.aggregate_user_day("u1", day()).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    /// In-memory store that fails reads or writes for one user
    struct FlakyStore {
        inner: InMemoryStore,
        fail_reads_for: Option<&'static str>,
        fail_writes_for: Option<&'static str>,
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn events_for_user(
            &self,
            user_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<RawEvent>> {
            if self.fail_reads_for == Some(user_id) {
                return Err(PipelineError::Repository(format!("read failed for {user_id}")));
            }
            self.inner.events_for_user(user_id, start, end).await
        }

        async fn users_with_events(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<String>> {
            self.inner.users_with_events(start, end).await
        }
    }

    #[async_trait]
    impl FeatureStore for FlakyStore {
        async fn upsert_daily_feature(&self, row: &DailyFeature) -> Result<()> {
            if self.fail_writes_for == Some(row.user_id.as_str()) {
                return Err(PipelineError::Repository(format!(
                    "write failed for {}",
                    row.user_id
                )));
            }
            self.inner.upsert_daily_feature(row).await
        }

        async fn daily_features(&self) -> Result<Vec<DailyFeature>> {
            self.inner.daily_features().await
        }

        async fn daily_features_since(&self, since: NaiveDate) -> Result<Vec<DailyFeature>> {
            self.inner.daily_features_since(since).await
        }
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_users() {
        let failures = [(Some("u2"), None), (None, Some("u2"))];
        for (fail_reads_for, fail_writes_for) in failures {
            let store = FlakyStore {
                inner: InMemoryStore::new(),
                fail_reads_for,
                fail_writes_for,
            };
            let events = ["u1", "u2", "u3"].into_iter().map(|user| {
                let mut e = mood(20, 4);
                e.user_id = user.to_string();
                e
            });
            store.inner.append_events(events).await;

            let config = PipelineConfig {
                aggregation_workers: 1,
                ..Default::default()
            };
            let aggregator = FeatureAggregator::new(&store, &store, &config);

            let err = aggregator.aggregate_all_users_for_day(day()).await.unwrap_err();
            assert!(matches!(err, PipelineError::Repository(_)));

            let stored: Vec<String> = store
                .inner
                .daily_features()
                .await
                .unwrap()
                .into_iter()
                .map(|row| row.user_id)
                .collect();
            assert_eq!(stored, vec!["u1".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_aggregate_all_users_upserts_each_user() {
        let store = InMemoryStore::new();
        let mut events = full_day();
        let mut other = mood(22, 5);
        other.user_id = "u2".to_string();
        events.push(other);
        // Outside the day window
        let mut tomorrow = mood(0, 1);
        tomorrow.timestamp = at(0, 0) + Duration::days(1);
        tomorrow.user_id = "u3".to_string();
        events.push(tomorrow);
        store.append_events(events).await;

        let config = PipelineConfig {
            aggregation_workers: 2,
            ..Default::default()
        };
        let aggregator = FeatureAggregator::new(&store, &store, &config);

        let report = aggregator.aggregate_all_users_for_day(day()).await.unwrap();
        assert_eq!(report.users, 2);
        assert_eq!(report.features[0].user_id, "u1");
        assert_eq!(report.features[1].mood_label, Some(5));

        // Re-running overwrites rather than accumulating
        aggregator.aggregate_all_users_for_day(day()).await.unwrap();
        let stored = store.daily_features().await.unwrap();
        assert_eq!(stored, report.features);
    }
}
