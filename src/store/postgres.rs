//! Postgres store backend
//!
//! Tables (see `migrations/`, applied by [`PgStore::migrate`]):
//! - `system_events(user_id, ts, event_type, app_name, duration_sec, location_category,
//!   action_after, notification_sender_type, message_sentiment, mood_rating, metric_value)`
//! - `daily_features(user_id, day, <12 features>, mood_label)`, unique `(user_id, day)`
//! - `model_registry(model_version PK, features, coefficients, intercept, lambda,
//!   train_mae, created_at)`
//! - `model_feature_importance(model_version, feature, importance)`
//! - `model_predictions(model_version, user_id, day, y_true, y_pred, proba_at_risk)`,
//!   unique `(model_version, user_id, day)`

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::store::{EventStore, FeatureStore, ModelRegistry, PredictionStore};
use crate::types::{
    DailyFeature, EventType, FeatureImportance, Model, Prediction, RawEvent, TrainingRun,
};

const DAILY_FEATURE_COLUMNS: &str = "user_id, day, session_avg_sec, idle_ratio, \
     app_switch_count, work_notif_count, personal_notif_count, avg_notif_sentiment, \
     hours_slept, steps, hrv, time_at_work_ratio, location_switches, commute_min, mood_label";

const MODEL_COLUMNS: &str =
    "model_version, features, coefficients, intercept, lambda, train_mae, created_at";

/// Store backed by a Postgres connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| PipelineError::Repository(format!("migration failed: {e}")))
    }

    /// Round-trip a trivial query
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn events_for_user(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, ts, event_type, app_name, duration_sec, location_category,
                   action_after, notification_sender_type, message_sentiment,
                   mood_rating, metric_value
            FROM system_events
            WHERE user_id = $1 AND ts >= $2 AND ts <= $3
            ORDER BY ts, id
            "#,
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("event_type")?;
            let Some(event_type) = EventType::parse(&kind) else {
                warn!(user_id, event_type = %kind, "skipping event with unknown type");
                continue;
            };
            events.push(RawEvent {
                user_id: row.try_get("user_id")?,
                timestamp: row.try_get("ts")?,
                event_type,
                app_name: row.try_get("app_name")?,
                duration_sec: row.try_get("duration_sec")?,
                location_category: row.try_get("location_category")?,
                action_after: row.try_get("action_after")?,
                notification_sender_type: row.try_get("notification_sender_type")?,
                message_sentiment: row.try_get("message_sentiment")?,
                mood_rating: row.try_get("mood_rating")?,
                metric_value: row.try_get("metric_value")?,
            });
        }
        Ok(events)
    }

    async fn users_with_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT user_id FROM system_events WHERE ts >= $1 AND ts <= $2 ORDER BY user_id",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("user_id").map_err(PipelineError::from))
            .collect()
    }
}

#[async_trait]
impl FeatureStore for PgStore {
    async fn upsert_daily_feature(&self, row: &DailyFeature) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_features
            (user_id, day, session_avg_sec, idle_ratio, app_switch_count, work_notif_count,
             personal_notif_count, avg_notif_sentiment, hours_slept, steps, hrv,
             time_at_work_ratio, location_switches, commute_min, mood_label)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (user_id, day) DO UPDATE
            SET session_avg_sec = EXCLUDED.session_avg_sec,
                idle_ratio = EXCLUDED.idle_ratio,
                app_switch_count = EXCLUDED.app_switch_count,
                work_notif_count = EXCLUDED.work_notif_count,
                personal_notif_count = EXCLUDED.personal_notif_count,
                avg_notif_sentiment = EXCLUDED.avg_notif_sentiment,
                hours_slept = EXCLUDED.hours_slept,
                steps = EXCLUDED.steps,
                hrv = EXCLUDED.hrv,
                time_at_work_ratio = EXCLUDED.time_at_work_ratio,
                location_switches = EXCLUDED.location_switches,
                commute_min = EXCLUDED.commute_min,
                mood_label = EXCLUDED.mood_label
            "#,
        )
        .bind(&row.user_id)
        .bind(row.day)
        .bind(row.session_avg_sec)
        .bind(row.idle_ratio)
        .bind(row.app_switch_count)
        .bind(row.work_notif_count)
        .bind(row.personal_notif_count)
        .bind(row.avg_notif_sentiment)
        .bind(row.hours_slept)
        .bind(row.steps)
        .bind(row.hrv)
        .bind(row.time_at_work_ratio)
        .bind(row.location_switches)
        .bind(row.commute_min)
        .bind(row.mood_label)
        .execute(&self.pool)
        .await?;

        debug!(user_id = %row.user_id, day = %row.day, "daily feature upserted");
        Ok(())
    }

    async fn daily_features(&self) -> Result<Vec<DailyFeature>> {
        let query = format!("SELECT {DAILY_FEATURE_COLUMNS} FROM daily_features ORDER BY user_id, day");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(daily_feature_from_row).collect()
    }

    async fn daily_features_since(&self, since: NaiveDate) -> Result<Vec<DailyFeature>> {
        let query = format!(
            "SELECT {DAILY_FEATURE_COLUMNS} FROM daily_features WHERE day >= $1 ORDER BY user_id, day"
        );
        let rows = sqlx::query(&query)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(daily_feature_from_row).collect()
    }
}

#[async_trait]
impl ModelRegistry for PgStore {
    async fn commit_run(&self, run: &TrainingRun) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let model = &run.model;

        let inserted = sqlx::query(
            r#"
            INSERT INTO model_registry
            (model_version, features, coefficients, intercept, lambda, train_mae, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (model_version) DO NOTHING
            "#,
        )
        .bind(&model.model_version)
        .bind(&model.features)
        .bind(&model.coefficients)
        .bind(model.intercept)
        .bind(model.lambda)
        .bind(model.train_mae)
        .bind(model.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(PipelineError::VersionConflict(model.model_version.clone()));
        }

        for importance in &run.importances {
            sqlx::query(
                r#"
                INSERT INTO model_feature_importance (model_version, feature, importance)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&importance.model_version)
            .bind(&importance.feature)
            .bind(importance.importance)
            .execute(&mut *tx)
            .await?;
        }

        for prediction in &run.predictions {
            upsert_prediction(&mut tx, prediction).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn model(&self, model_version: &str) -> Result<Option<Model>> {
        let query = format!("SELECT {MODEL_COLUMNS} FROM model_registry WHERE model_version = $1");
        let row = sqlx::query(&query)
            .bind(model_version)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(model_from_row).transpose()
    }

    async fn latest_model(&self) -> Result<Option<Model>> {
        // Versions sharing a created_at share a base; order the `.N` suffix numerically
        let query = format!(
            "SELECT {MODEL_COLUMNS} FROM model_registry \
             ORDER BY created_at DESC, \
                      COALESCE(substring(model_version FROM '\\.([0-9]+)$')::BIGINT, 0) DESC, \
                      model_version DESC \
             LIMIT 1"
        );
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(model_from_row).transpose()
    }

    async fn importances(&self, model_version: &str) -> Result<Vec<FeatureImportance>> {
        let rows = sqlx::query(
            "SELECT model_version, feature, importance FROM model_feature_importance \
             WHERE model_version = $1",
        )
        .bind(model_version)
        .fetch_all(&self.pool)
        .await?;

        let mut importances = Vec::with_capacity(rows.len());
        for row in rows {
            importances.push(FeatureImportance {
                model_version: row.try_get("model_version")?,
                feature: row.try_get("feature")?,
                importance: row.try_get("importance")?,
            });
        }
        Ok(importances)
    }
}

#[async_trait]
impl PredictionStore for PgStore {
    async fn upsert_predictions(&self, predictions: &[Prediction]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for prediction in predictions {
            upsert_prediction(&mut tx, prediction).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn predictions(&self, model_version: &str) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(
            r#"
            SELECT model_version, user_id, day, y_true, y_pred, proba_at_risk
            FROM model_predictions
            WHERE model_version = $1
            ORDER BY user_id, day
            "#,
        )
        .bind(model_version)
        .fetch_all(&self.pool)
        .await?;

        let mut predictions = Vec::with_capacity(rows.len());
        for row in rows {
            predictions.push(Prediction {
                model_version: row.try_get("model_version")?,
                user_id: row.try_get("user_id")?,
                day: row.try_get("day")?,
                y_true: row.try_get("y_true")?,
                y_pred: row.try_get("y_pred")?,
                proba_at_risk: row.try_get("proba_at_risk")?,
            });
        }
        Ok(predictions)
    }
}

async fn upsert_prediction(
    tx: &mut Transaction<'_, Postgres>,
    prediction: &Prediction,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO model_predictions
        (model_version, user_id, day, y_true, y_pred, proba_at_risk)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (model_version, user_id, day) DO UPDATE
        SET y_true = EXCLUDED.y_true,
            y_pred = EXCLUDED.y_pred,
            proba_at_risk = EXCLUDED.proba_at_risk
        "#,
    )
    .bind(&prediction.model_version)
    .bind(&prediction.user_id)
    .bind(prediction.day)
    .bind(prediction.y_true)
    .bind(prediction.y_pred)
    .bind(prediction.proba_at_risk)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn daily_feature_from_row(row: &PgRow) -> Result<DailyFeature> {
    Ok(DailyFeature {
        user_id: row.try_get("user_id")?,
        day: row.try_get("day")?,
        session_avg_sec: row.try_get("session_avg_sec")?,
        idle_ratio: row.try_get("idle_ratio")?,
        app_switch_count: row.try_get("app_switch_count")?,
        work_notif_count: row.try_get("work_notif_count")?,
        personal_notif_count: row.try_get("personal_notif_count")?,
        avg_notif_sentiment: row.try_get("avg_notif_sentiment")?,
        hours_slept: row.try_get("hours_slept")?,
        steps: row.try_get("steps")?,
        hrv: row.try_get("hrv")?,
        time_at_work_ratio: row.try_get("time_at_work_ratio")?,
        location_switches: row.try_get("location_switches")?,
        commute_min: row.try_get("commute_min")?,
        mood_label: row.try_get("mood_label")?,
    })
}

fn model_from_row(row: &PgRow) -> Result<Model> {
    let model = Model {
        model_version: row.try_get("model_version")?,
        features: row.try_get("features")?,
        coefficients: row.try_get("coefficients")?,
        intercept: row.try_get("intercept")?,
        lambda: row.try_get("lambda")?,
        train_mae: row.try_get("train_mae")?,
        created_at: row.try_get("created_at")?,
    };
    if model.features.len() != model.coefficients.len() {
        return Err(PipelineError::Repository(format!(
            "model {} has {} features but {} coefficients",
            model.model_version,
            model.features.len(),
            model.coefficients.len()
        )));
    }
    Ok(model)
}
