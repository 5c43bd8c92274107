//! Hourly recommendation job: averages the last hour of telemetry for the
//! active planting cycle, asks the ML service whether to irrigate, persists
//! the advice and, when it says so, queues an automatic irrigation command.
//!
//! A second leg asks for a one-hour forecast and repeats the decision for the
//! forecast conditions. It only runs after the first leg succeeded, and its
//! failure never undoes the first leg's writes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use time::UtcOffset;
use tracing::{error, info, warn};

use crate::clock::{self, minute_floor};
use crate::config::ScheduleConfig;
use crate::db::{CommandMode, Db, DeviceKind, NewCommand, NewRecommendation};
use crate::ml::{Features, IrrigationAdvice, Recommender};
use crate::state::SharedState;

const WINDOW_SEC: i64 = 3600;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// What one saved recommendation produced.
#[derive(Debug, Clone, Serialize)]
pub struct SavedAdvice {
    pub recommendation_id: i64,
    pub activate: bool,
    pub duration_sec: i64,
    /// Set when the advice queued an irrigation command.
    pub command_id: Option<i64>,
    pub scheduled_start: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HourlyOutcome {
    Skipped {
        reason: &'static str,
    },
    Completed {
        cycle_id: i64,
        samples: i64,
        current: SavedAdvice,
        prediction_id: Option<i64>,
        forecast: Option<SavedAdvice>,
        forecast_error: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Producer {
    db: Db,
    recommender: Arc<dyn Recommender>,
    lead_time_sec: i64,
    flow_rate_lpm: f64,
    offset: UtcOffset,
}

impl Producer {
    pub fn new(db: Db, recommender: Arc<dyn Recommender>, cfg: &ScheduleConfig) -> Result<Self> {
        Ok(Self {
            db,
            recommender,
            lead_time_sec: cfg.lead_time_sec,
            flow_rate_lpm: cfg.flow_rate_lpm,
            offset: cfg.utc_offset()?,
        })
    }

    /// One hourly run at `now`. Missing data is a `Skipped` outcome; an ML
    /// failure on the first leg is an error (wrapping `MlError`) and nothing
    /// is written.
    pub async fn run_hourly(&self, now: i64) -> Result<HourlyOutcome> {
        let Some(cycle) = self.db.active_cycle().await? else {
            return Ok(HourlyOutcome::Skipped {
                reason: "no active planting cycle",
            });
        };

        let Some(avg) = self
            .db
            .average_readings(cycle.cycle_id, now - WINDOW_SEC, now)
            .await?
        else {
            return Ok(HourlyOutcome::Skipped {
                reason: "no readings in the last hour",
            });
        };

        let features = match (avg.soil_moisture, avg.air_humidity, avg.temperature) {
            (Some(soil_moisture), Some(humidity), Some(temperature)) => Features {
                soil_moisture,
                humidity,
                temperature,
            },
            _ => {
                return Ok(HourlyOutcome::Skipped {
                    reason: "readings lack one of temperature, humidity or soil moisture",
                })
            }
        };

        let advice = self
            .recommender
            .irrigation(&features)
            .await
            .context("irrigation recommendation failed")?;

        let start = minute_floor(now) + self.lead_time_sec;
        let current = self
            .save_advice(cycle.cycle_id, &advice, now, start)
            .await?;

        let (prediction_id, forecast, forecast_error) =
            match self.forecast_leg(cycle.cycle_id, &features, now).await {
                Ok((prediction_id, saved)) => (Some(prediction_id), Some(saved), None),
                Err(e) => {
                    warn!("hourly: forecast leg failed: {e:#}");
                    (None, None, Some(format!("{e:#}")))
                }
            };

        Ok(HourlyOutcome::Completed {
            cycle_id: cycle.cycle_id,
            samples: avg.samples,
            current,
            prediction_id,
            forecast,
            forecast_error,
        })
    }

    async fn forecast_leg(
        &self,
        cycle_id: i64,
        features: &Features,
        now: i64,
    ) -> Result<(i64, SavedAdvice)> {
        let forecast = self
            .recommender
            .predict(features)
            .await
            .context("forecast request failed")?;
        let forecast_at = clock::parse_local(&forecast.time, self.offset)
            .context("forecast time is unusable")?;

        let prediction_id = self
            .db
            .insert_prediction(
                cycle_id,
                forecast.temperature,
                forecast.humidity,
                forecast.soil_moisture,
                forecast_at,
                now,
            )
            .await?;

        let advice = self
            .recommender
            .irrigation(&forecast.features())
            .await
            .context("forecast irrigation recommendation failed")?;

        let earliest = minute_floor(now) + self.lead_time_sec;
        let saved = self
            .save_advice(cycle_id, &advice, forecast_at, forecast_at.max(earliest))
            .await?;
        Ok((prediction_id, saved))
    }

    /// Persist one recommendation and, when it asks for water, its command.
    async fn save_advice(
        &self,
        cycle_id: i64,
        advice: &IrrigationAdvice,
        recommended_at: i64,
        scheduled_start: i64,
    ) -> Result<SavedAdvice> {
        let condition_id = self.db.get_or_create_message(&advice.condition).await?;
        let suggestion_id = self.db.get_or_create_message(&advice.suggestion).await?;
        let activate = advice.cluster.activate;
        let duration_sec = advice.cluster.duration_sec;

        let recommendation_id = self
            .db
            .insert_recommendation(&NewRecommendation {
                cycle_id,
                activate,
                duration_sec,
                condition_id,
                suggestion_id,
                recommended_at,
            })
            .await?;

        let mut saved = SavedAdvice {
            recommendation_id,
            activate,
            duration_sec,
            command_id: None,
            scheduled_start: None,
        };

        if !activate {
            return Ok(saved);
        }
        if duration_sec <= 0 {
            warn!(recommendation_id, "hourly: activate with zero duration, not queued");
            return Ok(saved);
        }

        let command_id = self
            .db
            .enqueue_command(&NewCommand {
                kind: DeviceKind::Irrigation,
                recommendation_id: Some(recommendation_id),
                mode: CommandMode::Auto,
                scheduled_start,
                duration_sec,
                volume_liters: volume_liters(duration_sec, self.flow_rate_lpm),
            })
            .await?;

        info!(
            recommendation_id,
            command_id,
            scheduled_start,
            duration_sec,
            "hourly: irrigation queued"
        );
        saved.command_id = Some(command_id);
        saved.scheduled_start = Some(scheduled_start);
        Ok(saved)
    }
}

pub fn volume_liters(duration_sec: i64, flow_rate_lpm: f64) -> f64 {
    duration_sec as f64 / 60.0 * flow_rate_lpm
}

fn describe(outcome: &HourlyOutcome) -> String {
    match outcome {
        HourlyOutcome::Skipped { reason } => format!("hourly skipped: {reason}"),
        HourlyOutcome::Completed {
            cycle_id,
            current,
            forecast,
            ..
        } => {
            let leg = |s: &SavedAdvice| match s.command_id {
                Some(id) => format!("queued #{id} for {}s", s.duration_sec),
                None => "no irrigation".to_string(),
            };
            format!(
                "cycle {cycle_id}: now {}, forecast {}",
                leg(current),
                forecast.as_ref().map_or_else(|| "unavailable".to_string(), leg)
            )
        }
    }
}

/// Run one hourly job and record the result in the status feed.
pub async fn run_once(producer: &Producer, shared: &SharedState, now: i64) -> Result<HourlyOutcome> {
    match producer.run_hourly(now).await {
        Ok(outcome) => {
            let mut st = shared.write().await;
            match &outcome {
                HourlyOutcome::Skipped { .. } => st.record_scheduler(describe(&outcome)),
                HourlyOutcome::Completed { .. } => st.record_recommendation(describe(&outcome)),
            }
            Ok(outcome)
        }
        Err(e) => {
            shared.write().await.record_error(format!("hourly job failed: {e:#}"));
            Err(e)
        }
    }
}

/// Run the hourly job on every wall-clock hour. Intended to be
/// `tokio::spawn`-ed from main.
pub async fn run(producer: Producer, shared: SharedState) {
    info!("hourly recommendation job started");
    loop {
        let wait = clock::secs_until_next(clock::now_unix(), 3600);
        tokio::time::sleep(Duration::from_secs(wait as u64)).await;

        if let Err(e) = run_once(&producer, &shared, clock::now_unix()).await {
            error!("hourly job failed: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{test_cycle, test_db};
    use crate::db::ReadingFields;
    use crate::ml::tests::{advice, upstream_error, FakeRecommender};
    use crate::ml::{Forecast, MlError};
    use crate::state::SystemState;

    // 2024-05-01 13:00:30 WIB
    const NOW: i64 = 1_714_543_230;

    fn schedule() -> ScheduleConfig {
        ScheduleConfig::default()
    }

    async fn setup() -> (Db, Arc<FakeRecommender>, Producer) {
        let db = test_db().await;
        db.upsert_cycle(&test_cycle()).await.unwrap();
        let fake = Arc::new(FakeRecommender::default());
        let producer = Producer::new(db.clone(), fake.clone(), &schedule()).unwrap();
        (db, fake, producer)
    }

    async fn seed(db: &Db, at: i64, temp: f64, hum: f64, soil: f64) {
        db.upsert_reading(
            1,
            minute_floor(at),
            &ReadingFields {
                temperature: Some(temp),
                air_humidity: Some(hum),
                soil_moisture: Some(soil),
                soil_ph: None,
            },
        )
        .await
        .unwrap();
    }

    fn forecast(time: &str) -> Forecast {
        Forecast {
            temperature: 31.0,
            humidity: 65.0,
            soil_moisture: 35.0,
            time: time.into(),
        }
    }

    async fn queue_len(db: &Db) -> usize {
        db.recent_commands(None, 100).await.unwrap().len()
    }

    #[tokio::test]
    async fn empty_window_writes_nothing() {
        let (db, fake, producer) = setup().await;
        // Outside the window.
        seed(&db, NOW - 2 * 3600, 29.0, 70.0, 40.0).await;

        let outcome = producer.run_hourly(NOW).await.unwrap();
        assert!(matches!(outcome, HourlyOutcome::Skipped { .. }));
        assert!(fake.asked().is_empty(), "ML must not be called");
        assert!(db.recent_recommendations(10).await.unwrap().is_empty());
        assert_eq!(queue_len(&db).await, 0);
    }

    #[tokio::test]
    async fn no_active_cycle_is_skipped() {
        let db = test_db().await;
        let fake = Arc::new(FakeRecommender::default());
        let producer = Producer::new(db, fake, &schedule()).unwrap();
        assert!(matches!(
            producer.run_hourly(NOW).await.unwrap(),
            HourlyOutcome::Skipped { reason: "no active planting cycle" }
        ));
    }

    #[tokio::test]
    async fn activate_queues_irrigation_one_lead_after_the_minute() {
        let (db, fake, producer) = setup().await;
        seed(&db, NOW - 1200, 28.0, 70.0, 30.0).await;
        seed(&db, NOW - 600, 30.0, 80.0, 40.0).await;
        fake.push_advice(Ok(advice(true, 600)));
        fake.push_forecast(Err(upstream_error()));

        let outcome = producer.run_hourly(NOW).await.unwrap();
        let HourlyOutcome::Completed { current, samples, forecast, forecast_error, .. } = outcome
        else {
            panic!("expected Completed");
        };
        assert_eq!(samples, 2);
        assert!(forecast.is_none());
        assert!(forecast_error.is_some());

        let asked = fake.asked();
        assert_eq!(asked.len(), 1);
        assert_eq!(asked[0].temperature, 29.0);
        assert_eq!(asked[0].humidity, 75.0);
        assert_eq!(asked[0].soil_moisture, 35.0);

        let cmd = db
            .get_command(current.command_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd.kind, DeviceKind::Irrigation);
        assert_eq!(cmd.mode, CommandMode::Auto);
        assert_eq!(cmd.scheduled_start, minute_floor(NOW) + 60);
        assert_eq!(cmd.computed_end, minute_floor(NOW) + 60 + 600);
        assert_eq!(cmd.volume_liters, 70.0);
        assert_eq!(cmd.recommendation_id, Some(current.recommendation_id));

        // First leg survives the failed forecast.
        assert_eq!(db.recent_recommendations(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_activate_saves_recommendation_only() {
        let (db, fake, producer) = setup().await;
        seed(&db, NOW - 60, 25.0, 90.0, 80.0).await;
        fake.push_advice(Ok(advice(false, 0)));

        let HourlyOutcome::Completed { current, .. } = producer.run_hourly(NOW).await.unwrap()
        else {
            panic!("expected Completed");
        };
        assert!(current.command_id.is_none());
        let recs = db.recent_recommendations(10).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].recommended_at, NOW);
        assert_eq!(
            db.message_text(recs[0].condition_id).await.unwrap().as_deref(),
            Some("Soil too dry")
        );
        assert_eq!(queue_len(&db).await, 0);
    }

    #[tokio::test]
    async fn ml_failure_aborts_before_any_write() {
        let (db, fake, producer) = setup().await;
        seed(&db, NOW - 60, 25.0, 90.0, 80.0).await;
        fake.push_advice(Err(upstream_error()));
        fake.push_forecast(Ok(forecast("2024-05-01 14:00:00")));

        let err = producer.run_hourly(NOW).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MlError>(),
            Some(MlError::Upstream { status: 503, .. })
        ));
        assert!(db.recent_recommendations(10).await.unwrap().is_empty());
        assert!(fake.forecasts.lock().unwrap().len() == 1, "forecast leg must not run");
    }

    #[tokio::test]
    async fn oversized_duration_fails_without_queueing() {
        let (db, fake, producer) = setup().await;
        seed(&db, NOW - 60, 25.0, 60.0, 20.0).await;
        fake.push_advice(Ok(advice(true, i64::MAX)));

        let err = producer.run_hourly(NOW).await.unwrap_err();
        assert!(format!("{err:#}").contains("overflows"));
        assert_eq!(queue_len(&db).await, 0);
    }

    #[tokio::test]
    async fn forecast_leg_schedules_at_forecast_time() {
        let (db, fake, producer) = setup().await;
        seed(&db, NOW - 60, 29.0, 70.0, 40.0).await;
        fake.push_advice(Ok(advice(false, 0)));
        fake.push_forecast(Ok(forecast("2024-05-01 14:00:00")));
        fake.push_advice(Ok(advice(true, 300)));

        let HourlyOutcome::Completed { prediction_id, forecast, .. } =
            producer.run_hourly(NOW).await.unwrap()
        else {
            panic!("expected Completed");
        };
        assert!(prediction_id.is_some());

        // 14:00 WIB == 07:00 UTC
        let at = 1_714_546_800;
        let forecast = forecast.unwrap();
        assert_eq!(forecast.scheduled_start, Some(at));
        let cmd = db.get_command(forecast.command_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(cmd.scheduled_start, at);
        assert_eq!(cmd.duration_sec, 300);

        let asked = fake.asked();
        assert_eq!(asked.len(), 2);
        assert_eq!(asked[1].soil_moisture, 35.0);
        let recs = db.recent_recommendations(10).await.unwrap();
        assert_eq!(recs[0].recommended_at, at);
    }

    #[tokio::test]
    async fn stale_forecast_time_is_clamped_to_lead() {
        let (db, fake, producer) = setup().await;
        seed(&db, NOW - 60, 29.0, 70.0, 40.0).await;
        fake.push_advice(Ok(advice(false, 0)));
        fake.push_forecast(Ok(forecast("2024-05-01 12:00:00")));
        fake.push_advice(Ok(advice(true, 300)));

        let HourlyOutcome::Completed { forecast, .. } = producer.run_hourly(NOW).await.unwrap()
        else {
            panic!("expected Completed");
        };
        assert_eq!(forecast.unwrap().scheduled_start, Some(minute_floor(NOW) + 60));
    }

    #[tokio::test]
    async fn unparseable_forecast_time_keeps_first_leg() {
        let (db, fake, producer) = setup().await;
        seed(&db, NOW - 60, 29.0, 70.0, 40.0).await;
        fake.push_advice(Ok(advice(true, 120)));
        fake.push_forecast(Ok(forecast("soon")));

        let HourlyOutcome::Completed { current, forecast_error, .. } =
            producer.run_hourly(NOW).await.unwrap()
        else {
            panic!("expected Completed");
        };
        assert!(current.command_id.is_some());
        assert!(forecast_error.unwrap().contains("forecast time"));
        assert_eq!(queue_len(&db).await, 1);
    }

    #[tokio::test]
    async fn run_once_records_status_event() {
        let (db, fake, producer) = setup().await;
        seed(&db, NOW - 60, 29.0, 70.0, 40.0).await;
        fake.push_advice(Ok(advice(true, 600)));
        let shared = SystemState::shared();

        run_once(&producer, &shared, NOW).await.unwrap();
        let st = shared.read().await;
        assert_eq!(st.events.len(), 1);
        assert!(st.events[0].detail.contains("queued #1 for 600s"), "{}", st.events[0].detail);
    }

    #[test]
    fn volume_uses_flow_rate() {
        assert_eq!(volume_liters(600, 7.0), 70.0);
        assert_eq!(volume_liters(90, 10.0), 15.0);
    }
}
