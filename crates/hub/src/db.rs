use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::fmt;
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Which physical actuator a command or log entry drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Irrigation,
    Fertilizer,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Irrigation => "irrigation",
            DeviceKind::Fertilizer => "fertilizer",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "irrigation" => Ok(Self::Irrigation),
            "fertilizer" => Ok(Self::Fertilizer),
            other => Err(anyhow::anyhow!("unknown device kind: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommandMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlantingCycle {
    pub cycle_id: i64,
    pub name: String,
    pub planted_at: i64,
    pub harvested_at: Option<i64>,
    pub device_installed: bool,
}

impl PlantingCycle {
    /// Whole days since planting, counted up to harvest once harvested.
    pub fn days_after_planting(&self, now: i64) -> i64 {
        let until = self.harvested_at.unwrap_or(now);
        (until - self.planted_at).max(0) / 86_400
    }
}

/// Any subset of the four channels a node reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReadingFields {
    pub temperature: Option<f64>,
    pub air_humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub soil_ph: Option<f64>,
}

impl ReadingFields {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.air_humidity.is_none()
            && self.soil_moisture.is_none()
            && self.soil_ph.is_none()
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SensorReading {
    pub id: i64,
    pub cycle_id: i64,
    pub measured_at: i64,
    pub temperature: Option<f64>,
    pub air_humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub soil_ph: Option<f64>,
}

/// Mean of each feature over a window. A field is `None` when no reading in
/// the window carried it.
#[derive(Debug, Clone, Copy, PartialEq, FromRow)]
pub struct FeatureAverages {
    pub samples: i64,
    pub temperature: Option<f64>,
    pub air_humidity: Option<f64>,
    pub soil_moisture: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewRecommendation {
    pub cycle_id: i64,
    pub activate: bool,
    pub duration_sec: i64,
    pub condition_id: i64,
    pub suggestion_id: i64,
    pub recommended_at: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Recommendation {
    pub id: i64,
    pub cycle_id: i64,
    pub activate: bool,
    pub duration_sec: i64,
    pub condition_id: i64,
    pub suggestion_id: i64,
    pub recommended_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub kind: DeviceKind,
    pub recommendation_id: Option<i64>,
    pub mode: CommandMode,
    pub scheduled_start: i64,
    pub duration_sec: i64,
    pub volume_liters: f64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct QueuedCommand {
    pub id: i64,
    pub kind: DeviceKind,
    pub recommendation_id: Option<i64>,
    pub mode: CommandMode,
    pub scheduled_start: i64,
    pub duration_sec: i64,
    pub computed_end: i64,
    pub volume_liters: f64,
    pub will_send: bool,
    pub is_sent: bool,
}

impl QueuedCommand {
    pub fn is_pending(&self) -> bool {
        self.will_send && !self.is_sent
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ActionLogEntry {
    pub id: i64,
    pub cycle_id: Option<i64>,
    pub kind: DeviceKind,
    pub command_id: i64,
    pub duration_sec: i64,
    pub running: bool,
    pub started_at: i64,
    pub stopped_at: Option<i64>,
}

/// Contents of the single-slot `actuation_slot` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Actuation {
    Idle,
    Running {
        kind: DeviceKind,
        log_id: i64,
        command_id: i64,
        ends_at: i64,
    },
}

#[derive(FromRow)]
struct SlotRow {
    kind: Option<DeviceKind>,
    log_id: Option<i64>,
    command_id: Option<i64>,
    ends_at: Option<i64>,
}

impl From<SlotRow> for Actuation {
    fn from(r: SlotRow) -> Self {
        match (r.kind, r.log_id, r.command_id, r.ends_at) {
            (Some(kind), Some(log_id), Some(command_id), Some(ends_at)) => Actuation::Running {
                kind,
                log_id,
                command_id,
                ends_at,
            },
            _ => Actuation::Idle,
        }
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/agri-hub/hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Planting cycles
    // ----------------------------

    pub async fn upsert_cycle(&self, c: &PlantingCycle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO planting_cycles (cycle_id, name, planted_at, harvested_at, device_installed)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(cycle_id) DO UPDATE SET
              name=excluded.name,
              planted_at=excluded.planted_at,
              harvested_at=excluded.harvested_at,
              device_installed=excluded.device_installed
            "#,
        )
        .bind(c.cycle_id)
        .bind(&c.name)
        .bind(c.planted_at)
        .bind(c.harvested_at)
        .bind(c.device_installed)
        .execute(&self.pool)
        .await
        .context("upsert_cycle failed")?;
        Ok(())
    }

    pub async fn load_cycles(&self) -> Result<Vec<PlantingCycle>> {
        sqlx::query_as::<_, PlantingCycle>(
            r#"
            SELECT cycle_id, name, planted_at, harvested_at, device_installed
            FROM planting_cycles
            ORDER BY cycle_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_cycles failed")
    }

    /// The cycle the field device is currently installed on, if any.
    pub async fn active_cycle(&self) -> Result<Option<PlantingCycle>> {
        sqlx::query_as::<_, PlantingCycle>(
            r#"
            SELECT cycle_id, name, planted_at, harvested_at, device_installed
            FROM planting_cycles
            WHERE device_installed = 1
            ORDER BY cycle_id
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("active_cycle failed")
    }

    // ----------------------------
    // Readings + aggregation
    // ----------------------------

    /// Insert or merge the reading for `(cycle_id, measured_at)`. Fields that
    /// are `None` keep whatever an earlier uplink stored for that minute.
    pub async fn upsert_reading(
        &self,
        cycle_id: i64,
        measured_at: i64,
        f: &ReadingFields,
    ) -> Result<SensorReading> {
        sqlx::query_as::<_, SensorReading>(
            r#"
            INSERT INTO sensor_readings
              (cycle_id, measured_at, temperature, air_humidity, soil_moisture, soil_ph)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(cycle_id, measured_at) DO UPDATE SET
              temperature   = COALESCE(excluded.temperature,   temperature),
              air_humidity  = COALESCE(excluded.air_humidity,  air_humidity),
              soil_moisture = COALESCE(excluded.soil_moisture, soil_moisture),
              soil_ph       = COALESCE(excluded.soil_ph,       soil_ph)
            RETURNING id, cycle_id, measured_at, temperature, air_humidity, soil_moisture, soil_ph
            "#,
        )
        .bind(cycle_id)
        .bind(measured_at)
        .bind(f.temperature)
        .bind(f.air_humidity)
        .bind(f.soil_moisture)
        .bind(f.soil_ph)
        .fetch_one(&self.pool)
        .await
        .context("upsert_reading failed")
    }

    /// Averages over `from..=to`. `None` when the window has no readings.
    pub async fn average_readings(
        &self,
        cycle_id: i64,
        from: i64,
        to: i64,
    ) -> Result<Option<FeatureAverages>> {
        let avg = sqlx::query_as::<_, FeatureAverages>(
            r#"
            SELECT COUNT(*)           AS samples,
                   AVG(temperature)   AS temperature,
                   AVG(air_humidity)  AS air_humidity,
                   AVG(soil_moisture) AS soil_moisture
            FROM sensor_readings
            WHERE cycle_id = ? AND measured_at >= ? AND measured_at <= ?
            "#,
        )
        .bind(cycle_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .context("average_readings failed")?;

        Ok((avg.samples > 0).then_some(avg))
    }

    pub async fn insert_prediction(
        &self,
        cycle_id: i64,
        temperature: f64,
        air_humidity: f64,
        soil_moisture: f64,
        predicted_for: i64,
        created_at: i64,
    ) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO sensor_predictions
              (cycle_id, temperature, air_humidity, soil_moisture, predicted_for, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(cycle_id)
        .bind(temperature)
        .bind(air_humidity)
        .bind(soil_moisture)
        .bind(predicted_for)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("insert_prediction failed")?;
        Ok(res.last_insert_rowid())
    }

    // ----------------------------
    // Messages + recommendations
    // ----------------------------

    /// Identical advisory text always maps to the same row.
    pub async fn get_or_create_message(&self, text: &str) -> Result<i64> {
        sqlx::query("INSERT INTO messages (text) VALUES (?) ON CONFLICT(text) DO NOTHING")
            .bind(text)
            .execute(&self.pool)
            .await
            .context("get_or_create_message insert failed")?;

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM messages WHERE text = ?")
            .bind(text)
            .fetch_one(&self.pool)
            .await
            .context("get_or_create_message lookup failed")?;
        Ok(id)
    }

    pub async fn message_text(&self, id: i64) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT text FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("message_text failed")?;
        Ok(row.map(|r| r.0))
    }

    pub async fn insert_recommendation(&self, r: &NewRecommendation) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO recommendations
              (cycle_id, activate, duration_sec, condition_id, suggestion_id, recommended_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.cycle_id)
        .bind(r.activate)
        .bind(r.duration_sec)
        .bind(r.condition_id)
        .bind(r.suggestion_id)
        .bind(r.recommended_at)
        .execute(&self.pool)
        .await
        .context("insert_recommendation failed")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn recent_recommendations(&self, limit: i64) -> Result<Vec<Recommendation>> {
        sqlx::query_as::<_, Recommendation>(
            r#"
            SELECT id, cycle_id, activate, duration_sec, condition_id, suggestion_id, recommended_at
            FROM recommendations
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_recommendations failed")
    }

    // ----------------------------
    // Command queue
    // ----------------------------

    pub async fn enqueue_command(&self, c: &NewCommand) -> Result<i64> {
        let computed_end = c
            .scheduled_start
            .checked_add(c.duration_sec)
            .with_context(|| format!("duration {}s overflows the schedule", c.duration_sec))?;
        let res = sqlx::query(
            r#"
            INSERT INTO command_queue
              (kind, recommendation_id, mode, scheduled_start, duration_sec,
               computed_end, volume_liters, will_send, is_sent)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, 0)
            "#,
        )
        .bind(c.kind)
        .bind(c.recommendation_id)
        .bind(c.mode)
        .bind(c.scheduled_start)
        .bind(c.duration_sec)
        .bind(computed_end)
        .bind(c.volume_liters)
        .execute(&self.pool)
        .await
        .context("enqueue_command failed")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn get_command(&self, id: i64) -> Result<Option<QueuedCommand>> {
        sqlx::query_as::<_, QueuedCommand>(
            r#"
            SELECT id, kind, recommendation_id, mode, scheduled_start, duration_sec,
                   computed_end, volume_liters, will_send, is_sent
            FROM command_queue
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_command failed")
    }

    /// Oldest pending command of `kind` whose start minute lies in
    /// `[from_minute, to_minute]`.
    pub async fn due_command(
        &self,
        kind: DeviceKind,
        from_minute: i64,
        to_minute: i64,
    ) -> Result<Option<QueuedCommand>> {
        sqlx::query_as::<_, QueuedCommand>(
            r#"
            SELECT id, kind, recommendation_id, mode, scheduled_start, duration_sec,
                   computed_end, volume_liters, will_send, is_sent
            FROM command_queue
            WHERE kind = ?
              AND will_send = 1 AND is_sent = 0
              AND scheduled_start - (scheduled_start % 60) BETWEEN ? AND ?
            ORDER BY scheduled_start, id
            LIMIT 1
            "#,
        )
        .bind(kind)
        .bind(from_minute)
        .bind(to_minute)
        .fetch_optional(&self.pool)
        .await
        .context("due_command failed")
    }

    pub async fn recent_commands(
        &self,
        kind: Option<DeviceKind>,
        limit: i64,
    ) -> Result<Vec<QueuedCommand>> {
        sqlx::query_as::<_, QueuedCommand>(
            r#"
            SELECT id, kind, recommendation_id, mode, scheduled_start, duration_sec,
                   computed_end, volume_liters, will_send, is_sent
            FROM command_queue
            WHERE ? IS NULL OR kind = ?
            ORDER BY scheduled_start DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(kind)
        .bind(kind)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_commands failed")
    }

    // ----------------------------
    // Action log + actuation slot
    // ----------------------------

    pub async fn current_actuation(&self) -> Result<Actuation> {
        let row = sqlx::query_as::<_, SlotRow>(
            "SELECT kind, log_id, command_id, ends_at FROM actuation_slot WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("current_actuation failed")?;
        Ok(row.map(Actuation::from).unwrap_or(Actuation::Idle))
    }

    /// Record that the on-command for `cmd` went out: flip `is_sent`, open an
    /// action-log episode and claim the slot, all or nothing. Returns `None`
    /// (and writes nothing) when the command is no longer pending or the slot
    /// is already taken.
    pub async fn begin_actuation(
        &self,
        cmd: &QueuedCommand,
        cycle_id: Option<i64>,
        now: i64,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await.context("begin_actuation: begin failed")?;

        let sent = sqlx::query(
            "UPDATE command_queue SET is_sent = 1 WHERE id = ? AND will_send = 1 AND is_sent = 0",
        )
        .bind(cmd.id)
        .execute(&mut *tx)
        .await
        .context("begin_actuation: mark sent failed")?;
        if sent.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let log_id = sqlx::query(
            r#"
            INSERT INTO action_log (cycle_id, kind, command_id, duration_sec, running, started_at)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(cycle_id)
        .bind(cmd.kind)
        .bind(cmd.id)
        .bind(cmd.duration_sec)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("begin_actuation: insert action_log failed")?
        .last_insert_rowid();

        let claimed = sqlx::query(
            r#"
            UPDATE actuation_slot
            SET kind = ?, log_id = ?, command_id = ?, ends_at = ?
            WHERE id = 1 AND kind IS NULL
            "#,
        )
        .bind(cmd.kind)
        .bind(log_id)
        .bind(cmd.id)
        .bind(cmd.computed_end)
        .execute(&mut *tx)
        .await
        .context("begin_actuation: claim slot failed")?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }

        tx.commit().await.context("begin_actuation: commit failed")?;
        Ok(Some(log_id))
    }

    /// Close the running episode `log_id` and free the slot.
    pub async fn end_actuation(&self, log_id: i64, now: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.context("end_actuation: begin failed")?;

        sqlx::query("UPDATE action_log SET running = 0, stopped_at = ? WHERE id = ? AND running = 1")
            .bind(now)
            .bind(log_id)
            .execute(&mut *tx)
            .await
            .context("end_actuation: update action_log failed")?;

        sqlx::query(
            r#"
            UPDATE actuation_slot
            SET kind = NULL, log_id = NULL, command_id = NULL, ends_at = NULL
            WHERE id = 1 AND log_id = ?
            "#,
        )
        .bind(log_id)
        .execute(&mut *tx)
        .await
        .context("end_actuation: release slot failed")?;

        tx.commit().await.context("end_actuation: commit failed")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn running_action_count(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM action_log WHERE running = 1")
            .fetch_one(&self.pool)
            .await
            .context("running_action_count failed")?;
        Ok(n)
    }

    pub async fn actions_for_command(&self, command_id: i64) -> Result<Vec<ActionLogEntry>> {
        sqlx::query_as::<_, ActionLogEntry>(
            r#"
            SELECT id, cycle_id, kind, command_id, duration_sec, running, started_at, stopped_at
            FROM action_log
            WHERE command_id = ?
            ORDER BY id
            "#,
        )
        .bind(command_id)
        .fetch_all(&self.pool)
        .await
        .context("actions_for_command failed")
    }

    pub async fn recent_actions(&self, limit: i64) -> Result<Vec<ActionLogEntry>> {
        sqlx::query_as::<_, ActionLogEntry>(
            r#"
            SELECT id, cycle_id, kind, command_id, duration_sec, running, started_at, stopped_at
            FROM action_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_actions failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    pub(crate) fn test_cycle() -> PlantingCycle {
        PlantingCycle {
            cycle_id: 1,
            name: "Chili, bed A".into(),
            planted_at: 1_714_000_000,
            harvested_at: None,
            device_installed: true,
        }
    }

    fn command(kind: DeviceKind, start: i64, duration_sec: i64) -> NewCommand {
        NewCommand {
            kind,
            recommendation_id: None,
            mode: CommandMode::Auto,
            scheduled_start: start,
            duration_sec,
            volume_liters: 0.0,
        }
    }

    #[tokio::test]
    async fn message_get_or_create_is_deduplicated() {
        let db = test_db().await;
        let a = db.get_or_create_message("Soil too dry").await.unwrap();
        let b = db.get_or_create_message("Soil too dry").await.unwrap();
        let c = db.get_or_create_message("Soil is fine").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(db.message_text(a).await.unwrap().as_deref(), Some("Soil too dry"));
    }

    #[tokio::test]
    async fn reading_upsert_merges_partial_uplinks() {
        let db = test_db().await;
        db.upsert_cycle(&test_cycle()).await.unwrap();

        let first = ReadingFields {
            temperature: Some(29.0),
            air_humidity: Some(70.0),
            ..Default::default()
        };
        let second = ReadingFields {
            soil_moisture: Some(55.0),
            air_humidity: Some(72.0),
            ..Default::default()
        };
        db.upsert_reading(1, 1_714_543_200, &first).await.unwrap();
        let merged = db.upsert_reading(1, 1_714_543_200, &second).await.unwrap();

        assert_eq!(merged.temperature, Some(29.0));
        assert_eq!(merged.air_humidity, Some(72.0));
        assert_eq!(merged.soil_moisture, Some(55.0));
        assert_eq!(merged.soil_ph, None);

        let avg = db
            .average_readings(1, 1_714_543_200, 1_714_543_200)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(avg.samples, 1, "same minute must stay one row");
    }

    #[tokio::test]
    async fn average_of_empty_window_is_none() {
        let db = test_db().await;
        db.upsert_cycle(&test_cycle()).await.unwrap();
        assert!(db.average_readings(1, 0, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn active_cycle_requires_installed_device() {
        let db = test_db().await;
        assert!(db.active_cycle().await.unwrap().is_none());
        db.upsert_cycle(&PlantingCycle {
            device_installed: false,
            ..test_cycle()
        })
        .await
        .unwrap();
        assert!(db.active_cycle().await.unwrap().is_none());
        db.upsert_cycle(&test_cycle()).await.unwrap();
        assert_eq!(db.active_cycle().await.unwrap().unwrap().cycle_id, 1);
    }

    #[test]
    fn days_after_planting_stops_at_harvest() {
        let mut c = test_cycle();
        assert_eq!(c.days_after_planting(c.planted_at + 3 * 86_400 + 10), 3);
        c.harvested_at = Some(c.planted_at + 86_400);
        assert_eq!(c.days_after_planting(c.planted_at + 30 * 86_400), 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_overflowing_duration() {
        let db = test_db().await;
        let err = db
            .enqueue_command(&command(DeviceKind::Irrigation, 1_000_020, i64::MAX))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("overflows"));
        assert!(db.recent_commands(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_computes_end() {
        let db = test_db().await;
        let id = db
            .enqueue_command(&command(DeviceKind::Irrigation, 1_000_020, 600))
            .await
            .unwrap();
        let cmd = db.get_command(id).await.unwrap().unwrap();
        assert_eq!(cmd.computed_end, 1_000_620);
        assert!(cmd.is_pending());
        assert_eq!(cmd.mode, CommandMode::Auto);
    }

    #[tokio::test]
    async fn due_command_matches_start_minute_and_kind() {
        let db = test_db().await;
        let minute = 1_714_543_200;
        let id = db
            .enqueue_command(&command(DeviceKind::Irrigation, minute + 42, 600))
            .await
            .unwrap();

        let hit = db.due_command(DeviceKind::Irrigation, minute, minute).await.unwrap();
        assert_eq!(hit.map(|c| c.id), Some(id));

        let other_kind = db.due_command(DeviceKind::Fertilizer, minute, minute).await.unwrap();
        assert!(other_kind.is_none());

        let next_minute = db
            .due_command(DeviceKind::Irrigation, minute + 60, minute + 60)
            .await
            .unwrap();
        assert!(next_minute.is_none());
    }

    #[tokio::test]
    async fn slot_admits_one_actuation_at_a_time() {
        let db = test_db().await;
        let a = db
            .enqueue_command(&command(DeviceKind::Irrigation, 1_000_020, 600))
            .await
            .unwrap();
        let b = db
            .enqueue_command(&command(DeviceKind::Fertilizer, 1_000_020, 600))
            .await
            .unwrap();
        let a = db.get_command(a).await.unwrap().unwrap();
        let b = db.get_command(b).await.unwrap().unwrap();

        let log_a = db.begin_actuation(&a, None, 1_000_020).await.unwrap();
        assert!(log_a.is_some());

        // Slot taken: nothing about `b` may change.
        assert!(db.begin_actuation(&b, None, 1_000_020).await.unwrap().is_none());
        assert!(db.get_command(b.id).await.unwrap().unwrap().is_pending());
        assert_eq!(db.running_action_count().await.unwrap(), 1);

        match db.current_actuation().await.unwrap() {
            Actuation::Running { kind, command_id, ends_at, .. } => {
                assert_eq!(kind, DeviceKind::Irrigation);
                assert_eq!(command_id, a.id);
                assert_eq!(ends_at, 1_000_620);
            }
            Actuation::Idle => panic!("slot should be running"),
        }

        db.end_actuation(log_a.unwrap(), 1_000_620).await.unwrap();
        assert_eq!(db.current_actuation().await.unwrap(), Actuation::Idle);
        assert_eq!(db.running_action_count().await.unwrap(), 0);

        let entries = db.actions_for_command(a.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stopped_at, Some(1_000_620));
    }

    #[tokio::test]
    async fn begin_actuation_twice_is_noop() {
        let db = test_db().await;
        let id = db
            .enqueue_command(&command(DeviceKind::Irrigation, 1_000_020, 600))
            .await
            .unwrap();
        let cmd = db.get_command(id).await.unwrap().unwrap();
        let first = db.begin_actuation(&cmd, None, 1_000_020).await.unwrap().unwrap();
        db.end_actuation(first, 1_000_620).await.unwrap();

        // Already sent: a stale copy of the row must not reopen it.
        assert!(db.begin_actuation(&cmd, None, 1_000_700).await.unwrap().is_none());
        assert_eq!(db.actions_for_command(id).await.unwrap().len(), 1);
    }
}
