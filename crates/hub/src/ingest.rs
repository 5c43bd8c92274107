use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::minute_floor;
use crate::db::{Db, ReadingFields, SensorReading};

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06).
pub const GPS_EPOCH_OFFSET: i64 = 315_964_800;

const CONTENT_POINTER: &str = "/m2m:sgn/m2m:nev/m2m:rep/m2m:cin/con";

// ---------------------------------------------------------------------------
// Uplink payload types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Radio {
    pub(crate) gps_time: Option<i64>,
}

/// Decoded `con` string of an Antares content instance.
#[derive(Debug, Deserialize)]
pub(crate) struct Uplink {
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) data: String,
    pub(crate) radio: Option<Radio>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TelemetryError {
    #[error("content is not valid JSON: {0}")]
    Content(String),
    #[error("item {0:?} has no ':' separator")]
    MissingSeparator(String),
    #[error("value {value:?} for {key} is not a number")]
    NotNumeric { key: String, value: String },
    #[error("no known telemetry keys in {0:?}")]
    NoKnownKeys(String),
}

impl TelemetryError {
    /// Field the error is reported under in a validation response.
    pub fn field(&self) -> &'static str {
        match self {
            TelemetryError::Content(_) => "con",
            _ => "data",
        }
    }
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// Nothing to store; the reason is logged and echoed to the caller.
    Ignored(&'static str),
    Rejected(TelemetryError),
    Stored(SensorReading),
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// GPS milliseconds to Unix seconds. Leap seconds are not corrected.
pub fn gps_to_unix(gps_ms: i64) -> i64 {
    gps_ms.div_euclid(1000) + GPS_EPOCH_OFFSET
}

/// Pull the `con` string out of the notification envelope.
pub(crate) fn extract_content(body: &Value) -> Option<&str> {
    body.pointer(CONTENT_POINTER).and_then(Value::as_str)
}

/// Parse `"Temp:29.1,Hum:75,Soil:68,pH:6.5"`. Unknown keys are skipped, but
/// at least one known key must be present.
pub fn parse_telemetry(data: &str) -> Result<ReadingFields, TelemetryError> {
    let mut fields = ReadingFields::default();

    for item in data.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = item
            .split_once(':')
            .ok_or_else(|| TelemetryError::MissingSeparator(item.to_string()))?;
        let (key, value) = (key.trim(), value.trim());

        let slot = match key {
            "Temp" => &mut fields.temperature,
            "Hum" => &mut fields.air_humidity,
            "Soil" => &mut fields.soil_moisture,
            "pH" => &mut fields.soil_ph,
            _ => {
                debug!(key, "skipping unknown telemetry key");
                continue;
            }
        };
        let parsed = value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| TelemetryError::NotNumeric {
                key: key.to_string(),
                value: value.to_string(),
            })?;
        *slot = Some(parsed);
    }

    if fields.is_empty() {
        return Err(TelemetryError::NoKnownKeys(data.to_string()));
    }
    Ok(fields)
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Handle one webhook notification. `now` stands in for the measurement time
/// when the uplink carries no GPS timestamp.
pub async fn ingest(db: &Db, body: &Value, now: i64) -> Result<IngestOutcome> {
    let Some(con) = extract_content(body) else {
        return Ok(IngestOutcome::Ignored("no content instance"));
    };

    let uplink: Uplink = match serde_json::from_str(con) {
        Ok(u) => u,
        Err(e) => return Ok(IngestOutcome::Rejected(TelemetryError::Content(e.to_string()))),
    };
    if uplink.kind != "uplink" {
        return Ok(IngestOutcome::Ignored("not an uplink"));
    }

    let fields = match parse_telemetry(&uplink.data) {
        Ok(f) => f,
        Err(e) => return Ok(IngestOutcome::Rejected(e)),
    };

    let measured_at = uplink
        .radio
        .and_then(|r| r.gps_time)
        .map(gps_to_unix)
        .unwrap_or(now);

    let Some(cycle) = db.active_cycle().await? else {
        return Ok(IngestOutcome::Ignored("no active planting cycle"));
    };

    let reading = db
        .upsert_reading(cycle.cycle_id, minute_floor(measured_at), &fields)
        .await?;
    info!(
        cycle_id = cycle.cycle_id,
        measured_at = reading.measured_at,
        temperature = ?reading.temperature,
        soil_moisture = ?reading.soil_moisture,
        "stored sensor reading"
    );
    Ok(IngestOutcome::Stored(reading))
}

// ===========================================================================
// Tests
// ===========================================================================
