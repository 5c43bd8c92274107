use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::db::{Actuation, DeviceKind, SensorReading};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub last_reading: Option<SensorReading>,
    pub last_reading_at: Option<OffsetDateTime>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Recommendation,
    Downlink,
    Scheduler,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub actuation: Actuation,
    pub last_reading: Option<SensorReading>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reading_at: Option<OffsetDateTime>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_reading: None,
            last_reading_at: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a stored telemetry reading.
    pub fn record_reading(&mut self, reading: &SensorReading) {
        let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v}"));
        self.push_event(
            EventKind::Reading,
            format!(
                "cycle {}: temp={} hum={} soil={} ph={}",
                reading.cycle_id,
                fmt(reading.temperature),
                fmt(reading.air_humidity),
                fmt(reading.soil_moisture),
                fmt(reading.soil_ph),
            ),
        );
        self.last_reading = Some(reading.clone());
        self.last_reading_at = Some(OffsetDateTime::now_utc());
    }

    pub fn record_recommendation(&mut self, detail: String) {
        self.push_event(EventKind::Recommendation, detail);
    }

    /// Record a downlink attempt and its gateway status (`None` when the
    /// request never got an answer).
    pub fn record_downlink(&mut self, kind: Option<DeviceKind>, code: &str, status: Option<u16>) {
        let target = kind.map_or("manual", DeviceKind::as_str);
        let status = status.map_or_else(|| "no response".to_string(), |s| s.to_string());
        self.push_event(EventKind::Downlink, format!("{target}: sent {code} ({status})"));
    }

    pub fn record_scheduler(&mut self, detail: String) {
        self.push_event(EventKind::Scheduler, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest event first.
    pub fn to_status(&self, actuation: Actuation) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            actuation,
            last_reading: self.last_reading.clone(),
            last_reading_at: self.last_reading_at,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> SensorReading {
        SensorReading {
            id: 1,
            cycle_id: 1,
            measured_at: 1_714_543_200,
            temperature: Some(29.5),
            air_humidity: None,
            soil_moisture: Some(40.0),
            soil_ph: None,
        }
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = SystemState::new();
        st.record_system("first".into());
        st.record_error("second".into());
        let status = st.to_status(Actuation::Idle);
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[0].kind, EventKind::Error);
        assert_eq!(status.events[1].detail, "first");
    }

    #[test]
    fn record_reading_updates_last_reading() {
        let mut st = SystemState::new();
        st.record_reading(&reading());
        assert_eq!(st.last_reading.as_ref().map(|r| r.measured_at), Some(1_714_543_200));
        assert!(st.last_reading_at.is_some());
        assert_eq!(st.events[0].detail, "cycle 1: temp=29.5 hum=- soil=40 ph=-");
    }

    #[test]
    fn downlink_event_mentions_status() {
        let mut st = SystemState::new();
        st.record_downlink(Some(DeviceKind::Irrigation), "A1", Some(201));
        st.record_downlink(None, "B0", None);
        assert_eq!(st.events[0].detail, "irrigation: sent A1 (201)");
        assert_eq!(st.events[1].detail, "manual: sent B0 (no response)");
    }

    #[test]
    fn status_serializes_slot_and_events() {
        let mut st = SystemState::new();
        st.record_scheduler("tick".into());
        let json = serde_json::to_value(st.to_status(Actuation::Idle)).unwrap();
        assert_eq!(json["actuation"]["state"], "idle");
        assert_eq!(json["events"][0]["kind"], "scheduler");
        assert!(json["last_reading_at"].is_null());
    }
}
