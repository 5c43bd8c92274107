//! TOML config file loading, validation, and database seeding for planting
//! cycles. Also carries gateway, ML and device-code settings.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use time::UtcOffset;

use crate::clock;
use crate::db::{Db, PlantingCycle};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub antares: AntaresConfig,
    pub ml: MlConfig,
    pub device: DeviceCodes,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub planting_cycles: Vec<CycleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AntaresConfig {
    /// Full container URL the downlink content instance is POSTed to.
    pub url: String,
    /// `X-M2M-Origin` value. `ANTARES_ACCESS_KEY` overrides it at startup.
    #[serde(default)]
    pub access_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MlConfig {
    pub base_url: String,
}

/// How an actuation's duration reaches the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationEncoding {
    /// The on-code carries no duration; the hub sends the off-code at the end.
    #[default]
    None,
    /// The on-code is suffixed with the duration in seconds.
    AppendSeconds,
}

/// Code fragments the downlink code is assembled from: a per-device prefix
/// followed by an on/off suffix.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodes {
    pub water_code: String,
    pub fertilizer_code: String,
    pub on_code: String,
    pub off_code: String,
    #[serde(default)]
    pub duration_encoding: DurationEncoding,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Delay between an hourly recommendation and its queued start.
    pub lead_time_sec: i64,
    /// How many minutes after its start a pending command may still be sent.
    /// Zero means a command is only ever sent in its own start minute.
    pub missed_window_grace_min: i64,
    /// Valve flow rate, used for the volume estimate on queued commands.
    pub flow_rate_lpm: f64,
    /// Local timezone of the farm (hours east of UTC).
    pub utc_offset_hours: i8,
    pub http_timeout_sec: u64,
    /// Run the per-minute and hourly jobs in-process.
    pub enabled: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            lead_time_sec: 60,
            missed_window_grace_min: 0,
            flow_rate_lpm: 7.0,
            utc_offset_hours: 7,
            http_timeout_sec: 10,
            enabled: true,
        }
    }
}

impl ScheduleConfig {
    pub fn utc_offset(&self) -> Result<UtcOffset> {
        clock::utc_offset_from_hours(self.utc_offset_hours)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CycleEntry {
    pub cycle_id: i64,
    pub name: String,
    /// Local time, `YYYY-MM-DD HH:MM[:SS]`.
    pub planted_at: String,
    #[serde(default)]
    pub harvested_at: Option<String>,
    #[serde(default)]
    pub device_installed: bool,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_endpoints(&mut errors);
        self.validate_device(&mut errors);
        self.validate_schedule(&mut errors);
        self.validate_cycles(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_endpoints(&self, errors: &mut Vec<String>) {
        for (name, url) in [("antares.url", &self.antares.url), ("ml.base_url", &self.ml.base_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("{name}: expected an http(s) URL, got {url:?}"));
            }
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        for (name, code) in [
            ("water_code", &d.water_code),
            ("fertilizer_code", &d.fertilizer_code),
            ("on_code", &d.on_code),
            ("off_code", &d.off_code),
        ] {
            if code.trim().is_empty() {
                errors.push(format!("device.{name} is empty"));
            }
        }
        if d.water_code == d.fertilizer_code {
            errors.push(format!(
                "device.water_code and device.fertilizer_code are both {:?}",
                d.water_code
            ));
        }
        if d.on_code == d.off_code {
            errors.push(format!(
                "device.on_code and device.off_code are both {:?}",
                d.on_code
            ));
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        let s = &self.schedule;
        if s.lead_time_sec < 60 {
            errors.push(format!(
                "schedule.lead_time_sec must be at least 60, got {}",
                s.lead_time_sec
            ));
        }
        if s.missed_window_grace_min < 0 {
            errors.push(format!(
                "schedule.missed_window_grace_min must not be negative, got {}",
                s.missed_window_grace_min
            ));
        }
        if s.flow_rate_lpm <= 0.0 {
            errors.push(format!(
                "schedule.flow_rate_lpm must be positive, got {}",
                s.flow_rate_lpm
            ));
        }
        if !(-12..=14).contains(&s.utc_offset_hours) {
            errors.push(format!(
                "schedule.utc_offset_hours {} out of range [-12, 14]",
                s.utc_offset_hours
            ));
        }
        if s.http_timeout_sec == 0 {
            errors.push("schedule.http_timeout_sec must be positive".to_string());
        }
    }

    fn validate_cycles(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<i64> = HashSet::new();
        let offset = self.schedule.utc_offset().ok();
        let installed = self.planting_cycles.iter().filter(|c| c.device_installed).count();

        if installed > 1 {
            errors.push(format!(
                "{installed} planting cycles have device_installed = true; at most one may"
            ));
        }

        for c in &self.planting_cycles {
            let ctx = format!("planting cycle {}", c.cycle_id);

            if !seen_ids.insert(c.cycle_id) {
                errors.push(format!("{ctx}: duplicate cycle_id"));
            }
            if c.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            let Some(offset) = offset else { continue };
            let planted = clock::parse_local(&c.planted_at, offset);
            if planted.is_err() {
                errors.push(format!("{ctx}: planted_at {:?} is not a local timestamp", c.planted_at));
            }
            if let Some(h) = &c.harvested_at {
                match (clock::parse_local(h, offset), planted) {
                    (Err(_), _) => errors.push(format!(
                        "{ctx}: harvested_at {h:?} is not a local timestamp"
                    )),
                    (Ok(harvested), Ok(planted)) if harvested < planted => {
                        errors.push(format!("{ctx}: harvested_at is before planted_at"))
                    }
                    _ => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Upsert all planting cycles from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    let offset = config.schedule.utc_offset()?;

    for c in &config.planting_cycles {
        let planted_at = clock::parse_local(&c.planted_at, offset)?;
        let harvested_at = c
            .harvested_at
            .as_deref()
            .map(|h| clock::parse_local(h, offset))
            .transpose()?;

        db.upsert_cycle(&PlantingCycle {
            cycle_id: c.cycle_id,
            name: c.name.clone(),
            planted_at,
            harvested_at,
            device_installed: c.device_installed,
        })
        .await
        .with_context(|| format!("failed to upsert planting cycle {}", c.cycle_id))?;
    }

    tracing::info!(planting_cycles = config.planting_cycles.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
