//! Client for the recommendation (ML) microservice.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MlConfig;

#[derive(Debug, thiserror::Error)]
pub enum MlError {
    #[error("ML service returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("ML service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected ML service response: {0}")]
    Decode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Feature vector the irrigation and forecast endpoints take.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Features {
    #[serde(rename = "SoilMoisture")]
    pub soil_moisture: f64,
    #[serde(rename = "Humidity")]
    pub humidity: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    #[serde(rename = "nyala", deserialize_with = "de_flag")]
    pub activate: bool,
    #[serde(rename = "waktu", deserialize_with = "de_seconds")]
    pub duration_sec: i64,
}

/// Irrigation decision plus the two advisory strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrrigationAdvice {
    #[serde(rename = "Kondisi")]
    pub condition: String,
    #[serde(rename = "Saran")]
    pub suggestion: String,
    #[serde(rename = "Informasi Kluster")]
    pub cluster: ClusterInfo,
}

/// Forecast features plus the local timestamp they are forecast for.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Forecast {
    pub temperature: f64,
    #[serde(rename = "Humidity")]
    pub humidity: f64,
    #[serde(rename = "SoilMoisture")]
    pub soil_moisture: f64,
    #[serde(rename = "Time")]
    pub time: String,
}

impl Forecast {
    pub fn features(&self) -> Features {
        Features {
            soil_moisture: self.soil_moisture,
            humidity: self.humidity,
            temperature: self.temperature,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FertilizerQuery {
    pub tinggi_tanaman: f64,
    pub hst: i64,
}

/// `nyala` shows up as a bool, 0/1, or a string depending on model version.
fn de_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "nyala" => Ok(true),
            "false" | "0" | "off" | "mati" | "" => Ok(false),
            other => Err(de::Error::custom(format!("unrecognised flag {other:?}"))),
        },
        other => Err(de::Error::custom(format!("expected a flag, got {other}"))),
    }
}

/// Longest actuation the service may ask for: one day.
pub const MAX_DURATION_SEC: i64 = 86_400;

fn de_seconds<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let v = f64::deserialize(d)?;
    if !v.is_finite() || v < 0.0 || v > MAX_DURATION_SEC as f64 {
        return Err(de::Error::custom(format!("invalid duration {v}")));
    }
    Ok(v.round() as i64)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Recommender: Send + Sync {
    async fn irrigation(&self, features: &Features) -> Result<IrrigationAdvice, MlError>;
    async fn fertilizer(&self, query: &FertilizerQuery) -> Result<serde_json::Value, MlError>;
    async fn predict(&self, features: &Features) -> Result<Forecast, MlError>;
}

#[derive(Debug, Clone)]
pub struct MlClient {
    http: Client,
    base_url: String,
}

impl MlClient {
    pub fn new(cfg: &MlConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, MlError>
    where
        B: Serialize + Sync + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "calling ML service");

        let resp = self.http.post(&url).json(body).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        if !status.is_success() {
            return Err(MlError::Upstream {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl Recommender for MlClient {
    async fn irrigation(&self, features: &Features) -> Result<IrrigationAdvice, MlError> {
        self.post_json("/penyiraman", features).await
    }

    async fn fertilizer(&self, query: &FertilizerQuery) -> Result<serde_json::Value, MlError> {
        self.post_json("/pemupukan", query).await
    }

    async fn predict(&self, features: &Features) -> Result<Forecast, MlError> {
        self.post_json("/predict", features).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
