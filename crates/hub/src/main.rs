mod clock;
mod config;
mod db;
mod downlink;
mod ingest;
mod ml;
mod producer;
mod scheduler;
mod state;
mod web;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::{Db, DeviceKind};
use downlink::AntaresClient;
use ml::MlClient;
use producer::Producer;
use scheduler::Scheduler;
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:agri-hub.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (endpoints, device codes, planting cycles) ──────
    let mut cfg = config::load(&config_path)?;
    if let Ok(key) = env::var("ANTARES_ACCESS_KEY") {
        cfg.antares.access_key = key;
    }
    config::apply(&cfg, &db).await?;

    // The database is the source of truth from here on.
    let cycles = db.load_cycles().await?;
    match cycles.iter().find(|c| c.device_installed) {
        Some(c) => info!(
            cycles = cycles.len(),
            cycle_id = c.cycle_id,
            name = %c.name,
            "db ready, active planting cycle found"
        ),
        None => warn!(
            cycles = cycles.len(),
            "no planting cycle has device_installed = true; telemetry will be ignored"
        ),
    }

    // ── Outbound clients ────────────────────────────────────────────
    let timeout = Duration::from_secs(cfg.schedule.http_timeout_sec);
    let downlink = Arc::new(AntaresClient::new(&cfg.antares, timeout)?);
    let recommender = Arc::new(MlClient::new(&cfg.ml, timeout)?);

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    let scheduler = Scheduler::new(
        db.clone(),
        downlink,
        cfg.device.clone(),
        cfg.schedule.missed_window_grace_min,
        shared.clone(),
    );
    let producer = Producer::new(db.clone(), recommender.clone(), &cfg.schedule)?;

    // ── Background jobs ─────────────────────────────────────────────
    if cfg.schedule.enabled {
        for kind in [DeviceKind::Irrigation, DeviceKind::Fertilizer] {
            tokio::spawn(scheduler::run(scheduler.clone(), kind));
        }
        tokio::spawn(producer::run(producer.clone(), shared.clone()));
    } else {
        warn!("schedule.enabled = false; only manual triggers will run");
    }

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        db,
        shared,
        scheduler,
        producer,
        recommender,
        codes: cfg.device.clone(),
        flow_rate_lpm: cfg.schedule.flow_rate_lpm,
        offset: cfg.schedule.utc_offset()?,
    };
    web::serve(app, web_port).await
}
