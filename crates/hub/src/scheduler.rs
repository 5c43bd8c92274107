//! Actuation scheduler: once a minute per device kind, decides whether to
//! start a queued command, stop the running one, or do nothing.
//!
//! The field device can only run one actuator at a time. Which one (if any)
//! is running lives in the single-row `actuation_slot` table, and every tick
//! holds a process-wide mutex across its read-decide-write sequence so an
//! irrigation tick and a fertilizer tick never interleave.
//!
//! ## Per-kind tick
//!
//! ```text
//! slot Running(other kind) ──▶ Busy
//! slot Running(this kind)  ──[minute(now) <  minute(end)]──▶ StillRunning
//!                          ──[minute(now) >= minute(end)]──▶ send OFF, release ──▶ Stopped
//! slot Idle ──[no due entry]──▶ Nothing
//!           ──[due entry, ON accepted]──▶ mark sent, open log, claim slot ──▶ Started
//!           ──[due entry, ON rejected]──▶ SendFailed (retried next tick)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::clock::{self, minute_floor};
use crate::config::DeviceCodes;
use crate::db::{Actuation, Db, DeviceKind};
use crate::downlink::{downlink_code, Downlink, DownlinkCommand, DownlinkResponse};
use crate::state::SharedState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// The other device kind holds the slot.
    Busy { running: DeviceKind },
    StillRunning { command_id: i64, ends_at: i64 },
    /// `off_status` is `None` when the off-code never got an answer.
    Stopped {
        command_id: i64,
        log_id: i64,
        off_status: Option<u16>,
    },
    Nothing,
    Started { command_id: i64, log_id: i64 },
    SendFailed {
        command_id: i64,
        status: Option<u16>,
    },
}

#[derive(Clone)]
pub struct Scheduler {
    db: Db,
    downlink: Arc<dyn Downlink>,
    codes: DeviceCodes,
    grace_min: i64,
    lock: Arc<Mutex<()>>,
    shared: SharedState,
}

impl Scheduler {
    pub fn new(
        db: Db,
        downlink: Arc<dyn Downlink>,
        codes: DeviceCodes,
        grace_min: i64,
        shared: SharedState,
    ) -> Self {
        Self {
            db,
            downlink,
            codes,
            grace_min,
            lock: Arc::new(Mutex::new(())),
            shared,
        }
    }

    /// One scheduling step for `kind` at `now`.
    pub async fn tick(&self, kind: DeviceKind, now: i64) -> Result<TickOutcome> {
        let _guard = self.lock.lock().await;

        match self.db.current_actuation().await? {
            Actuation::Running { kind: running, .. } if running != kind => {
                Ok(TickOutcome::Busy { running })
            }
            Actuation::Running {
                log_id,
                command_id,
                ends_at,
                ..
            } => {
                if minute_floor(now) < minute_floor(ends_at) {
                    return Ok(TickOutcome::StillRunning { command_id, ends_at });
                }
                self.stop(kind, log_id, command_id, now).await
            }
            Actuation::Idle => self.start_due(kind, now).await,
        }
    }

    async fn stop(
        &self,
        kind: DeviceKind,
        log_id: i64,
        command_id: i64,
        now: i64,
    ) -> Result<TickOutcome> {
        let code = downlink_code(&self.codes, DownlinkCommand::Off, kind, 0);
        let off_status = self.send(Some(kind), &code).await.map(|r| r.status);

        match off_status {
            Some(status) if (200..300).contains(&status) => {}
            _ => warn!(
                %kind,
                command_id,
                ?off_status,
                "scheduler: off-code not accepted; closing the episode anyway"
            ),
        }

        self.db.end_actuation(log_id, now).await?;
        info!(%kind, command_id, log_id, "scheduler: actuation stopped");
        self.shared
            .write()
            .await
            .record_scheduler(format!("{kind}: command #{command_id} stopped"));

        Ok(TickOutcome::Stopped {
            command_id,
            log_id,
            off_status,
        })
    }

    async fn start_due(&self, kind: DeviceKind, now: i64) -> Result<TickOutcome> {
        let minute = minute_floor(now);
        let Some(cmd) = self
            .db
            .due_command(kind, minute - self.grace_min * 60, minute)
            .await?
        else {
            return Ok(TickOutcome::Nothing);
        };

        let code = downlink_code(&self.codes, DownlinkCommand::On, kind, cmd.duration_sec);
        let resp = self.send(Some(kind), &code).await;
        let accepted = resp.as_ref().is_some_and(DownlinkResponse::is_success);
        if !accepted {
            let status = resp.map(|r| r.status);
            error!(%kind, command_id = cmd.id, ?status, "scheduler: on-code rejected");
            self.shared.write().await.record_error(format!(
                "{kind}: command #{} not started (gateway status {})",
                cmd.id,
                status.map_or_else(|| "none".to_string(), |s| s.to_string())
            ));
            return Ok(TickOutcome::SendFailed {
                command_id: cmd.id,
                status,
            });
        }

        let cycle_id = self.db.active_cycle().await?.map(|c| c.cycle_id);
        let Some(log_id) = self.db.begin_actuation(&cmd, cycle_id, now).await? else {
            warn!(%kind, command_id = cmd.id, "scheduler: command no longer startable after send");
            return Ok(TickOutcome::Nothing);
        };

        info!(
            %kind,
            command_id = cmd.id,
            log_id,
            duration_sec = cmd.duration_sec,
            ends_at = cmd.computed_end,
            "scheduler: actuation started"
        );
        self.shared.write().await.record_scheduler(format!(
            "{kind}: command #{} started for {}s",
            cmd.id, cmd.duration_sec
        ));

        Ok(TickOutcome::Started {
            command_id: cmd.id,
            log_id,
        })
    }

    /// Send a code and record the attempt. `None` means no HTTP answer.
    async fn send(&self, kind: Option<DeviceKind>, code: &str) -> Option<DownlinkResponse> {
        let resp = match self.downlink.send(code).await {
            Ok(r) => Some(r),
            Err(e) => {
                error!(code, "downlink failed: {e:#}");
                None
            }
        };
        self.shared
            .write()
            .await
            .record_downlink(kind, code, resp.as_ref().map(|r| r.status));
        resp
    }

    /// Push an arbitrary code to the device, serialised with the ticks.
    pub async fn send_manual(&self, code: &str) -> Result<DownlinkResponse> {
        let _guard = self.lock.lock().await;
        let resp = self.downlink.send(code).await;
        self.shared.write().await.record_downlink(
            None,
            code,
            resp.as_ref().ok().map(|r| r.status),
        );
        resp
    }
}

/// Run `kind`'s tick at the top of every minute. Intended to be
/// `tokio::spawn`-ed from main.
pub async fn run(scheduler: Scheduler, kind: DeviceKind) {
    info!(%kind, grace_min = scheduler.grace_min, "scheduler started");
    scheduler
        .shared
        .write()
        .await
        .record_system(format!("{kind} scheduler started"));

    loop {
        let wait = clock::secs_until_next(clock::now_unix(), 60);
        tokio::time::sleep(Duration::from_secs(wait as u64)).await;

        if let Err(e) = scheduler.tick(kind, clock::now_unix()).await {
            error!(%kind, "scheduler tick failed: {e:#}");
            scheduler
                .shared
                .write()
                .await
                .record_error(format!("{kind} tick failed: {e:#}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
