use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::UtcOffset;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::clock::{self, minute_floor};
use crate::config::DeviceCodes;
use crate::db::{CommandMode, Db, DeviceKind, NewCommand, QueuedCommand, Recommendation};
use crate::downlink::{downlink_code, DownlinkCommand};
use crate::ingest::{self, IngestOutcome};
use crate::ml::{Features, FertilizerQuery, MlError, Recommender};
use crate::producer::{self, Producer};
use crate::scheduler::Scheduler;
use crate::state::SharedState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;
const MAX_MANUAL_DURATION_SEC: i64 = 86_400;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub shared: SharedState,
    pub scheduler: Scheduler,
    pub producer: Producer,
    pub recommender: Arc<dyn Recommender>,
    pub codes: DeviceCodes,
    pub flow_rate_lpm: f64,
    pub offset: UtcOffset,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("the given data was invalid")]
    Validation(BTreeMap<String, Vec<String>>),
    #[error("upstream service returned {status}")]
    Upstream { status: u16, body: String },
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ApiError::Validation(BTreeMap::from([(field.to_string(), vec![message.into()])]))
    }

    /// Map an ML client error, passing the upstream status through.
    fn from_ml(e: &MlError) -> Self {
        match e {
            MlError::Upstream { status, body } => ApiError::Upstream {
                status: *status,
                body: body.clone(),
            },
            other => ApiError::Upstream {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                body: other.to_string(),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(r: JsonRejection) -> Self {
        ApiError::invalid("body", r.body_text())
    }
}

impl From<MlError> for ApiError {
    fn from(e: MlError) -> Self {
        ApiError::from_ml(&e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": "The given data was invalid.", "errors": errors })),
            )
                .into_response(),
            ApiError::Upstream { status, body } => {
                let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                warn!(status, "upstream error passed through");
                (
                    code,
                    Json(json!({ "message": format!("upstream service returned {status}"), "body": body })),
                )
                    .into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "message": message }))).into_response()
            }
            ApiError::Internal(e) => {
                error!("request failed: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "message": format!("{e:#}") })),
                )
                    .into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Request validation
// ---------------------------------------------------------------------------

/// `Json<Value>` whose rejection uses the validation error shape.
struct JsonBody(Value);

impl<S: Send + Sync> FromRequest<S> for JsonBody {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(body) = Json::<Value>::from_request(req, state).await?;
        Ok(JsonBody(body))
    }
}

/// Collects every field error in a JSON body before failing.
struct Fields<'a> {
    body: &'a Value,
    errors: BTreeMap<String, Vec<String>>,
}

impl<'a> Fields<'a> {
    fn new(body: &'a Value) -> Self {
        Self {
            body,
            errors: BTreeMap::new(),
        }
    }

    fn fail(&mut self, field: &str, message: impl Into<String>) {
        self.errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    /// Numbers may arrive as JSON numbers or numeric strings.
    fn optional_number(&mut self, field: &str) -> Option<f64> {
        let parsed = match self.body.get(field) {
            None | Some(Value::Null) => return None,
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        match parsed.filter(|v| v.is_finite()) {
            Some(v) => Some(v),
            None => {
                self.fail(field, format!("{field} must be a number"));
                None
            }
        }
    }

    fn number(&mut self, field: &str) -> Option<f64> {
        if self.body.get(field).map_or(true, Value::is_null) {
            self.fail(field, format!("{field} is required"));
            return None;
        }
        self.optional_number(field)
    }

    fn optional_string(&mut self, field: &str) -> Option<&'a str> {
        let body: &'a Value = self.body;
        match body.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.as_str()),
            Some(_) => {
                self.fail(field, format!("{field} must be a string"));
                None
            }
        }
    }

    fn string(&mut self, field: &str) -> Option<&'a str> {
        match self.optional_string(field) {
            Some(s) if !s.trim().is_empty() => Some(s),
            Some(_) | None => {
                if !self.errors.contains_key(field) {
                    self.fail(field, format!("{field} is required"));
                }
                None
            }
        }
    }

    fn finish(self) -> Result<(), ApiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(self.errors))
        }
    }
}

fn parse_kind(s: &str) -> Result<DeviceKind, ApiError> {
    s.parse()
        .map_err(|_| ApiError::invalid("kind", "kind must be irrigation or fertilizer"))
}

fn clamp_limit(limit: Option<i64>) -> Result<i64, ApiError> {
    match limit {
        None => Ok(DEFAULT_LIMIT),
        Some(n) if (1..=MAX_LIMIT).contains(&n) => Ok(n),
        Some(_) => Err(ApiError::invalid(
            "limit",
            format!("limit must be between 1 and {MAX_LIMIT}"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/queue", get(list_queue).post(enqueue_manual))
        .route("/api/queue/{id}", get(get_queued))
        .route("/api/actions", get(list_actions))
        .route("/api/recommendations", get(list_recommendations))
        .route("/antares/webhook", post(antares_webhook))
        .route("/antares/downlink", post(antares_downlink))
        .route("/ml/irrigation", post(ml_irrigation))
        .route("/ml/fertilizer", post(ml_fertilizer))
        .route("/schedule/irrigation", post(schedule_irrigation))
        .route("/schedule/fertilizer", post(schedule_fertilizer))
        .route("/schedule/hourly", post(schedule_hourly))
        .fallback(not_found)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn not_found() -> ApiError {
    ApiError::NotFound("no such route".to_string())
}

async fn api_status(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let actuation = app.db.current_actuation().await?;
    let st = app.shared.read().await;
    Ok(Json(st.to_status(actuation)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    kind: Option<String>,
    limit: Option<i64>,
}

async fn list_queue(
    State(app): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<QueuedCommand>>, ApiError> {
    let kind = q.kind.as_deref().map(parse_kind).transpose()?;
    let limit = clamp_limit(q.limit)?;
    Ok(Json(app.db.recent_commands(kind, limit).await?))
}

/// One queue entry plus the action-log episode it produced, if any.
async fn get_queued(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let cmd = app
        .db
        .get_command(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("command {id} not found")))?;
    let actions = app.db.actions_for_command(id).await?;
    Ok(Json(json!({ "command": cmd, "actions": actions })))
}

#[derive(Debug, Serialize)]
struct RecommendationView {
    #[serde(flatten)]
    recommendation: Recommendation,
    condition: Option<String>,
    suggestion: Option<String>,
}

async fn list_recommendations(
    State(app): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<RecommendationView>>, ApiError> {
    let limit = clamp_limit(q.limit)?;
    let mut out = Vec::new();
    for r in app.db.recent_recommendations(limit).await? {
        let condition = app.db.message_text(r.condition_id).await?;
        let suggestion = app.db.message_text(r.suggestion_id).await?;
        out.push(RecommendationView {
            recommendation: r,
            condition,
            suggestion,
        });
    }
    Ok(Json(out))
}

async fn list_actions(
    State(app): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = clamp_limit(q.limit)?;
    Ok(Json(app.db.recent_actions(limit).await?))
}

/// `{kind, duration_sec, start?}`; `start` is local time and defaults to the
/// next minute.
async fn enqueue_manual(
    State(app): State<AppState>,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse, ApiError> {
    let now = clock::now_unix();
    let mut f = Fields::new(&body);

    let kind = f.string("kind");
    let duration = f.number("duration_sec");
    let start = f.optional_string("start");

    let kind = match kind.map(parse_kind) {
        Some(Ok(k)) => Some(k),
        Some(Err(_)) => {
            f.fail("kind", "kind must be irrigation or fertilizer");
            None
        }
        None => None,
    };

    let duration_sec = duration.and_then(|d| {
        if d.fract() != 0.0 || d < 1.0 || d > MAX_MANUAL_DURATION_SEC as f64 {
            f.fail(
                "duration_sec",
                format!("duration_sec must be a whole number between 1 and {MAX_MANUAL_DURATION_SEC}"),
            );
            None
        } else {
            Some(d as i64)
        }
    });

    let scheduled_start = match start {
        None => Some(minute_floor(now) + 60),
        Some(s) => match clock::parse_local(s, app.offset) {
            Ok(ts) if minute_floor(ts) > minute_floor(now) => Some(ts),
            Ok(_) => {
                f.fail("start", "start must be after the current minute");
                None
            }
            Err(_) => {
                f.fail("start", "start must look like YYYY-MM-DD HH:MM[:SS]");
                None
            }
        },
    };

    f.finish()?;
    let (Some(kind), Some(duration_sec), Some(scheduled_start)) = (kind, duration_sec, scheduled_start)
    else {
        return Err(ApiError::Internal(anyhow::anyhow!("validated fields missing")));
    };

    let id = app
        .db
        .enqueue_command(&NewCommand {
            kind,
            recommendation_id: None,
            mode: CommandMode::Manual,
            scheduled_start,
            duration_sec,
            volume_liters: producer::volume_liters(duration_sec, app.flow_rate_lpm),
        })
        .await?;
    info!(%kind, command_id = id, scheduled_start, duration_sec, "manual command queued");
    app.shared.write().await.record_scheduler(format!(
        "{kind}: manual command #{id} queued for {}",
        clock::format_local(scheduled_start, app.offset)
    ));

    let cmd = app
        .db
        .get_command(id)
        .await?
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("command {id} vanished")))?;
    Ok((StatusCode::CREATED, Json(cmd)))
}

async fn antares_webhook(
    State(app): State<AppState>,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse, ApiError> {
    match ingest::ingest(&app.db, &body, clock::now_unix()).await? {
        IngestOutcome::Stored(reading) => {
            app.shared.write().await.record_reading(&reading);
            Ok(Json(json!({ "status": "stored", "reading": reading })))
        }
        IngestOutcome::Ignored(reason) => {
            info!(reason, "webhook ignored");
            Ok(Json(json!({ "status": "ignored", "reason": reason })))
        }
        IngestOutcome::Rejected(e) => {
            warn!("webhook rejected: {e}");
            app.shared
                .write()
                .await
                .record_error(format!("bad telemetry: {e}"));
            Err(ApiError::invalid(e.field(), e.to_string()))
        }
    }
}

/// Push a code through the gateway: either a raw `{data}` code or
/// `{kind, command, duration_sec?}` translated with the configured codes.
async fn antares_downlink(
    State(app): State<AppState>,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse, ApiError> {
    let mut f = Fields::new(&body);
    let code = match f.optional_string("data") {
        Some(raw) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
        Some(_) => {
            f.fail("data", "data is required");
            None
        }
        None => {
            let kind = f.string("kind").and_then(|k| match parse_kind(k) {
                Ok(kind) => Some(kind),
                Err(_) => {
                    f.fail("kind", "kind must be irrigation or fertilizer");
                    None
                }
            });
            let command = f.string("command").map(DownlinkCommand::parse_lenient);
            let duration = f.optional_number("duration_sec").unwrap_or(0.0);
            match (kind, command) {
                (Some(kind), Some(cmd)) => Some(downlink_code(&app.codes, cmd, kind, duration as i64)),
                _ => None,
            }
        }
    };
    f.finish()?;
    let Some(code) = code else {
        return Err(ApiError::invalid("data", "data is required"));
    };
    let code = code.as_str();

    let resp = match app.scheduler.send_manual(code).await {
        Ok(r) => r,
        Err(e) => {
            return Err(ApiError::Upstream {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                body: format!("{e:#}"),
            })
        }
    };
    if !resp.is_success() {
        return Err(ApiError::Upstream {
            status: resp.status,
            body: resp.body,
        });
    }

    let data: Value = serde_json::from_str(&resp.body).unwrap_or(Value::String(resp.body));
    Ok(Json(json!({ "status": resp.status, "data": data })))
}

async fn ml_irrigation(
    State(app): State<AppState>,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse, ApiError> {
    let mut f = Fields::new(&body);
    let soil_moisture = f.number("SoilMoisture");
    let humidity = f.number("Humidity");
    let temperature = f.number("temperature");
    f.finish()?;

    let (Some(soil_moisture), Some(humidity), Some(temperature)) =
        (soil_moisture, humidity, temperature)
    else {
        return Err(ApiError::Internal(anyhow::anyhow!("validated fields missing")));
    };
    let advice = app
        .recommender
        .irrigation(&Features {
            soil_moisture,
            humidity,
            temperature,
        })
        .await?;
    Ok(Json(json!({ "status": 200, "data": advice })))
}

/// `{tinggi_tanaman, hst?}`; without `hst` the active cycle's day count is used.
async fn ml_fertilizer(
    State(app): State<AppState>,
    JsonBody(body): JsonBody,
) -> Result<impl IntoResponse, ApiError> {
    let mut f = Fields::new(&body);
    let height = f.number("tinggi_tanaman");
    let hst = f.optional_number("hst");
    f.finish()?;
    let Some(tinggi_tanaman) = height else {
        return Err(ApiError::invalid("tinggi_tanaman", "tinggi_tanaman is required"));
    };

    let hst = match hst {
        Some(h) => h.round() as i64,
        None => match app.db.active_cycle().await? {
            Some(cycle) => cycle.days_after_planting(clock::now_unix()),
            None => {
                return Err(ApiError::invalid(
                    "hst",
                    "hst is required when no planting cycle is active",
                ))
            }
        },
    };

    let data = app
        .recommender
        .fertilizer(&FertilizerQuery {
            tinggi_tanaman,
            hst,
        })
        .await?;
    Ok(Json(json!({ "status": 200, "data": data })))
}

async fn schedule_irrigation(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        app.scheduler
            .tick(DeviceKind::Irrigation, clock::now_unix())
            .await?,
    ))
}

async fn schedule_fertilizer(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        app.scheduler
            .tick(DeviceKind::Fertilizer, clock::now_unix())
            .await?,
    ))
}

async fn schedule_hourly(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    match producer::run_once(&app.producer, &app.shared, clock::now_unix()).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => match e.downcast_ref::<MlError>() {
            Some(ml) => Err(ApiError::from_ml(ml)),
            None => Err(ApiError::Internal(e)),
        },
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("http listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
