//! Downlink path to the field device: code translation and the Antares
//! content-instance client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::config::{AntaresConfig, DeviceCodes, DurationEncoding};
use crate::db::DeviceKind;

// HeaderName::from_static only takes lowercase.
const M2M_ORIGIN: &str = "x-m2m-origin";
const CONTENT_INSTANCE: &str = "application/json;ty=4";

// ---------------------------------------------------------------------------
// Code translation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownlinkCommand {
    On,
    Off,
}

impl DownlinkCommand {
    /// Anything that is not clearly "on" means off.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "nyala" => Self::On,
            _ => Self::Off,
        }
    }
}

/// Device prefix followed by the command suffix. With
/// `DurationEncoding::AppendSeconds` the on-code also carries the duration.
pub fn downlink_code(
    codes: &DeviceCodes,
    cmd: DownlinkCommand,
    kind: DeviceKind,
    duration_sec: i64,
) -> String {
    let prefix = match kind {
        DeviceKind::Irrigation => &codes.water_code,
        DeviceKind::Fertilizer => &codes.fertilizer_code,
    };
    match (cmd, codes.duration_encoding) {
        (DownlinkCommand::On, DurationEncoding::None) => format!("{prefix}{}", codes.on_code),
        (DownlinkCommand::On, DurationEncoding::AppendSeconds) => {
            format!("{prefix}{}{duration_sec}", codes.on_code)
        }
        (DownlinkCommand::Off, _) => format!("{prefix}{}", codes.off_code),
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Status and raw body of a gateway reply, kept for logging.
#[derive(Debug, Clone, Serialize)]
pub struct DownlinkResponse {
    pub status: u16,
    pub body: String,
}

impl DownlinkResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Anything that can push an opaque code to the device. `Err` means the
/// request never got an HTTP answer.
#[async_trait]
pub trait Downlink: Send + Sync {
    async fn send(&self, code: &str) -> Result<DownlinkResponse>;
}

#[derive(Debug, Clone)]
pub struct AntaresClient {
    http: Client,
    url: String,
    access_key: String,
}

impl AntaresClient {
    pub fn new(cfg: &AntaresConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Antares HTTP client")?;
        Ok(Self {
            http,
            url: cfg.url.clone(),
            access_key: cfg.access_key.clone(),
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            M2M_ORIGIN,
            HeaderValue::from_str(&self.access_key).context("invalid Antares access key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_INSTANCE));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

/// `{"m2m:cin": {"con": "<json string>"}}`. The gateway wants the inner
/// object serialised into a string.
pub(crate) fn envelope(code: &str) -> serde_json::Value {
    let con = json!({ "type": "downlink", "data": code }).to_string();
    json!({ "m2m:cin": { "con": con } })
}

#[async_trait]
impl Downlink for AntaresClient {
    async fn send(&self, code: &str) -> Result<DownlinkResponse> {
        let body = serde_json::to_vec(&envelope(code)).context("failed to serialize downlink")?;
        debug!(url = %self.url, code, "sending downlink");

        let resp = self
            .http
            .post(&self.url)
            .headers(self.headers()?)
            .body(body)
            .send()
            .await
            .context("Antares downlink request failed")?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .context("failed to read Antares downlink response body")?;

        Ok(DownlinkResponse { status, body })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    /// Records every code and answers with a fixed status.
    pub(crate) struct FakeDownlink {
        pub(crate) status: Mutex<u16>,
        pub(crate) sent: Mutex<Vec<String>>,
    }

    impl FakeDownlink {
        pub(crate) fn answering(status: u16) -> Self {
            Self {
                status: Mutex::new(status),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn set_status(&self, status: u16) {
            *self.status.lock().unwrap() = status;
        }
    }

    #[async_trait]
    impl Downlink for FakeDownlink {
        async fn send(&self, code: &str) -> Result<DownlinkResponse> {
            self.sent.lock().unwrap().push(code.to_string());
            let status = *self.status.lock().unwrap();
            Ok(DownlinkResponse {
                status,
                body: format!("fake {status}"),
            })
        }
    }

    fn codes(encoding: DurationEncoding) -> DeviceCodes {
        DeviceCodes {
            water_code: "A".into(),
            fertilizer_code: "B".into(),
            on_code: "1".into(),
            off_code: "0".into(),
            duration_encoding: encoding,
        }
    }

    // -- Code translation -------------------------------------------------

    #[test]
    fn code_is_prefix_plus_suffix() {
        let c = codes(DurationEncoding::None);
        assert_eq!(downlink_code(&c, DownlinkCommand::On, DeviceKind::Irrigation, 600), "A1");
        assert_eq!(downlink_code(&c, DownlinkCommand::Off, DeviceKind::Irrigation, 600), "A0");
        assert_eq!(downlink_code(&c, DownlinkCommand::On, DeviceKind::Fertilizer, 600), "B1");
        assert_eq!(downlink_code(&c, DownlinkCommand::Off, DeviceKind::Fertilizer, 0), "B0");
    }

    #[test]
    fn append_seconds_only_affects_on_code() {
        let c = codes(DurationEncoding::AppendSeconds);
        assert_eq!(downlink_code(&c, DownlinkCommand::On, DeviceKind::Irrigation, 1200), "A11200");
        assert_eq!(downlink_code(&c, DownlinkCommand::Off, DeviceKind::Irrigation, 1200), "A0");
    }

    #[test]
    fn unknown_command_is_off() {
        assert_eq!(DownlinkCommand::parse_lenient("ON"), DownlinkCommand::On);
        assert_eq!(DownlinkCommand::parse_lenient(" nyala "), DownlinkCommand::On);
        assert_eq!(DownlinkCommand::parse_lenient("mati"), DownlinkCommand::Off);
        assert_eq!(DownlinkCommand::parse_lenient("toggle"), DownlinkCommand::Off);
        assert_eq!(DownlinkCommand::parse_lenient(""), DownlinkCommand::Off);
    }

    #[test]
    fn envelope_wraps_stringified_content() {
        let env = envelope("A1");
        let con = env["m2m:cin"]["con"].as_str().unwrap();
        let inner: serde_json::Value = serde_json::from_str(con).unwrap();
        assert_eq!(inner["type"], "downlink");
        assert_eq!(inner["data"], "A1");
    }

    // -- Transport against a loopback gateway -----------------------------

    type Captured = Arc<Mutex<Vec<(AxumHeaders, String)>>>;

    async fn spawn_gateway(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route(
                "/",
                post(move |State(c): State<Captured>, headers: AxumHeaders, body: String| async move {
                    c.lock().unwrap().push((headers, body));
                    (status, r#"{"m2m:cin":{"ri":"cin-1"}}"#)
                }),
            )
            .with_state(Arc::clone(&captured));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), captured)
    }

    fn client(url: String) -> AntaresClient {
        AntaresClient::new(
            &AntaresConfig {
                url,
                access_key: "key:secret".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn send_posts_content_instance_with_headers() {
        let (url, captured) = spawn_gateway(StatusCode::CREATED).await;
        let resp = client(url).send("A1").await.unwrap();

        assert!(resp.is_success());
        assert_eq!(resp.status, 201);
        assert!(resp.body.contains("cin-1"));

        let calls = captured.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (headers, body) = &calls[0];
        assert_eq!(headers["x-m2m-origin"], "key:secret");
        assert_eq!(headers["content-type"], "application/json;ty=4");
        assert_eq!(headers["accept"], "application/json");
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(body, envelope("A1"));
    }

    #[tokio::test]
    async fn non_2xx_is_reported_not_raised() {
        let (url, _captured) = spawn_gateway(StatusCode::INTERNAL_SERVER_ERROR).await;
        let resp = client(url).send("A1").await.unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.status, 500);
    }

    #[tokio::test]
    async fn unreachable_gateway_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(client(format!("http://{addr}/")).send("A1").await.is_err());
    }
}
