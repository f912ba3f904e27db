//! CORS gateway in front of the upstream anime API.
//!
//! Every response, successful or not, is wrapped in the same JSON envelope
//! and carries a permissive `Access-Control-Allow-Origin` header.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::config::GatewaySettings;

const SUCCESS_CACHE_CONTROL: &str = "public, s-maxage=300, stale-while-revalidate=60";
const API_SOURCE_TAG: &str = "aniwatch-proxy";
const EPISODE_PATH_PREFIX: &str = "episode/";

pub const TIMEOUT_FAILURE: &str = "External API timeout - please try again later";
pub const NETWORK_FAILURE: &str = "Network error - cannot connect to external API";
const FETCH_FAILURE: &str = "Failed to fetch data from external API";

/// Wire envelope shared by the gateway and the API client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Envelope {
    pub fn ok(data: Value) -> Self {
        Self {
            success: Some(true),
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn failure_message(self) -> Option<String> {
        self.error.or(self.message).filter(|m| !m.is_empty())
    }
}

struct GatewayState {
    http: Client,
    upstream_base: String,
    prefix: String,
    referer: String,
}

impl GatewayState {
    fn new(settings: &GatewaySettings) -> Result<Self> {
        let http = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .timeout(settings.timeout())
            .build()
            .context("failed to create upstream HTTP client")?;
        Ok(Self {
            http,
            upstream_base: settings.upstream_base.trim_end_matches('/').to_string(),
            prefix: settings.prefix(),
            referer: settings.referer.clone(),
        })
    }

    /// Upstream URL for a request path below the route prefix.
    ///
    /// Episode endpoints get their raw query appended untouched so ids such
    /// as `slug?ep=12` survive; other queries are parsed and re-serialized.
    fn upstream_url(&self, path: &str, raw_query: Option<&str>) -> String {
        let base = format!("{}/{}", self.upstream_base, path);
        let query = match raw_query {
            Some(raw) if path.starts_with(EPISODE_PATH_PREFIX) => raw.to_string(),
            Some(raw) => form_urlencoded::Serializer::new(String::new())
                .extend_pairs(form_urlencoded::parse(raw.as_bytes()))
                .finish(),
            None => String::new(),
        };
        if query.is_empty() {
            base
        } else {
            format!("{base}?{query}")
        }
    }

    fn request(&self, url: &str, episode: bool) -> reqwest::RequestBuilder {
        let request = self
            .http
            .get(url)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("Accept", "application/json, text/plain, */*")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Referer", self.referer.as_str());
        if episode {
            request
                .header("Connection", "keep-alive")
                .header("Sec-Fetch-Dest", "empty")
                .header("Sec-Fetch-Mode", "cors")
                .header("Sec-Fetch-Site", "same-site")
        } else {
            request
        }
    }
}

pub fn router(settings: &GatewaySettings) -> Result<Router> {
    let state = Arc::new(GatewayState::new(settings)?);
    let route = format!("{}/{{*path}}", settings.prefix());
    Ok(Router::new()
        .route(&route, get(forward))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http()))
}

async fn forward(State(state): State<Arc<GatewayState>>, uri: Uri) -> Response {
    let path = uri
        .path()
        .strip_prefix(state.prefix.as_str())
        .unwrap_or(uri.path())
        .trim_start_matches('/');
    let episode = path.starts_with(EPISODE_PATH_PREFIX);
    let url = state.upstream_url(path, uri.query());
    debug!(%url, episode, "forwarding to upstream");

    let response = match state.request(&url, episode).send().await {
        Ok(response) => response,
        Err(err) => return local_failure(&err),
    };

    let status = response.status();
    debug!(%url, status = status.as_u16(), "upstream responded");
    if !status.is_success() {
        let details = response.text().await.unwrap_or_default();
        warn!(%url, status = status.as_u16(), "upstream returned an error");
        let envelope = Envelope {
            details: Some(details),
            ..Envelope::failure(format!("External API error: {}", status.as_u16()))
        };
        return envelope_response(status, &envelope, &[]);
    }

    let data = match response.json::<Value>().await {
        Ok(data) => data,
        Err(err) => return local_failure(&err),
    };

    let mut extra = vec![(header::CACHE_CONTROL.as_str(), SUCCESS_CACHE_CONTROL)];
    if episode {
        extra.push(("x-api-source", API_SOURCE_TAG));
    }
    envelope_response(StatusCode::OK, &Envelope::ok(data), &extra)
}

fn local_failure(err: &reqwest::Error) -> Response {
    let (status, message) = if err.is_timeout() {
        (StatusCode::GATEWAY_TIMEOUT, TIMEOUT_FAILURE)
    } else if err.is_connect() {
        (StatusCode::SERVICE_UNAVAILABLE, NETWORK_FAILURE)
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, FETCH_FAILURE)
    };
    error!(error = %err, status = status.as_u16(), "proxy error");
    let envelope = Envelope {
        message: Some(err.to_string()),
        ..Envelope::failure(message)
    };
    envelope_response(status, &envelope, &[])
}

fn envelope_response(status: StatusCode, envelope: &Envelope, extra: &[(&str, &str)]) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    for (name, value) in extra {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::try_from(*name),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    (status, headers, Json(envelope)).into_response()
}

/// Gateway running on a background task, stopped on drop.
pub struct LocalGateway {
    pub base_url: String,
    prefix: String,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LocalGateway {
    pub async fn start(settings: &GatewaySettings, bind: SocketAddr) -> Result<Self> {
        let app = router(settings)?;
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind gateway on {bind}"))?;
        let addr = listener
            .local_addr()
            .context("failed to read gateway address")?;

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = stopped.await;
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %err, "gateway server failed");
            }
        });
        debug!(%addr, "local gateway started");

        Ok(Self {
            base_url: format!("http://{addr}"),
            prefix: settings.prefix(),
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Base URL the API client should target.
    pub fn api_url(&self) -> String {
        format!("{}{}", self.base_url, self.prefix)
    }

    pub async fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LocalGateway {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Runs the gateway in the foreground until Ctrl-C.
pub async fn serve(settings: &GatewaySettings) -> Result<()> {
    let app = router(settings)?;
    let listener = TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("failed to bind gateway on {}", settings.bind))?;
    info!(
        bind = %settings.bind,
        prefix = %settings.prefix(),
        upstream = %settings.upstream_base,
        "gateway listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down gateway");
            }
        })
        .await
        .context("gateway server failed")
}
