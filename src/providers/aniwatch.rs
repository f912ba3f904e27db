use percent_encoding::{AsciiSet, CONTROLS, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CatalogProvider, EpisodeProvider};
use crate::config::ClientSettings;
use crate::error::AnigateError;
use crate::proxy::{Envelope, NETWORK_FAILURE};
use crate::types::Category;

const USER_AGENT: &str = concat!("anigate/", env!("CARGO_PKG_VERSION"));

/// Same set `encodeURIComponent` leaves alone.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Episode ids are embedded with their `?ep=` marker intact; only characters
/// that would break the outer query are escaped.
const EPISODE_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'`');

/// Typed client for the gateway's `/api/anime` route.
pub struct AniwatchClient {
    client: Client,
    base_url: String,
    max_retries: usize,
    retry_delay: Duration,
}

impl AniwatchClient {
    pub fn new(
        base_url: impl Into<String>,
        max_retries: usize,
        retry_delay: Duration,
        timeout: Duration,
    ) -> Result<Self, AnigateError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries,
            retry_delay,
        })
    }

    pub fn from_settings(settings: &ClientSettings, base_url: &str) -> Result<Self, AnigateError> {
        Self::new(
            base_url,
            settings.max_retries,
            Duration::from_millis(settings.retry_delay_ms),
            Duration::from_secs(settings.timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Single unretried probe of the catalog root.
    pub async fn health_check(&self) -> bool {
        match self.client.get(format!("{}/home", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(error = %err, "health check failed");
                false
            }
        }
    }

    /// GETs `endpoint` through the gateway and unwraps the envelope.
    ///
    /// 5xx responses are retried up to `max_retries` times with a fixed delay;
    /// everything else is returned or surfaced on the first response. Once
    /// retries run out, gateway timeouts and connection failures keep their
    /// own error kinds.
    async fn fetch(&self, endpoint: &str) -> Result<Value, AnigateError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            debug!(%url, attempt, "fetching via gateway");
            let response = self.client.get(&url).send().await?;
            let status = response.status();

            if status.is_server_error() {
                if attempt <= self.max_retries {
                    warn!(
                        %url,
                        status = status.as_u16(),
                        remaining = self.max_retries + 1 - attempt,
                        "gateway returned server error, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
                let body = response.text().await.unwrap_or_default();
                return Err(exhausted(status, &body, attempt));
            }

            let text = response.text().await?;
            if !status.is_success() {
                let message = serde_json::from_str::<Envelope>(&text)
                    .ok()
                    .and_then(Envelope::failure_message)
                    .unwrap_or_else(|| status.to_string());
                return Err(AnigateError::UpstreamClientError {
                    status: status.as_u16(),
                    message,
                });
            }

            let envelope: Envelope = serde_json::from_str(&text)
                .map_err(|err| AnigateError::Parse(format!("invalid envelope from {url}: {err}")))?;
            if envelope.success == Some(false) {
                let message = envelope
                    .failure_message()
                    .unwrap_or_else(|| String::from("API returned success: false"));
                return Err(AnigateError::UpstreamReportedFailure(message));
            }
            debug!(%url, attempt, "gateway call successful");
            return Ok(envelope.data.unwrap_or(Value::Null));
        }
    }
}

fn exhausted(status: StatusCode, body: &str, attempts: usize) -> AnigateError {
    let envelope = serde_json::from_str::<Envelope>(body).ok();
    match status {
        StatusCode::GATEWAY_TIMEOUT => AnigateError::UpstreamTimeout,
        StatusCode::SERVICE_UNAVAILABLE
            if envelope
                .as_ref()
                .is_some_and(|e| e.error.as_deref() == Some(NETWORK_FAILURE)) =>
        {
            let message = envelope
                .and_then(|e| e.message.or(e.error))
                .unwrap_or_else(|| NETWORK_FAILURE.to_string());
            AnigateError::NetworkError(message)
        }
        _ => AnigateError::UpstreamServerError {
            status: status.as_u16(),
            attempts,
        },
    }
}

impl EpisodeProvider for AniwatchClient {
    async fn episode_servers(&self, episode_id: &str) -> Result<Value, AnigateError> {
        let id = utf8_percent_encode(episode_id, EPISODE_VALUE);
        self.fetch(&format!("/episode/servers?animeEpisodeId={id}"))
            .await
    }

    async fn episode_sources(
        &self,
        episode_id: &str,
        server: &str,
        category: Category,
    ) -> Result<Value, AnigateError> {
        let id = utf8_percent_encode(episode_id, EPISODE_VALUE);
        let server = utf8_percent_encode(server, COMPONENT);
        self.fetch(&format!(
            "/episode/sources?animeEpisodeId={id}&server={server}&category={category}"
        ))
        .await
    }
}

impl CatalogProvider for AniwatchClient {
    async fn home(&self) -> Result<Value, AnigateError> {
        self.fetch("/home").await
    }

    async fn search(&self, query: &str, page: u32) -> Result<Value, AnigateError> {
        let q = utf8_percent_encode(query, COMPONENT);
        self.fetch(&format!("/search?q={q}&page={page}")).await
    }

    async fn category(&self, name: &str, page: u32) -> Result<Value, AnigateError> {
        let name = utf8_percent_encode(name, COMPONENT);
        self.fetch(&format!("/category/{name}?page={page}")).await
    }

    async fn anime_info(&self, anime_id: &str) -> Result<Value, AnigateError> {
        let id = utf8_percent_encode(anime_id, COMPONENT);
        self.fetch(&format!("/anime/{id}")).await
    }

    async fn episodes(&self, anime_id: &str) -> Result<Value, AnigateError> {
        let id = utf8_percent_encode(anime_id, COMPONENT);
        self.fetch(&format!("/anime/{id}/episodes")).await
    }
}
