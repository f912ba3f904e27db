//! Server and source discovery for one episode.
//!
//! Resolution walks `Idle -> ResolvingServers -> ResolvingSources -> Ready`
//! (or `Failed`). Candidates and servers are probed strictly one at a time
//! and the first non-empty answer wins; individual probe failures are logged
//! and skipped, only exhaustion is surfaced.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::error::AnigateError;
use crate::providers::EpisodeProvider;
use crate::resolver;
use crate::types::{
    Category, ProbeAttempt, ProbeOutcome, ServerDescriptor, ServerSet, SourceDescriptor,
    SourceList, SubtitleTrack,
};

/// Playable outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    /// Candidate the servers endpoint accepted; used for all later probes.
    pub episode_id: String,
    pub servers: ServerSet,
    pub category: Category,
    /// Identifier (name or id) the sources were obtained with.
    pub server: String,
    pub sources: SourceList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub error: AnigateError,
    pub episode_id: Option<String>,
    /// Kept when servers resolved but no source did, for manual selection.
    pub servers: Option<ServerSet>,
}

impl Failure {
    fn bare(error: AnigateError) -> Self {
        Self {
            error,
            episode_id: None,
            servers: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DiscoveryState {
    #[default]
    Idle,
    ResolvingServers,
    ResolvingSources {
        episode_id: String,
        servers: ServerSet,
    },
    Ready(Ready),
    Failed(Failure),
}

impl DiscoveryState {
    #[cfg(test)]
    pub fn is_settled(&self) -> bool {
        matches!(self, DiscoveryState::Ready(_) | DiscoveryState::Failed(_))
    }
}

/// Observer of intermediate states.
pub trait Progress {
    /// Called on each transition; returning `false` abandons the resolution.
    fn enter(&mut self, state: &DiscoveryState) -> bool;

    /// Consulted before every probe.
    fn is_current(&self) -> bool {
        true
    }
}

impl Progress for () {
    fn enter(&mut self, _state: &DiscoveryState) -> bool {
        true
    }
}

struct ProbeBudget {
    remaining: usize,
}

impl ProbeBudget {
    fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

pub struct DiscoveryEngine<P> {
    provider: P,
    max_probes: usize,
    diagnostics: Option<UnboundedSender<ProbeAttempt>>,
}

impl<P: EpisodeProvider> DiscoveryEngine<P> {
    pub fn new(provider: P, max_probes: usize) -> Self {
        Self {
            provider,
            max_probes: max_probes.max(1),
            diagnostics: None,
        }
    }

    /// Every probe is additionally reported on `sink`.
    pub fn with_diagnostics(mut self, sink: UnboundedSender<ProbeAttempt>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    #[cfg(test)]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[cfg(test)]
    pub async fn discover(&self, raw_id: &str) -> Result<Ready, Failure> {
        self.discover_with(raw_id, &mut ()).await
    }

    pub async fn discover_with(
        &self,
        raw_id: &str,
        progress: &mut impl Progress,
    ) -> Result<Ready, Failure> {
        let candidates = resolver::resolve(raw_id).map_err(Failure::bare)?;
        debug!(raw_id, ?candidates, "episode id candidates");
        let mut budget = ProbeBudget {
            remaining: self.max_probes,
        };

        if !progress.enter(&DiscoveryState::ResolvingServers) {
            return Err(Failure::bare(AnigateError::Cancelled));
        }
        let (episode_id, servers) = self
            .resolve_servers(&candidates, &mut budget, progress)
            .await?;
        info!(
            episode_id = %episode_id,
            servers = servers.len(),
            "servers resolved"
        );

        let resolving = DiscoveryState::ResolvingSources {
            episode_id: episode_id.clone(),
            servers: servers.clone(),
        };
        if !progress.enter(&resolving) {
            return Err(Failure::bare(AnigateError::Cancelled));
        }

        let mut hit: Option<(Category, String, SourceList)> = None;
        'scan: for category in Category::PRIORITY {
            for server in servers.get(category) {
                for ident in server.identifiers() {
                    if !progress.is_current() {
                        return Err(Failure::bare(AnigateError::Cancelled));
                    }
                    if !budget.take() {
                        warn!(episode_id = %episode_id, "probe budget exhausted while scanning sources");
                        break 'scan;
                    }
                    debug!(server = ident, %category, episode_id = %episode_id, "trying sources");
                    match self.fetch_sources(&episode_id, ident, category).await {
                        Ok(sources) if !sources.is_empty() => {
                            self.record(&episode_id, Some(category), Some(ident), ProbeOutcome::Accepted);
                            info!(server = ident, %category, count = sources.len(), "sources found");
                            hit = Some((category, ident.to_string(), sources));
                            break 'scan;
                        }
                        Ok(_) => {
                            debug!(server = ident, %category, "server returned no sources");
                            self.record(&episode_id, Some(category), Some(ident), ProbeOutcome::Empty);
                        }
                        Err(err) => {
                            warn!(server = ident, %category, error = %err, "source probe failed");
                            self.record(
                                &episode_id,
                                Some(category),
                                Some(ident),
                                ProbeOutcome::Failed(err.to_string()),
                            );
                        }
                    }
                }
            }
        }

        match hit {
            Some((category, server, sources)) => Ok(Ready {
                episode_id,
                servers,
                category,
                server,
                sources,
            }),
            None => Err(Failure {
                error: AnigateError::NoSourcesAvailable,
                episode_id: Some(episode_id),
                servers: Some(servers),
            }),
        }
    }

    /// Manual override: sources for one user-chosen server.
    pub async fn probe_server(
        &self,
        episode_id: &str,
        server: &str,
        category: Category,
    ) -> Result<SourceList, AnigateError> {
        let sources = self.fetch_sources(episode_id, server, category).await?;
        if sources.is_empty() {
            self.record(episode_id, Some(category), Some(server), ProbeOutcome::Empty);
            return Err(AnigateError::NoSourcesForServer {
                server: server.to_string(),
                category,
            });
        }
        self.record(episode_id, Some(category), Some(server), ProbeOutcome::Accepted);
        Ok(sources)
    }

    async fn resolve_servers(
        &self,
        candidates: &[String],
        budget: &mut ProbeBudget,
        progress: &mut impl Progress,
    ) -> Result<(String, ServerSet), Failure> {
        let mut tried = 0usize;
        for candidate in candidates {
            if !progress.is_current() {
                return Err(Failure::bare(AnigateError::Cancelled));
            }
            if !budget.take() {
                warn!("probe budget exhausted while resolving servers");
                break;
            }
            tried += 1;
            debug!(candidate = %candidate, "trying servers");
            match self.provider.episode_servers(candidate).await {
                Ok(payload) => match normalize_servers(&payload) {
                    Some(servers) => {
                        self.record(candidate, None, None, ProbeOutcome::Accepted);
                        return Ok((candidate.clone(), servers));
                    }
                    None => {
                        debug!(candidate = %candidate, "no servers returned");
                        self.record(candidate, None, None, ProbeOutcome::Empty);
                    }
                },
                Err(err) => {
                    warn!(candidate = %candidate, error = %err, "server probe failed");
                    self.record(candidate, None, None, ProbeOutcome::Failed(err.to_string()));
                }
            }
        }
        Err(Failure::bare(AnigateError::NoServersAvailable { tried }))
    }

    async fn fetch_sources(
        &self,
        episode_id: &str,
        server: &str,
        category: Category,
    ) -> Result<SourceList, AnigateError> {
        let payload = self
            .provider
            .episode_sources(episode_id, server, category)
            .await?;
        Ok(normalize_sources(&payload))
    }

    fn record(
        &self,
        candidate: &str,
        category: Option<Category>,
        server: Option<&str>,
        outcome: ProbeOutcome,
    ) {
        if let Some(sink) = &self.diagnostics {
            let _ = sink.send(ProbeAttempt::new(candidate, category, server, outcome));
        }
    }
}

// --- Response shape normalization ---

fn truthy(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| match v {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    })
}

/// Accepts `{sub, dub, raw, episodeNo}` either flat or nested under `data`.
/// The nested shape is tried when the flat one yields no usable server.
pub fn normalize_servers(payload: &Value) -> Option<ServerSet> {
    let object = payload.as_object()?;
    let flat = server_set(object);
    if !flat.is_empty() {
        return Some(flat);
    }
    let nested = server_set(object.get("data").and_then(Value::as_object)?);
    (!nested.is_empty()).then_some(nested)
}

fn server_set(object: &Map<String, Value>) -> ServerSet {
    ServerSet {
        sub: parse_servers(object.get("sub"), Category::Sub),
        dub: parse_servers(object.get("dub"), Category::Dub),
        raw: parse_servers(object.get("raw"), Category::Raw),
        episode_number: ["episodeNo", "episode", "ep"]
            .iter()
            .find_map(|key| object.get(*key).and_then(as_number)),
    }
}

fn parse_servers(list: Option<&Value>, category: Category) -> Vec<ServerDescriptor> {
    list.and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let name = string_field(entry, &["serverName", "name"]).unwrap_or_default();
                    let id = string_field(entry, &["serverId", "id"]).unwrap_or_default();
                    (!name.is_empty() || !id.is_empty()).then_some(ServerDescriptor {
                        name,
                        id,
                        category,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Accepts a bare array, `{sources: [...]}` or `{data: [...]}`, optionally
/// wrapped once more under `data`.
pub fn normalize_sources(payload: &Value) -> SourceList {
    let payload = truthy(payload.get("data")).unwrap_or(payload);
    let items = payload
        .as_array()
        .or_else(|| payload.get("sources").and_then(Value::as_array))
        .or_else(|| payload.get("data").and_then(Value::as_array));

    let sources = items
        .map(|items| items.iter().filter_map(parse_source).collect())
        .unwrap_or_default();

    let headers = payload
        .get("headers")
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();

    let tracks = payload
        .get("tracks")
        .or_else(|| payload.get("subtitles"))
        .and_then(Value::as_array)
        .map(|tracks| tracks.iter().filter_map(parse_track).collect())
        .unwrap_or_default();

    SourceList {
        sources,
        headers,
        tracks,
    }
}

fn parse_source(item: &Value) -> Option<SourceDescriptor> {
    let url = string_field(item, &["url", "file"]).filter(|url| !url.is_empty())?;
    let is_m3u8 = item
        .get("isM3U8")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| {
            item.get("type").and_then(Value::as_str) == Some("hls") || url.contains(".m3u8")
        });
    Some(SourceDescriptor {
        quality: string_field(item, &["quality"]),
        url,
        is_m3u8,
    })
}

fn parse_track(item: &Value) -> Option<SubtitleTrack> {
    let file = string_field(item, &["file", "url"]).filter(|f| !f.is_empty())?;
    let kind = string_field(item, &["kind"]);
    if kind.as_deref() == Some("thumbnails") {
        return None;
    }
    Some(SubtitleTrack {
        file,
        label: string_field(item, &["label", "lang"]),
        kind,
    })
}

/// First present key rendered as a string; numbers are stringified.
fn string_field(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match item.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn as_number(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Scripted provider: unknown requests fail like a 404 would.
    #[derive(Default)]
    struct ScriptedProvider {
        servers: HashMap<String, Result<Value, AnigateError>>,
        sources: HashMap<(String, String, Category), Result<Value, AnigateError>>,
        server_calls: RefCell<Vec<String>>,
        source_calls: RefCell<Vec<(String, String, Category)>>,
    }

    impl ScriptedProvider {
        fn servers(mut self, id: &str, response: Result<Value, AnigateError>) -> Self {
            self.servers.insert(id.to_string(), response);
            self
        }

        fn sources(
            mut self,
            id: &str,
            server: &str,
            category: Category,
            response: Result<Value, AnigateError>,
        ) -> Self {
            self.sources
                .insert((id.to_string(), server.to_string(), category), response);
            self
        }
    }

    fn not_found() -> AnigateError {
        AnigateError::UpstreamClientError {
            status: 404,
            message: "External API error: 404".into(),
        }
    }

    impl EpisodeProvider for ScriptedProvider {
        async fn episode_servers(&self, episode_id: &str) -> Result<Value, AnigateError> {
            self.server_calls.borrow_mut().push(episode_id.to_string());
            self.servers
                .get(episode_id)
                .cloned()
                .unwrap_or_else(|| Err(not_found()))
        }

        async fn episode_sources(
            &self,
            episode_id: &str,
            server: &str,
            category: Category,
        ) -> Result<Value, AnigateError> {
            let key = (episode_id.to_string(), server.to_string(), category);
            self.source_calls.borrow_mut().push(key.clone());
            self.sources.get(&key).cloned().unwrap_or_else(|| Err(not_found()))
        }
    }

    fn hls(url: &str) -> Value {
        json!({ "sources": [{ "url": url, "isM3U8": true, "quality": "1080p" }] })
    }

    #[tokio::test]
    async fn accepts_third_candidate_after_two_misses() {
        let provider = ScriptedProvider::default()
            .servers("frieren-18542?ep=3", Err(not_found()))
            .servers("frieren-18542-3", Ok(json!({ "sub": [], "dub": [] })))
            .servers(
                "frieren-18542?ep=03",
                Ok(json!({ "data": { "sub": [{ "serverName": "hd-1", "serverId": 4 }], "episodeNo": 3 } })),
            )
            .sources("frieren-18542?ep=03", "hd-1", Category::Sub, Ok(hls("https://cdn/a.m3u8")));
        let engine = DiscoveryEngine::new(provider, 40);

        let ready = engine.discover("frieren-18542?ep=3").await.expect("ready");

        assert_eq!(engine.provider().server_calls.borrow().len(), 3);
        assert_eq!(ready.episode_id, "frieren-18542?ep=03");
        assert_eq!(ready.servers.episode_number, Some(3));
        assert_eq!(ready.category, Category::Sub);
        assert_eq!(ready.server, "hd-1");
        assert_eq!(ready.sources.sources[0].url, "https://cdn/a.m3u8");
    }

    #[tokio::test]
    async fn falls_through_to_second_dub_server() {
        let provider = ScriptedProvider::default()
            .servers(
                "x-1",
                Ok(json!({
                    "sub": [],
                    "dub": [
                        { "serverName": "hd-1", "serverId": "4" },
                        { "serverName": "hd-2", "serverId": "1" }
                    ]
                })),
            )
            .sources("x-1", "hd-2", Category::Dub, Ok(hls("https://cdn/dub.m3u8")));
        let engine = DiscoveryEngine::new(provider, 40);

        let ready = engine.discover("x-1").await.expect("ready");

        assert_eq!(ready.category, Category::Dub);
        assert_eq!(ready.server, "hd-2");
        let calls = engine.provider().source_calls.borrow();
        let servers: Vec<&str> = calls.iter().map(|(_, s, _)| s.as_str()).collect();
        assert_eq!(servers, vec!["hd-1", "4", "hd-2"]);
    }

    #[tokio::test]
    async fn server_id_is_tried_after_empty_name() {
        let provider = ScriptedProvider::default()
            .servers("x-1", Ok(json!({ "sub": [{ "serverName": "megacloud", "serverId": 4 }] })))
            .sources("x-1", "megacloud", Category::Sub, Ok(json!({ "sources": [] })))
            .sources("x-1", "4", Category::Sub, Ok(json!([{ "url": "https://cdn/v.mp4" }])));
        let engine = DiscoveryEngine::new(provider, 40);

        let ready = engine.discover("x-1").await.expect("ready");
        assert_eq!(ready.server, "4");
        assert!(!ready.sources.sources[0].is_m3u8);
    }

    #[tokio::test]
    async fn exhausted_candidates_report_no_servers() {
        let engine = DiscoveryEngine::new(ScriptedProvider::default(), 40);
        let failure = engine.discover("x?ep=2").await.expect_err("no servers");
        assert_eq!(failure.error, AnigateError::NoServersAvailable { tried: 3 });
        assert!(failure.servers.is_none());
    }

    #[tokio::test]
    async fn exhausted_sources_keep_server_set() {
        let provider = ScriptedProvider::default()
            .servers("x-1", Ok(json!({ "raw": [{ "serverName": "hd-1" }] })));
        let engine = DiscoveryEngine::new(provider, 40);

        let failure = engine.discover("x-1").await.expect_err("no sources");
        assert_eq!(failure.error, AnigateError::NoSourcesAvailable);
        assert_eq!(failure.episode_id.as_deref(), Some("x-1"));
        assert_eq!(failure.servers.map(|s| s.raw.len()), Some(1));
    }

    #[tokio::test]
    async fn invalid_identifier_issues_no_requests() {
        let engine = DiscoveryEngine::new(ScriptedProvider::default(), 40);
        let failure = engine.discover("undefined").await.expect_err("invalid");
        assert!(matches!(failure.error, AnigateError::InvalidIdentifier(_)));
        assert!(engine.provider().server_calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn probe_budget_bounds_requests() {
        let engine = DiscoveryEngine::new(ScriptedProvider::default(), 2);
        let failure = engine.discover("x?ep=2").await.expect_err("budget");
        assert_eq!(failure.error, AnigateError::NoServersAvailable { tried: 2 });
        assert_eq!(engine.provider().server_calls.borrow().len(), 2);
    }

    #[tokio::test]
    async fn identical_responses_give_identical_ready_state() {
        let build = || {
            ScriptedProvider::default()
                .servers("x-1", Ok(json!({ "sub": [{ "serverName": "hd-1" }] })))
                .sources("x-1", "hd-1", Category::Sub, Ok(hls("https://cdn/a.m3u8")))
        };
        let first = DiscoveryEngine::new(build(), 40).discover("x-1").await;
        let second = DiscoveryEngine::new(build(), 40).discover("x-1").await;
        assert_eq!(first, second);
        assert!(first.is_ok());
    }

    #[tokio::test]
    async fn manual_probe_reports_empty_server() {
        let provider = ScriptedProvider::default()
            .sources("x-1", "hd-2", Category::Raw, Ok(json!({ "data": [] })));
        let engine = DiscoveryEngine::new(provider, 40);

        let err = engine
            .probe_server("x-1", "hd-2", Category::Raw)
            .await
            .expect_err("empty");
        assert_eq!(
            err,
            AnigateError::NoSourcesForServer {
                server: "hd-2".into(),
                category: Category::Raw
            }
        );
    }

    #[tokio::test]
    async fn diagnostics_channel_sees_every_probe() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let provider = ScriptedProvider::default()
            .servers("x-1", Ok(json!({ "sub": [{ "serverName": "hd-1" }] })))
            .sources("x-1", "hd-1", Category::Sub, Ok(hls("https://cdn/a.m3u8")));
        let engine = DiscoveryEngine::new(provider, 40).with_diagnostics(tx);

        engine.discover("x-1").await.expect("ready");
        drop(engine);

        let mut outcomes = Vec::new();
        while let Some(attempt) = rx.recv().await {
            outcomes.push((attempt.candidate, attempt.server, attempt.outcome));
        }
        assert_eq!(
            outcomes,
            vec![
                ("x-1".to_string(), None, ProbeOutcome::Accepted),
                ("x-1".to_string(), Some("hd-1".to_string()), ProbeOutcome::Accepted),
            ]
        );
    }

    #[test]
    fn sources_accept_every_known_shape() {
        let item = json!({ "url": "https://cdn/a.m3u8", "type": "hls" });
        for payload in [
            json!([item.clone()]),
            json!({ "sources": [item.clone()] }),
            json!({ "data": [item.clone()] }),
            json!({ "data": { "sources": [item.clone()] } }),
        ] {
            let list = normalize_sources(&payload);
            assert_eq!(list.len(), 1, "payload {payload}");
            assert!(list.sources[0].is_m3u8);
        }
        assert!(normalize_sources(&json!({ "sources": "nope" })).is_empty());
        assert!(normalize_sources(&Value::Null).is_empty());
    }

    #[test]
    fn sources_carry_headers_and_subtitles() {
        let list = normalize_sources(&json!({
            "headers": { "Referer": "https://megacloud.blog/" },
            "sources": [{ "url": "https://cdn/a.m3u8", "isM3U8": true }],
            "tracks": [
                { "file": "https://cdn/en.vtt", "label": "English", "kind": "captions" },
                { "file": "https://cdn/thumbs.vtt", "kind": "thumbnails" }
            ]
        }));
        assert_eq!(list.headers["Referer"], "https://megacloud.blog/");
        assert_eq!(list.tracks.len(), 1);
        assert_eq!(
            list.english_subtitle().map(|t| t.file.as_str()),
            Some("https://cdn/en.vtt")
        );
    }

    #[test]
    fn servers_coalesce_episode_number_aliases() {
        let servers = normalize_servers(&json!({ "dub": [{ "serverId": 1 }], "ep": "12" }))
            .expect("servers");
        assert_eq!(servers.episode_number, Some(12));
        assert!(servers.sub.is_empty() && servers.raw.is_empty());
        assert_eq!(servers.dub[0].id, "1");

        let servers =
            normalize_servers(&json!({ "sub": [{ "serverName": "hd-1" }] })).expect("servers");
        assert_eq!(servers.episode_number, None);
    }

    #[test]
    fn servers_require_a_non_empty_category() {
        assert!(normalize_servers(&json!({ "sub": [], "dub": [], "raw": [] })).is_none());
        assert!(normalize_servers(&json!({ "data": { "sub": [] } })).is_none());
        assert!(normalize_servers(&json!({ "sub": [{ "unrelated": true }] })).is_none());
        assert!(normalize_servers(&json!([1, 2])).is_none());
    }

    #[test]
    fn unusable_flat_entries_fall_back_to_nested_data() {
        let servers = normalize_servers(&json!({
            "sub": [{}],
            "data": { "sub": [{ "serverName": "hd-2", "serverId": 4 }], "episodeNo": 7 }
        }))
        .expect("nested servers");
        assert_eq!(servers.sub[0].name, "hd-2");
        assert_eq!(servers.episode_number, Some(7));
    }
}
