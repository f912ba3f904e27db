//! State of the watch view for one episode at a time.
//!
//! Each navigation bumps an epoch; resolutions carry the epoch they were
//! started under and every state write is checked against it, so a late
//! answer for a previous episode never lands on the current one.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::discovery::{DiscoveryEngine, DiscoveryState, Progress, Ready};
use crate::error::AnigateError;
use crate::providers::EpisodeProvider;
use crate::types::{Category, SourceList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Default)]
struct Inner {
    epoch: u64,
    episode: String,
    state: DiscoveryState,
}

#[derive(Debug, Clone, Default)]
pub struct WatchSession {
    inner: Arc<Mutex<Inner>>,
}

impl WatchSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switches to `raw_id`, resetting state and invalidating older tickets.
    pub fn navigate(&self, raw_id: &str) -> Ticket {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.episode = raw_id.to_string();
        inner.state = DiscoveryState::Idle;
        debug!(epoch = inner.epoch, raw_id, "navigated");
        Ticket(inner.epoch)
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.lock().epoch == ticket.0
    }

    #[cfg(test)]
    pub fn state(&self) -> DiscoveryState {
        self.lock().state.clone()
    }

    pub fn episode(&self) -> String {
        self.lock().episode.clone()
    }

    fn apply(&self, ticket: Ticket, state: DiscoveryState) -> bool {
        let mut inner = self.lock();
        if inner.epoch != ticket.0 {
            debug!(stale = ticket.0, current = inner.epoch, "discarding stale state");
            return false;
        }
        inner.state = state;
        true
    }

    /// Runs discovery for the episode `ticket` was issued for.
    ///
    /// Returns the settled state, or `None` if the session moved on first.
    pub async fn load<P: EpisodeProvider>(
        &self,
        engine: &DiscoveryEngine<P>,
        ticket: Ticket,
    ) -> Option<DiscoveryState> {
        let raw_id = {
            let inner = self.lock();
            if inner.epoch != ticket.0 {
                return None;
            }
            inner.episode.clone()
        };

        let mut guard = TicketGuard {
            session: self,
            ticket,
        };
        let settled = match engine.discover_with(&raw_id, &mut guard).await {
            Ok(ready) => DiscoveryState::Ready(ready),
            Err(failure) if failure.error == AnigateError::Cancelled => return None,
            Err(failure) => DiscoveryState::Failed(failure),
        };
        self.apply(ticket, settled.clone()).then_some(settled)
    }

    /// Manual server choice after the automatic scan settled.
    ///
    /// Requires a resolved server set; on success the session becomes
    /// `Ready` with the chosen server.
    pub async fn select_server<P: EpisodeProvider>(
        &self,
        engine: &DiscoveryEngine<P>,
        server: &str,
        category: Category,
    ) -> Result<SourceList, AnigateError> {
        let (ticket, episode_id, servers) = {
            let inner = self.lock();
            let resolved = match &inner.state {
                DiscoveryState::Ready(ready) => {
                    Some((ready.episode_id.clone(), ready.servers.clone()))
                }
                DiscoveryState::Failed(failure)
                    if failure.error == AnigateError::NoSourcesAvailable =>
                {
                    failure.episode_id.clone().zip(failure.servers.clone())
                }
                _ => None,
            };
            let (episode_id, servers) = resolved.ok_or(AnigateError::SessionNotResolved)?;
            (Ticket(inner.epoch), episode_id, servers)
        };

        let sources = engine.probe_server(&episode_id, server, category).await?;
        let ready = Ready {
            episode_id,
            servers,
            category,
            server: server.to_string(),
            sources: sources.clone(),
        };
        if !self.apply(ticket, DiscoveryState::Ready(ready)) {
            return Err(AnigateError::Cancelled);
        }
        Ok(sources)
    }
}

struct TicketGuard<'a> {
    session: &'a WatchSession,
    ticket: Ticket,
}

impl Progress for TicketGuard<'_> {
    fn enter(&mut self, state: &DiscoveryState) -> bool {
        self.session.apply(self.ticket, state.clone())
    }

    fn is_current(&self) -> bool {
        self.session.is_current(self.ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Failure;
    use serde_json::{Value, json};
    use tokio::sync::Notify;

    /// Answers every id; requests for `gated_id` at the gated stage wait for
    /// the gate first.
    struct GatedProvider {
        gated_id: &'static str,
        gate_sources: bool,
        gate: Notify,
    }

    impl GatedProvider {
        fn new(gated_id: &'static str, gate_sources: bool) -> Self {
            Self {
                gated_id,
                gate_sources,
                gate: Notify::new(),
            }
        }
    }

    impl EpisodeProvider for GatedProvider {
        async fn episode_servers(&self, episode_id: &str) -> Result<Value, AnigateError> {
            if episode_id == self.gated_id && !self.gate_sources {
                self.gate.notified().await;
            }
            Ok(json!({ "sub": [{ "serverName": "hd-1" }] }))
        }

        async fn episode_sources(
            &self,
            episode_id: &str,
            server: &str,
            _category: Category,
        ) -> Result<Value, AnigateError> {
            if episode_id == self.gated_id && self.gate_sources {
                self.gate.notified().await;
            }
            if server == "empty" {
                return Ok(json!({ "sources": [] }));
            }
            Ok(json!({ "sources": [{ "url": format!("https://cdn/{episode_id}/{server}.m3u8") }] }))
        }
    }

    fn ready_episode(state: &DiscoveryState) -> Option<&str> {
        match state {
            DiscoveryState::Ready(ready) => Some(ready.episode_id.as_str()),
            _ => None,
        }
    }

    async fn navigate_mid_resolution(gate_sources: bool) {
        let session = WatchSession::new();
        let engine = DiscoveryEngine::new(GatedProvider::new("a-1", gate_sources), 40);

        let stale = session.navigate("a-1");
        let fresh_session = session.clone();
        let switch = async {
            let fresh = fresh_session.navigate("b-2");
            let settled = fresh_session.load(&engine, fresh).await;
            engine.provider().gate.notify_one();
            settled
        };
        let (old, new) = tokio::join!(session.load(&engine, stale), switch);

        assert_eq!(old, None);
        assert_eq!(new.as_ref().and_then(ready_episode), Some("b-2"));
        assert_eq!(ready_episode(&session.state()), Some("b-2"));
        assert_eq!(session.episode(), "b-2");
    }

    #[tokio::test]
    async fn stale_server_probe_is_discarded() {
        navigate_mid_resolution(false).await;
    }

    #[tokio::test]
    async fn stale_ready_state_is_discarded() {
        navigate_mid_resolution(true).await;
    }

    #[tokio::test]
    async fn load_settles_state() {
        let session = WatchSession::new();
        let engine = DiscoveryEngine::new(GatedProvider::new("none", false), 40);
        let ticket = session.navigate("x-1");

        let settled = session.load(&engine, ticket).await.expect("current");
        assert!(settled.is_settled());
        assert_eq!(session.state(), settled);
    }

    #[tokio::test]
    async fn invalid_identifier_settles_as_failure() {
        let session = WatchSession::new();
        let engine = DiscoveryEngine::new(GatedProvider::new("none", false), 40);
        let ticket = session.navigate("");

        let settled = session.load(&engine, ticket).await;
        assert!(matches!(
            settled,
            Some(DiscoveryState::Failed(Failure {
                error: AnigateError::InvalidIdentifier(_),
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn manual_selection_requires_resolved_servers() {
        let session = WatchSession::new();
        let engine = DiscoveryEngine::new(GatedProvider::new("none", false), 40);
        session.navigate("x-1");

        let err = session
            .select_server(&engine, "hd-1", Category::Sub)
            .await
            .expect_err("idle session");
        assert_eq!(err, AnigateError::SessionNotResolved);
    }

    #[tokio::test]
    async fn manual_selection_switches_server() {
        let session = WatchSession::new();
        let engine = DiscoveryEngine::new(GatedProvider::new("none", false), 40);
        let ticket = session.navigate("x-1");
        session.load(&engine, ticket).await.expect("current");

        let sources = session
            .select_server(&engine, "hd-2", Category::Dub)
            .await
            .expect("sources");
        assert_eq!(sources.sources[0].url, "https://cdn/x-1/hd-2.m3u8");
        match session.state() {
            DiscoveryState::Ready(ready) => {
                assert_eq!(ready.server, "hd-2");
                assert_eq!(ready.category, Category::Dub);
            }
            other => panic!("expected ready, got {other:?}"),
        }

        let err = session
            .select_server(&engine, "empty", Category::Sub)
            .await
            .expect_err("empty server");
        assert!(matches!(err, AnigateError::NoSourcesForServer { .. }));
        assert!(matches!(session.state(), DiscoveryState::Ready(ref r) if r.server == "hd-2"));
    }
}
