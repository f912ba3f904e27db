use serde_json::Value;

use crate::error::AnigateError;
use crate::types::Category;

pub mod aniwatch;

/// Episode endpoints the discovery engine probes.
///
/// Payloads are returned unnormalized; the engine owns shape tolerance.
pub trait EpisodeProvider {
    async fn episode_servers(&self, episode_id: &str) -> Result<Value, AnigateError>;
    async fn episode_sources(
        &self,
        episode_id: &str,
        server: &str,
        category: Category,
    ) -> Result<Value, AnigateError>;
}

pub trait CatalogProvider {
    async fn home(&self) -> Result<Value, AnigateError>;
    async fn search(&self, query: &str, page: u32) -> Result<Value, AnigateError>;
    async fn category(&self, name: &str, page: u32) -> Result<Value, AnigateError>;
    async fn anime_info(&self, anime_id: &str) -> Result<Value, AnigateError>;
    async fn episodes(&self, anime_id: &str) -> Result<Value, AnigateError>;
}
