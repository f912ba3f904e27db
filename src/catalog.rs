use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::AnigateError;
use crate::providers::{CatalogProvider, EpisodeProvider};
use crate::resolver::{EPISODE_MARKER, strip_trailing_number};

/// Episodes checked by [`probe_formats`].
const FORMAT_PROBE_EPISODES: usize = 3;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EpisodeCounts {
    #[serde(default)]
    pub sub: Option<u32>,
    #[serde(default)]
    pub dub: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AnimeSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub episodes: EpisodeCounts,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl AnimeSummary {
    pub fn label(&self) -> String {
        let mut label = format!("{} ({})", self.name, self.id);
        if let Some(sub) = self.episodes.sub {
            label.push_str(&format!(" [sub {sub}"));
            if let Some(dub) = self.episodes.dub {
                label.push_str(&format!(", dub {dub}"));
            }
            label.push(']');
        }
        label
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnimePage {
    pub animes: Vec<AnimeSummary>,
    pub current_page: u32,
    pub total_pages: Option<u32>,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnimeDetail {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub episodes: EpisodeCounts,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EpisodeEntry {
    pub number: u32,
    pub title: String,
    pub episode_id: String,
    pub is_filler: bool,
}

fn summaries(list: &[Value]) -> Vec<AnimeSummary> {
    list.iter()
        .filter_map(|item| serde_json::from_value::<AnimeSummary>(item.clone()).ok())
        .filter(|anime| !anime.id.is_empty())
        .collect()
}

/// Search and category payloads: `{animes, currentPage, totalPages, hasNextPage}`.
pub fn anime_page(payload: &Value) -> AnimePage {
    let animes = payload
        .get("animes")
        .and_then(Value::as_array)
        .or_else(|| payload.as_array())
        .map(|list| summaries(list))
        .unwrap_or_default();
    AnimePage {
        animes,
        current_page: payload
            .get("currentPage")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1),
        total_pages: payload
            .get("totalPages")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        has_next_page: payload
            .get("hasNextPage")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Home payload sections: every non-empty `...Animes` array.
pub fn home_sections(payload: &Value) -> Vec<(String, Vec<AnimeSummary>)> {
    payload
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter(|(key, _)| key.ends_with("Animes"))
                .filter_map(|(key, value)| {
                    let list = summaries(value.as_array()?);
                    (!list.is_empty()).then(|| (key.clone(), list))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Detail payloads nest the interesting part under `anime.info`.
pub fn anime_detail(payload: &Value) -> AnimeDetail {
    let info = payload
        .get("anime")
        .and_then(|anime| anime.get("info"))
        .unwrap_or(payload);
    let text = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);
    let episodes = info
        .get("stats")
        .and_then(|stats| stats.get("episodes"))
        .or_else(|| info.get("episodes"))
        .and_then(|counts| serde_json::from_value(counts.clone()).ok())
        .unwrap_or_default();
    AnimeDetail {
        id: text("id").unwrap_or_default(),
        name: text("name").unwrap_or_default(),
        description: text("description"),
        episodes,
    }
}

fn episode_number(item: &Value) -> Option<u32> {
    ["number", "episodeNum", "episode"].iter().find_map(|key| {
        match item.get(*key)? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|n| *n > 0)
    })
}

/// Episode list with the identifier each entry should be watched under.
pub fn normalize_episodes(anime_id: &str, payload: &Value) -> Vec<EpisodeEntry> {
    let list = payload
        .get("episodes")
        .and_then(Value::as_array)
        .or_else(|| payload.as_array())
        .or_else(|| {
            payload
                .get("data")
                .and_then(|data| data.get("episodes"))
                .and_then(Value::as_array)
        });
    let Some(list) = list else {
        return Vec::new();
    };

    list.iter()
        .enumerate()
        .map(|(index, item)| {
            let number = episode_number(item)
                .unwrap_or_else(|| u32::try_from(index + 1).unwrap_or(u32::MAX));
            let title = item
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|title| !title.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Episode {number}"));
            let episode_id = item
                .get("episodeId")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .or_else(|| {
                    item.get("id")
                        .and_then(Value::as_str)
                        .filter(|id| id.contains(EPISODE_MARKER))
                })
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!(
                        "{}{EPISODE_MARKER}{number}",
                        strip_trailing_number(anime_id)
                    )
                });
            EpisodeEntry {
                number,
                title,
                episode_id,
                is_filler: item
                    .get("isFiller")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatAttempt {
    pub episode_number: u32,
    pub original_id: String,
    pub format: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatReport {
    Working {
        format: String,
        episode: EpisodeEntry,
        attempts: Vec<FormatAttempt>,
    },
    NotFound {
        attempts: Vec<FormatAttempt>,
        sample: Vec<EpisodeEntry>,
    },
}

fn format_candidates(anime_id: &str, episode: &EpisodeEntry) -> Vec<String> {
    let mut formats = vec![
        episode.episode_id.clone(),
        format!("{anime_id}{EPISODE_MARKER}{}", episode.number),
    ];
    if let Some((_, fragment)) = episode.episode_id.split_once(EPISODE_MARKER) {
        formats.push(format!("{anime_id}{EPISODE_MARKER}{fragment}"));
    }
    let mut unique: Vec<String> = Vec::with_capacity(formats.len());
    for format in formats {
        if !unique.contains(&format) {
            unique.push(format);
        }
    }
    unique
}

/// Finds an episode id shape the servers endpoint answers for `anime_id`.
pub async fn probe_formats<P>(api: &P, anime_id: &str) -> Result<FormatReport, AnigateError>
where
    P: CatalogProvider + EpisodeProvider,
{
    let payload = api.episodes(anime_id).await?;
    let episodes = normalize_episodes(anime_id, &payload);
    let sample: Vec<EpisodeEntry> = episodes.into_iter().take(FORMAT_PROBE_EPISODES).collect();
    let mut attempts = Vec::new();

    for episode in &sample {
        for format in format_candidates(anime_id, episode) {
            debug!(format = %format, "testing episode id format");
            let outcome = api.episode_servers(&format).await;
            attempts.push(FormatAttempt {
                episode_number: episode.number,
                original_id: episode.episode_id.clone(),
                format: format.clone(),
                error: outcome.as_ref().err().map(ToString::to_string),
            });
            if outcome.is_ok() {
                info!(format = %format, "working format found");
                return Ok(FormatReport::Working {
                    format,
                    episode: episode.clone(),
                    attempts,
                });
            }
        }
    }

    Ok(FormatReport::NotFound { attempts, sample })
}
