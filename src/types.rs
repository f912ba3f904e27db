use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Sub,
    Dub,
    Raw,
}

impl Category {
    /// Order in which the automatic source scan visits categories.
    pub const PRIORITY: [Category; 3] = [Category::Sub, Category::Dub, Category::Raw];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Sub => "sub",
            Category::Dub => "dub",
            Category::Raw => "raw",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::Sub => "Subtitled (Sub)",
            Category::Dub => "Dubbed (Dub)",
            Category::Raw => "Raw",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sub" => Ok(Category::Sub),
            "dub" => Ok(Category::Dub),
            "raw" => Ok(Category::Raw),
            other => Err(format!("unknown category '{other}' (expected sub, dub or raw)")),
        }
    }
}

/// One upstream streaming backend for one language track.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub id: String,
    pub category: Category,
}

impl ServerDescriptor {
    /// Identifiers to request sources with: name first, then id, without
    /// blanks or duplicates.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::with_capacity(2);
        for candidate in [self.name.as_str(), self.id.as_str()] {
            if !candidate.is_empty() && !ids.contains(&candidate) {
                ids.push(candidate);
            }
        }
        ids
    }

    pub fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else if !self.id.is_empty() {
            &self.id
        } else {
            "Unknown"
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ServerSet {
    pub sub: Vec<ServerDescriptor>,
    pub dub: Vec<ServerDescriptor>,
    pub raw: Vec<ServerDescriptor>,
    pub episode_number: Option<u32>,
}

impl ServerSet {
    pub fn get(&self, category: Category) -> &[ServerDescriptor] {
        match category {
            Category::Sub => &self.sub,
            Category::Dub => &self.dub,
            Category::Raw => &self.raw,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sub.is_empty() && self.dub.is_empty() && self.raw.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sub.len() + self.dub.len() + self.raw.len()
    }

    /// All servers in scan order.
    pub fn iter(&self) -> impl Iterator<Item = &ServerDescriptor> {
        Category::PRIORITY
            .into_iter()
            .flat_map(move |category| self.get(category).iter())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub url: String,
    pub quality: Option<String>,
    pub is_m3u8: bool,
}

impl SourceDescriptor {
    fn quality_rank(&self) -> u32 {
        let Some(quality) = self.quality.as_deref() else {
            return 0;
        };
        let digits: String = quality
            .trim()
            .chars()
            .take_while(|ch| ch.is_ascii_digit())
            .collect();
        digits.parse().unwrap_or(0)
    }

    pub fn label(&self) -> String {
        let kind = if self.is_m3u8 { "HLS" } else { "MP4" };
        format!(
            "{} ({})",
            self.quality.as_deref().unwrap_or("auto"),
            kind
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubtitleTrack {
    pub file: String,
    pub label: Option<String>,
    pub kind: Option<String>,
}

impl SubtitleTrack {
    pub fn is_english(&self) -> bool {
        self.label
            .as_deref()
            .is_some_and(|label| label.to_ascii_lowercase().starts_with("english"))
    }
}

/// Non-empty result of probing one server.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SourceList {
    pub sources: Vec<SourceDescriptor>,
    pub headers: BTreeMap<String, String>,
    pub tracks: Vec<SubtitleTrack>,
}

impl SourceList {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Highest leading quality number wins; the earlier source wins ties.
    pub fn best(&self) -> Option<&SourceDescriptor> {
        self.sources
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.quality_rank().cmp(&b.quality_rank()).then(ib.cmp(ia)))
            .map(|(_, source)| source)
    }

    pub fn english_subtitle(&self) -> Option<&SubtitleTrack> {
        self.tracks.iter().find(|track| track.is_english())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "lowercase")]
pub enum ProbeOutcome {
    Accepted,
    Empty,
    Failed(String),
}

/// Diagnostic record of a single probe request.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeAttempt {
    pub candidate: String,
    pub category: Option<Category>,
    pub server: Option<String>,
    pub outcome: ProbeOutcome,
    pub at: DateTime<Utc>,
}

impl ProbeAttempt {
    pub fn new(
        candidate: &str,
        category: Option<Category>,
        server: Option<&str>,
        outcome: ProbeOutcome,
    ) -> Self {
        Self {
            candidate: candidate.to_string(),
            category,
            server: server.map(str::to_string),
            outcome,
            at: Utc::now(),
        }
    }
}
