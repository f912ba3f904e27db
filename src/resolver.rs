//! Candidate generation for loosely formatted episode identifiers.
//!
//! Upstream accepts episode ids shaped like `title-slug?ep=12`, while route
//! parameters and older links use `title-slug-12`. The mapping between the two
//! is lossy when a slug itself ends in digits, so both readings are offered as
//! separate candidates and the caller probes them in order.

use percent_encoding::percent_decode_str;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::AnigateError;

pub const EPISODE_MARKER: &str = "?ep=";

/// Literal the page layer produces when the route parameter is absent.
const MISSING_PLACEHOLDER: &str = "undefined";

static TRAILING_EPISODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)-(\d+)$").expect("valid trailing episode pattern"));

/// Ordered, de-duplicated candidates for `raw`. Empty input yields nothing.
pub fn candidates(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if raw.is_empty() {
        return out;
    }
    push_unique(&mut out, raw.to_string());

    if let Some((slug, episode)) = raw.split_once(EPISODE_MARKER) {
        push_unique(&mut out, format!("{slug}-{episode}"));
        if episode.len() == 1 && episode.chars().all(|ch| ch.is_ascii_digit()) {
            push_unique(&mut out, format!("{slug}{EPISODE_MARKER}0{episode}"));
        }
    } else if let Some(caps) = TRAILING_EPISODE.captures(raw) {
        push_unique(&mut out, format!("{}{EPISODE_MARKER}{}", &caps[1], &caps[2]));
    }

    out
}

/// Validates a route-level identifier and returns its candidates.
///
/// Percent-encoded input (as it appears in a watch route) is decoded first.
pub fn resolve(raw: &str) -> Result<Vec<String>, AnigateError> {
    let decoded = decode_identifier(raw.trim());
    if decoded.is_empty() || decoded == MISSING_PLACEHOLDER {
        return Err(AnigateError::InvalidIdentifier(raw.to_string()));
    }
    Ok(candidates(&decoded))
}

/// Title slug with any trailing `-<digits>` removed.
pub fn strip_trailing_number(slug: &str) -> &str {
    match TRAILING_EPISODE.captures(slug).and_then(|caps| caps.get(1)) {
        Some(head) => head.as_str(),
        None => slug,
    }
}

fn decode_identifier(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn push_unique(out: &mut Vec<String>, candidate: String) {
    if !out.contains(&candidate) {
        out.push(candidate);
    }
}
