use anyhow::{Result, anyhow, bail};
use dialoguer::Select;
use dialoguer::theme::ColorfulTheme;
use tokio::process::Command;
use tracing::info;

use crate::types::{SourceDescriptor, SourceList};

pub const PLAYER_ENV_KEY: &str = "ANIGATE_PLAYER";

pub fn detect_player() -> String {
    std::env::var(PLAYER_ENV_KEY)
        .ok()
        .filter(|val| !val.trim().is_empty())
        .unwrap_or_else(|| "mpv".to_string())
}

pub fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

/// Best-ranked source, or an interactive pick when `pick` is set.
pub fn choose_source(list: &SourceList, pick: bool) -> Result<&SourceDescriptor> {
    if !pick || list.len() == 1 {
        return list
            .best()
            .ok_or_else(|| anyhow!("no playable source in the list"));
    }
    let labels: Vec<String> = list.sources.iter().map(SourceDescriptor::label).collect();
    let selection = Select::with_theme(&theme())
        .with_prompt("Select a source")
        .items(&labels)
        .default(0)
        .interact_opt()?;
    let Some(idx) = selection else {
        bail!("Source selection cancelled.");
    };
    Ok(&list.sources[idx])
}

fn player_args(source: &SourceDescriptor, list: &SourceList, title: &str) -> Vec<String> {
    let mut args = vec![
        "--quiet".to_string(),
        "--terminal=no".to_string(),
        format!("--force-media-title={title}"),
    ];
    if let Some(track) = list.english_subtitle() {
        args.push(format!("--sub-file={}", track.file));
    }
    for (key, value) in &list.headers {
        if key.eq_ignore_ascii_case("user-agent") {
            args.push(format!("--user-agent={value}"));
        } else if key.eq_ignore_ascii_case("referer") {
            args.push(format!("--referrer={value}"));
            args.push(format!("--http-header-fields-append=Referer: {value}"));
        } else {
            args.push(format!("--http-header-fields-append={key}: {value}"));
        }
    }
    args.push(source.url.clone());
    args
}

pub async fn launch_player(source: &SourceDescriptor, list: &SourceList, title: &str) -> Result<()> {
    let player = detect_player();
    info!(player = %player, url = %source.url, "launching player");
    let status = match Command::new(&player)
        .args(player_args(source, list, title))
        .status()
        .await
    {
        Ok(status) => status,
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                return Err(anyhow!(
                    "Player '{}' not found. Install mpv or set {} to a valid command.",
                    player,
                    PLAYER_ENV_KEY
                ));
            }
            return Err(anyhow!(err).context(format!("failed to launch player '{player}'")));
        }
    };

    if !status.success() {
        bail!("player exited with status {status}");
    }
    Ok(())
}
