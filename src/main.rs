use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dialoguer::Select;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod catalog;
mod config;
mod discovery;
mod error;
mod player;
mod providers;
mod proxy;
mod resolver;
mod session;
mod types;

use catalog::{AnimeSummary, FormatReport};
use config::{Settings, default_config_path};
use discovery::{DiscoveryEngine, DiscoveryState};
use error::AnigateError;
use providers::{CatalogProvider, aniwatch::AniwatchClient};
use proxy::LocalGateway;
use session::WatchSession;
use types::{Category, ProbeAttempt, ProbeOutcome, ServerSet, SourceList};

#[derive(Debug, Parser)]
#[command(
    name = "anigate",
    about = "CORS gateway and episode source discovery for the aniwatch API.",
    version
)]
struct Cli {
    /// Settings file (defaults to the per-user config file when present).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway in the foreground.
    Serve {
        #[arg(long, value_name = "ADDR")]
        bind: Option<SocketAddr>,
    },
    /// Show the home page sections.
    Home,
    Search {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(value_name = "QUERY", required = true)]
        query: Vec<String>,
    },
    /// List a catalog category such as `most-popular`.
    Category {
        name: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    Info {
        anime_id: String,
    },
    Episodes {
        anime_id: String,
    },
    /// Resolve servers and sources for an episode identifier.
    Watch {
        episode_id: String,
        /// Skip the automatic scan result and use this server.
        #[arg(long)]
        server: Option<String>,
        #[arg(long, default_value_t = Category::Sub)]
        category: Category,
        /// Choose the server and source interactively.
        #[arg(long)]
        pick: bool,
        /// Hand the chosen source to the external player.
        #[arg(long)]
        play: bool,
        /// Print every probe that was made.
        #[arg(long)]
        diagnostics: bool,
    },
    /// Find which episode identifier shape the servers endpoint accepts.
    ProbeFormat {
        anime_id: String,
    },
    Health,
    /// Print the effective settings.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let result = run().await;
    if let Err(err) = &result {
        match err.downcast_ref::<AnigateError>() {
            Some(api_err) => eprintln!("error: {}", api_err.user_message()),
            None => eprintln!("error: {err:?}"),
        }
    }
    result
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    init_logging(&settings.log.level);

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                settings.gateway.bind = bind;
            }
            proxy::serve(&settings.gateway).await
        }
        Command::Config => {
            match default_config_path() {
                Some(path) => println!("# default config file: {}", path.display()),
                None => println!("# no per-user config directory"),
            }
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        command => {
            let (client, gateway) = connect(&settings).await?;
            let result = run_client_command(&settings, client, command).await;
            if let Some(mut gateway) = gateway {
                gateway.shutdown().await;
            }
            result
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Client for the configured gateway, or for an in-process one.
async fn connect(settings: &Settings) -> Result<(AniwatchClient, Option<LocalGateway>)> {
    if let Some(base_url) = &settings.client.base_url {
        return Ok((AniwatchClient::from_settings(&settings.client, base_url)?, None));
    }
    let gateway = LocalGateway::start(&settings.gateway, SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let client = AniwatchClient::from_settings(&settings.client, &gateway.api_url())?;
    debug!(base_url = client.base_url(), "using in-process gateway");
    Ok((client, Some(gateway)))
}

async fn run_client_command(
    settings: &Settings,
    client: AniwatchClient,
    command: Command,
) -> Result<()> {
    match command {
        Command::Home => {
            let payload = client.home().await?;
            for (section, animes) in catalog::home_sections(&payload) {
                println!("{section}:");
                print_animes(&animes);
                println!();
            }
        }
        Command::Search { page, query } => {
            let query = query.join(" ");
            let result = catalog::anime_page(&client.search(&query, page).await?);
            if result.animes.is_empty() {
                bail!("No results for \"{query}\"");
            }
            print_animes(&result.animes);
            print_paging(result.current_page, result.total_pages, result.has_next_page);
        }
        Command::Category { name, page } => {
            let result = catalog::anime_page(&client.category(&name, page).await?);
            print_animes(&result.animes);
            print_paging(result.current_page, result.total_pages, result.has_next_page);
        }
        Command::Info { anime_id } => {
            let detail = catalog::anime_detail(&client.anime_info(&anime_id).await?);
            println!("{} ({})", detail.name, detail.id);
            if let Some(sub) = detail.episodes.sub {
                println!("Sub episodes: {sub}");
            }
            if let Some(dub) = detail.episodes.dub {
                println!("Dub episodes: {dub}");
            }
            if let Some(description) = detail.description {
                println!();
                println!("{description}");
            }
        }
        Command::Episodes { anime_id } => {
            let episodes = catalog::normalize_episodes(&anime_id, &client.episodes(&anime_id).await?);
            if episodes.is_empty() {
                bail!("No episodes listed for {anime_id}");
            }
            for episode in episodes {
                let filler = if episode.is_filler { " (filler)" } else { "" };
                println!(
                    "{:>4}  {}{}  [{}]",
                    episode.number, episode.title, filler, episode.episode_id
                );
            }
        }
        Command::ProbeFormat { anime_id } => match catalog::probe_formats(&client, &anime_id).await? {
            FormatReport::Working {
                format,
                episode,
                attempts,
            } => {
                println!(
                    "Working format after {} attempt(s): {format} (episode {}, listed as {})",
                    attempts.len(),
                    episode.number,
                    episode.episode_id
                );
            }
            FormatReport::NotFound { attempts, sample } => {
                println!("No working format among {} episode(s).", sample.len());
                for attempt in attempts {
                    println!(
                        "  ep {:>3}  {}  -> {}",
                        attempt.episode_number,
                        attempt.format,
                        attempt.error.as_deref().unwrap_or("ok")
                    );
                }
            }
        },
        Command::Health => {
            if client.health_check().await {
                println!("API reachable at {}", client.base_url());
            } else {
                bail!("API not reachable at {}", client.base_url());
            }
        }
        Command::Watch {
            episode_id,
            server,
            category,
            pick,
            play,
            diagnostics,
        } => {
            let (sink, probes) = mpsc::unbounded_channel();
            let engine =
                DiscoveryEngine::new(client, settings.discovery.max_probes).with_diagnostics(sink);
            let options = WatchOptions {
                server,
                category,
                pick,
                play,
            };
            let result = watch(&engine, &episode_id, &options).await;
            if diagnostics {
                print_probes(probes);
            }
            result?;
        }
        Command::Serve { .. } | Command::Config => {
            bail!("this command does not talk to the API")
        }
    }
    Ok(())
}

struct WatchOptions {
    server: Option<String>,
    category: Category,
    pick: bool,
    play: bool,
}

async fn watch(
    engine: &DiscoveryEngine<AniwatchClient>,
    raw_id: &str,
    options: &WatchOptions,
) -> Result<()> {
    let session = WatchSession::new();
    let ticket = session.navigate(raw_id);
    let settled = session
        .load(engine, ticket)
        .await
        .ok_or_else(|| anyhow!("resolution for {} was superseded", session.episode()))?;

    let (episode_id, sources) = match settled {
        DiscoveryState::Ready(ready) => {
            println!(
                "Resolved {} on {} [{}]",
                ready.episode_id, ready.server, ready.category
            );
            let sources = if let Some(server) = &options.server {
                session
                    .select_server(engine, server, options.category)
                    .await?
            } else if options.pick {
                pick_server(&session, engine, &ready.servers).await?
            } else {
                ready.sources
            };
            (ready.episode_id, sources)
        }
        DiscoveryState::Failed(failure) => match (failure.episode_id, failure.servers) {
            (Some(episode_id), Some(servers)) => {
                eprintln!("{}", failure.error.user_message());
                let sources = match &options.server {
                    Some(server) => {
                        session
                            .select_server(engine, server, options.category)
                            .await?
                    }
                    None => pick_server(&session, engine, &servers).await?,
                };
                (episode_id, sources)
            }
            _ => return Err(failure.error.into()),
        },
        other => bail!("resolution ended in unexpected state {other:?}"),
    };

    print_sources(&sources);
    if options.play {
        let source = player::choose_source(&sources, options.pick)?;
        player::launch_player(source, &sources, &episode_id).await?;
    }
    Ok(())
}

/// Prompts for servers until one yields sources or the user cancels.
async fn pick_server(
    session: &WatchSession,
    engine: &DiscoveryEngine<AniwatchClient>,
    servers: &ServerSet,
) -> Result<SourceList> {
    let choices: Vec<_> = servers.iter().collect();
    let labels: Vec<String> = choices
        .iter()
        .map(|server| format!("{} [{}]", server.display_name(), server.category.label()))
        .collect();
    loop {
        let selection = Select::with_theme(&player::theme())
            .with_prompt("Select a server (Esc to cancel)")
            .items(&labels)
            .default(0)
            .interact_opt()?;
        let Some(idx) = selection else {
            bail!("Server selection cancelled.");
        };
        let chosen = choices[idx];
        let Some(ident) = chosen.identifiers().first().copied() else {
            continue;
        };
        match session.select_server(engine, ident, chosen.category).await {
            Ok(sources) => return Ok(sources),
            Err(err @ AnigateError::NoSourcesForServer { .. }) => {
                warn!(error = %err, "manual server choice returned nothing");
                eprintln!("{err}");
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn print_animes(animes: &[AnimeSummary]) {
    for anime in animes {
        println!("  {}", anime.label());
    }
}

fn print_paging(current: u32, total: Option<u32>, has_next: bool) {
    match total {
        Some(total) => println!("Page {current} of {total}"),
        None => println!("Page {current}"),
    }
    if has_next {
        println!("More results available with --page {}", current + 1);
    }
}

fn print_sources(list: &SourceList) {
    for (idx, source) in list.sources.iter().enumerate() {
        println!("[{}] {}  {}", idx + 1, source.label(), source.url);
    }
    for (name, value) in &list.headers {
        println!("header {name}: {value}");
    }
    if let Some(track) = list.english_subtitle() {
        println!("subtitle {}", track.file);
    }
}

fn print_probes(mut probes: UnboundedReceiver<ProbeAttempt>) {
    while let Ok(attempt) = probes.try_recv() {
        let outcome = match &attempt.outcome {
            ProbeOutcome::Accepted => "accepted".to_string(),
            ProbeOutcome::Empty => "empty".to_string(),
            ProbeOutcome::Failed(reason) => format!("failed: {reason}"),
        };
        let target = match (&attempt.server, attempt.category) {
            (Some(server), Some(category)) => format!("sources {server}/{category}"),
            _ => "servers".to_string(),
        };
        println!(
            "{}  {:<28} {:<24} {}",
            attempt.at.format("%H:%M:%S%.3f"),
            attempt.candidate,
            target,
            outcome
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_watch_flags() {
        let cli = Cli::try_parse_from([
            "anigate",
            "watch",
            "one-piece-100?ep=2142",
            "--category",
            "dub",
            "--server",
            "hd-1",
            "--play",
        ])
        .expect("valid args");
        match cli.command {
            Command::Watch {
                episode_id,
                server,
                category,
                pick,
                play,
                ..
            } => {
                assert_eq!(episode_id, "one-piece-100?ep=2142");
                assert_eq!(server.as_deref(), Some("hd-1"));
                assert_eq!(category, Category::Dub);
                assert!(play);
                assert!(!pick);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_rejects_unknown_category() {
        assert!(Cli::try_parse_from(["anigate", "watch", "x-1", "--category", "fan"]).is_err());
    }

    #[test]
    fn cli_accepts_global_config_flag() {
        let cli = Cli::try_parse_from(["anigate", "health", "--config", "/tmp/anigate.toml"])
            .expect("valid args");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/anigate.toml")));
        assert!(matches!(cli.command, Command::Health));
    }

    #[tokio::test]
    async fn local_commands_are_rejected_by_client_dispatch() {
        let settings = Settings::default();
        let client = AniwatchClient::from_settings(&settings.client, "http://127.0.0.1:1/api/anime")
            .expect("client");
        let err = run_client_command(&settings, client, Command::Config)
            .await
            .expect_err("config needs no client");
        assert!(err.to_string().contains("does not talk to the API"));
    }
}
