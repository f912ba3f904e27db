use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File};
use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

pub const ENV_PREFIX: &str = "ANIGATE";
pub const DEFAULT_UPSTREAM: &str = "https://aniwatch-api.vercel.app/api/v2/hianime";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    pub bind: SocketAddr,
    pub route_prefix: String,
    pub upstream_base: String,
    pub timeout_secs: u64,
    pub referer: String,
    pub user_agent: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            route_prefix: String::from("/api/anime"),
            upstream_base: String::from(DEFAULT_UPSTREAM),
            timeout_secs: 15,
            referer: String::from("https://hianime.to/"),
            user_agent: String::from(DEFAULT_USER_AGENT),
        }
    }
}

impl GatewaySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Route prefix normalized to a leading slash and no trailing slash.
    pub fn prefix(&self) -> String {
        let trimmed = self.route_prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    /// Gateway route to call; an in-process gateway is started when unset.
    pub base_url: Option<String>,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    /// Per-request limit, covering the gateway's own upstream timeout.
    pub timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoverySettings {
    pub max_probes: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self { max_probes: 40 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub gateway: GatewaySettings,
    pub client: ClientSettings,
    pub discovery: DiscoverySettings,
    pub log: LogSettings,
}

impl Settings {
    /// Layers, lowest priority first: defaults, the TOML file (explicit path,
    /// else the per-user config file if present), `ANIGATE__SECTION__KEY`
    /// environment variables.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(anyhow!("config file {} does not exist", path.display()));
                }
                builder = builder.add_source(File::from(path.to_path_buf()));
            }
            None => {
                if let Some(path) = default_config_path().filter(|p| p.exists()) {
                    builder = builder.add_source(File::from(path));
                }
            }
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let settings = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize::<Settings>()
            .context("invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.gateway.timeout_secs == 0 {
            return Err(anyhow!("gateway.timeout_secs must be greater than zero"));
        }
        if self.client.timeout_secs == 0 {
            return Err(anyhow!("client.timeout_secs must be greater than zero"));
        }
        if self.discovery.max_probes == 0 {
            return Err(anyhow!("discovery.max_probes must be greater than zero"));
        }
        url::Url::parse(&self.gateway.upstream_base).with_context(|| {
            format!("gateway.upstream_base is not a URL: {}", self.gateway.upstream_base)
        })?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize settings")
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|base| base.join("anigate").join("config.toml"))
}
