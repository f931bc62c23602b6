use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::transfer::RequestProfile;

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_cache_quota() -> u64 {
    4 * 1024 * 1024
}

fn default_cache_gc_percent() -> u8 {
    75
}

pub fn default_user_agent() -> String {
    format!("fetchstore/{}", env!("CARGO_PKG_VERSION"))
}

fn default_allow_compression() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_io_timeout() -> u64 {
    60
}

fn default_max_tries() -> u32 {
    3
}

fn default_max_redirects() -> usize {
    10
}

fn default_keepalive_pool_capacity() -> usize {
    32
}

fn default_keepalive_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

/// Where the `Referer` header comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefererPolicy {
    /// Never sent.
    #[default]
    None,
    /// The requested URL itself.
    Same,
    /// A fixed configured value.
    Fake,
    /// The page the request originates from.
    Real,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_cache_quota")]
    pub cache_quota: u64,
    #[serde(default = "default_cache_gc_percent")]
    pub cache_gc_percent: u8,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub referer: RefererPolicy,
    #[serde(default)]
    pub fake_referer: Option<String>,
    #[serde(default)]
    pub accept_language: Option<String>,
    #[serde(default)]
    pub accept_charset: Option<String>,
    #[serde(default = "default_allow_compression")]
    pub allow_compression: bool,
    #[serde(default)]
    pub proxy_authorization: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_io_timeout")]
    pub io_timeout: u64,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_keepalive_pool_capacity")]
    pub keepalive_pool_capacity: usize,
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: default_log_format(),
            cache_quota: default_cache_quota(),
            cache_gc_percent: default_cache_gc_percent(),
            user_agent: default_user_agent(),
            referer: RefererPolicy::default(),
            fake_referer: None,
            accept_language: None,
            accept_charset: None,
            allow_compression: default_allow_compression(),
            proxy_authorization: None,
            connect_timeout: default_connect_timeout(),
            io_timeout: default_io_timeout(),
            max_tries: default_max_tries(),
            max_redirects: default_max_redirects(),
            keepalive_pool_capacity: default_keepalive_pool_capacity(),
            keepalive_timeout: default_keepalive_timeout(),
            max_header_size: default_max_header_size(),
        }
    }
}

impl Settings {
    /// Reads the optional TOML file, then `FETCHSTORE__*` overrides.
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_from(resolve_config_path(cli).as_deref())
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("FETCHSTORE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout)
    }

    pub fn request_profile(&self) -> RequestProfile {
        RequestProfile {
            user_agent: self.user_agent.clone(),
            referer: self.referer,
            fake_referer: self.fake_referer.clone(),
            accept_language: self.accept_language.clone(),
            accept_charset: self.accept_charset.clone(),
            allow_compression: self.allow_compression,
            proxy_authorization: self.proxy_authorization.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cache_quota > 0,
            "cache_quota must be greater than 0 (got {})",
            self.cache_quota
        );
        ensure!(
            (1..=100).contains(&self.cache_gc_percent),
            "cache_gc_percent must be between 1 and 100 (got {})",
            self.cache_gc_percent
        );
        ensure!(
            self.keepalive_pool_capacity > 0,
            "keepalive_pool_capacity must be at least 1 (got {})",
            self.keepalive_pool_capacity
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_tries > 0,
            "max_tries must be at least 1 (got {})",
            self.max_tries
        );
        ensure!(
            self.connect_timeout > 0,
            "connect_timeout must be greater than 0 seconds (got {})",
            self.connect_timeout
        );
        ensure!(
            self.io_timeout > 0,
            "io_timeout must be greater than 0 seconds (got {})",
            self.io_timeout
        );
        if self.referer == RefererPolicy::Fake {
            ensure!(
                self.fake_referer.is_some(),
                "referer = \"fake\" requires fake_referer to be set"
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// An explicit `--config` wins; otherwise the first default location that
/// exists. No file at all is fine.
fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Some(path.to_path_buf());
    }
    default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/fetchstore/fetchstore.toml"),
        PathBuf::from("fetchstore.toml"),
    ]
}
