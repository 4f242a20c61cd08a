// src/config.rs
use crate::detector::RetryPolicy;
use crate::hub::DEFAULT_QUEUE_CAPACITY;
use anyhow::{bail, Result};
use clap::Parser;
use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Port used when `PORT` is not set. The shipped client script embeds this
/// literal; the static handler rewrites it to the configured port.
pub const DEFAULT_PORT: u16 = 3008;

/// Command-line arguments for the application.
#[derive(Parser, Debug, Deserialize, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Directory tree of static assets to watch
    #[clap(help = "Directory tree of static assets to watch")]
    pub root: Option<PathBuf>,

    /// Log level (e.g., trace, debug, info, warn, error)
    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,
}

/// Whether the server is running for development of the tool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Also watches the client script and hot-swaps it in connected pages.
    Development,
    Production,
}

impl RunMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => RunMode::Development,
            _ => RunMode::Production,
        }
    }
}

/// Configuration as read from the environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct EnvConfig {
    /// `PORT`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// `HOTPAGE_ENV`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
}

impl EnvConfig {
    /// Lowest-precedence values.
    pub fn defaults() -> Self {
        let retry = RetryPolicy::default();
        EnvConfig {
            port: Some(DEFAULT_PORT),
            env: Some("production".to_string()),
            host: Some("0.0.0.0".to_string()),
            log_level: Some("info".to_string()),
            public_dir: Some(PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/public"))),
            debounce_ms: Some(50),
            retry_attempts: Some(retry.attempts),
            retry_delay_ms: Some(retry.delay.as_millis() as u64),
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
        }
    }
}

/// Final application configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory tree to watch
    pub root: PathBuf,
    pub port: u16,
    pub host: String,
    pub mode: RunMode,
    pub log_level: String,
    /// Directory served by the static handler (holds the client script)
    pub public_dir: PathBuf,
    pub debounce: Duration,
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
}

impl AppConfig {
    /// Defaults, then `PORT`, then `HOTPAGE_*` variables.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(EnvConfig::defaults()))
            .merge(Env::raw().only(&["PORT"]))
            .merge(Env::prefixed("HOTPAGE_"))
    }

    /// Loads the application configuration from the command line and the
    /// process environment.
    pub fn load() -> Result<Self> {
        Self::from_sources(CliArgs::parse(), Self::figment())
    }

    /// Merges explicit CLI arguments over an environment figment.
    pub fn from_sources(cli_args: CliArgs, figment: Figment) -> Result<Self> {
        let env: EnvConfig = figment.extract()?;
        let defaults = EnvConfig::defaults();

        let Some(root) = cli_args.root else {
            bail!("No root directory to watch. Pass the directory as the first argument.");
        };

        let retry_defaults = RetryPolicy::default();
        Ok(AppConfig {
            root,
            port: env.port.unwrap_or(DEFAULT_PORT),
            host: env.host.or(defaults.host).unwrap_or_default(),
            mode: RunMode::parse(env.env.as_deref().unwrap_or("production")),
            log_level: cli_args
                .log_level
                .or(env.log_level)
                .unwrap_or_else(|| "info".to_string()),
            public_dir: env.public_dir.or(defaults.public_dir).unwrap_or_default(),
            debounce: Duration::from_millis(env.debounce_ms.unwrap_or(50)),
            retry: RetryPolicy {
                attempts: env.retry_attempts.unwrap_or(retry_defaults.attempts),
                delay: env
                    .retry_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.delay),
            },
            queue_capacity: env.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
        })
    }

    /// Address the HTTP server binds.
    pub fn web_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}
