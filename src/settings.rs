use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::metadata::LevelFilter;
use url::Url;

use crate::cli::Args;

pub const DEFAULT_CONFIG_FILE: &str = "whep-snapshot.toml";
pub const ENV_PREFIX: &str = "WHEP_SNAPSHOT";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub signaling_url: Url,
    pub bearer_token: String,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_stun_server_urls")]
    pub stun_server_urls: Vec<String>,
    #[serde(default = "default_ice_gathering_timeout_ms")]
    pub ice_gathering_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_snapshot_interval_ms() -> u64 {
    30_000
}

fn default_jpeg_quality() -> u8 {
    crate::writer::DEFAULT_JPEG_QUALITY
}

fn default_stun_server_urls() -> Vec<String> {
    vec!["stun:stun.cloudflare.com:3478".to_owned()]
}

fn default_ice_gathering_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Settings {
    /// Layers the settings file, `WHEP_SNAPSHOT_*` variables and the command
    /// line, later sources winning.
    pub fn load(args: &Args) -> Result<Self, SettingsError> {
        Self::from_sources(args, Environment::with_prefix(ENV_PREFIX))
    }

    fn from_sources(args: &Args, environment: Environment) -> Result<Self, SettingsError> {
        // An explicitly named file must exist; the default one is optional.
        let file = match &args.config {
            Some(path) => File::from(path.as_path()).required(true),
            None => File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false),
        };
        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(environment)
            .set_override_option("signaling_url", args.url.as_ref().map(Url::to_string))?
            .set_override_option("bearer_token", args.token.clone())?
            .set_override_option(
                "output_path",
                args.output
                    .as_ref()
                    .map(|path| path.to_string_lossy().into_owned()),
            )?
            .set_override_option("snapshot_interval_ms", args.interval_ms)?
            .set_override_option("log_level", args.log_level.clone())?
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field, reason: &str| {
            Err(SettingsError::Invalid {
                field,
                reason: reason.to_owned(),
            })
        };
        if !matches!(self.signaling_url.scheme(), "http" | "https") {
            return invalid("signaling_url", "scheme must be http or https");
        }
        if self.bearer_token.is_empty() {
            return invalid("bearer_token", "must not be empty");
        }
        if self.snapshot_interval_ms == 0 {
            return invalid("snapshot_interval_ms", "must be greater than zero");
        }
        if self.ice_gathering_timeout_ms == 0 {
            return invalid("ice_gathering_timeout_ms", "must be greater than zero");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid("jpeg_quality", "must be between 1 and 100");
        }
        self.log_level()?;
        Ok(())
    }

    /// Snapshot target; defaults to `frame-<token>.jpg` in the working
    /// directory.
    pub fn output_path(&self) -> PathBuf {
        self.output_path.clone().unwrap_or_else(|| {
            let token: String = self
                .bearer_token
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            PathBuf::from(format!("frame-{token}.jpg"))
        })
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    pub fn log_level(&self) -> Result<LevelFilter, SettingsError> {
        LevelFilter::from_str(&self.log_level).map_err(|e| SettingsError::Invalid {
            field: "log_level",
            reason: e.to_string(),
        })
    }
}
