use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "mockrelay.toml";
const DEFAULT_FIXTURE_NAME: &str = "response";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listen port for the mock server (bound on 127.0.0.1).
    pub port: u16,
    /// Storage backend selector; unknown values fall back to keyed JSON.
    #[serde(default)]
    pub format: Option<String>,
    /// Directory holding fixture files.
    pub dir: PathBuf,
    /// Fixture file name, without extension.
    #[serde(default = "default_fixture_name")]
    pub name: String,
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub protocol: ApiProtocol,
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Base path prepended to the original request URL when forwarding.
    #[serde(default)]
    pub base: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiProtocol {
    Http,
    Https,
}

impl ApiProtocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    KeyedJson,
    OrderedLog,
}

fn default_fixture_name() -> String {
    DEFAULT_FIXTURE_NAME.to_owned()
}

impl Config {
    /// Loads the config from an explicit path, or from `mockrelay.toml` in
    /// the working directory when none is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Self::from_path(Path::new(DEFAULT_CONFIG_FILE)),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Resolves the configured storage backend. Missing format means keyed
    /// JSON; an unrecognized value also falls back to keyed JSON with a
    /// logged warning.
    pub fn storage_format(&self) -> StorageFormat {
        match self.format.as_deref() {
            None | Some("keyed-json") => StorageFormat::KeyedJson,
            Some("ordered-log") => StorageFormat::OrderedLog,
            Some(other) => {
                tracing::warn!(
                    format = other,
                    "unknown storage format; falling back to keyed JSON"
                );
                StorageFormat::KeyedJson
            }
        }
    }

    pub fn apply_fixture_name_override(&mut self, name: Option<&str>) {
        if let Some(name) = name {
            self.name = name.to_owned();
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}
