//! YAML configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub const DEFAULT_HEALTH_PORT: u16 = 9595;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Commands run around each render. An empty list disables the hook.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub pre_render: Vec<String>,
    #[serde(default)]
    pub post_render: Vec<String>,
    /// Upper bound for a single hook run; unbounded when absent.
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Path to a kubeconfig; empty means in-cluster / default discovery.
    #[serde(default)]
    pub kubeconfig: String,
    #[serde(deserialize_with = "de_duration")]
    pub interval: Duration,
    pub in_template: PathBuf,
    pub out_file: PathBuf,
    #[serde(default = "default_health_port")]
    pub health_check_port: u16,
    /// Restrict listing to one namespace; empty means all namespaces.
    #[serde(default)]
    pub namespace: String,
    /// Age after which the health endpoint reports the loop as stuck. Defaults to twice the interval.
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub staleness: Option<Duration>,
    /// Write output through a temp file + rename instead of truncating in place.
    #[serde(default = "default_true")]
    pub atomic_write: bool,
    #[serde(default)]
    pub hooks: Hooks,
}

fn default_health_port() -> u16 { DEFAULT_HEALTH_PORT }
fn default_true() -> bool { true }

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid("interval must be greater than zero".into()));
        }
        if self.in_template.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("in_template is required".into()));
        }
        if self.out_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("out_file is required".into()));
        }
        if matches!(self.staleness, Some(d) if d.is_zero()) {
            return Err(ConfigError::Invalid("staleness must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn staleness(&self) -> Duration {
        self.staleness.unwrap_or_else(|| self.interval.checked_mul(2).unwrap_or(Duration::MAX))
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(self.namespace.as_str()) }
    }
}

/// Parse a duration such as `30s`, `1m30s`, `500ms` or `2h`.
/// Units: `h`, `m`, `s`, `ms`; a bare `0` is accepted.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s == "0" {
        return Some(Duration::ZERO);
    }
    let mut total = Duration::ZERO;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();
    let mut has_unit = false;

    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }
        let n: u64 = num_buf.parse().ok()?;
        num_buf.clear();
        let part = match ch {
            'h' => Duration::from_secs(n.checked_mul(3600)?),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(n)
            }
            'm' => Duration::from_secs(n.checked_mul(60)?),
            's' => Duration::from_secs(n),
            _ => return None,
        };
        total = total.checked_add(part)?;
        has_unit = true;
    }

    // trailing digits without a unit
    if !num_buf.is_empty() || !has_unit {
        return None;
    }
    Some(total)
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    parse_duration(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{}', expected e.g. '30s', '1m30s', '500ms'", raw)))
}

fn de_opt_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    match Option::<String>::deserialize(d)? {
        None => Ok(None),
        Some(raw) => parse_duration(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{}', expected e.g. '30s', '1m30s', '500ms'", raw))),
    }
}
