//! Configuration for the aimq queue service.
//!
//! Values come from built-in defaults, then an optional TOML/YAML/JSON file,
//! then environment variables.

use std::env;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static HOSTNAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([-a-zA-Z0-9\.]*[a-zA-Z0-9])?$").unwrap());

/// Queue prefixes and names become part of Redis keys.
static NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_\-\.]+$").unwrap());

pub const DEFAULT_QUEUE_PREFIX: &str = "ai-marketing";
pub const DEFAULT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 5000;

/// Config file contents as written; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfigFile {
    pub queue: Option<QueueSection>,
    pub redis: Option<RedisSection>,
    pub logging: Option<LoggingSection>,
    pub workers: Option<WorkersSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub prefix: Option<String>,
    pub default_attempts: Option<u32>,
    pub default_concurrency: Option<usize>,
    pub backoff_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db: Option<i64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub json: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub queues: Option<Vec<String>>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration value: {0}")]
    Parse(String),
    #[error("configuration rejected: {0}")]
    Validation(String),
}

/// Supported config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Toml => "toml",
            Self::Yaml => "yaml",
            Self::Json => "json",
        })
    }
}

impl ConfigFormat {
    /// Order tried when the file extension says nothing.
    const DETECTION_ORDER: [ConfigFormat; 3] = [Self::Json, Self::Toml, Self::Yaml];

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Whether support for this format was compiled in.
    pub fn is_enabled(self) -> bool {
        match self {
            Self::Toml => cfg!(feature = "toml"),
            Self::Yaml => cfg!(feature = "yaml"),
            Self::Json => cfg!(feature = "json"),
        }
    }

    pub fn parse(self, content: &str) -> Result<RawConfigFile, ConfigError> {
        let parsed: Result<RawConfigFile, String> = match self {
            #[cfg(feature = "toml")]
            Self::Toml => toml::from_str(content).map_err(|e| e.to_string()),
            #[cfg(feature = "yaml")]
            Self::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
            #[cfg(feature = "json")]
            Self::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
            #[allow(unreachable_patterns)]
            _ => Err("support not compiled in".to_string()),
        };
        parsed.map_err(|e| ConfigError::Parse(format!("{self}: {e}")))
    }
}

/// Parse config text, trying every enabled format when `format` is `None`.
pub fn parse_raw(content: &str, format: Option<ConfigFormat>) -> Result<RawConfigFile, ConfigError> {
    if let Some(format) = format {
        return format.parse(content);
    }
    ConfigFormat::DETECTION_ORDER
        .into_iter()
        .filter(|f| f.is_enabled())
        .find_map(|f| f.parse(content).ok())
        .ok_or_else(|| ConfigError::Parse("config is not valid in any enabled format".into()))
}

/// Read a config file; the extension picks the format, otherwise it is detected.
pub fn load_raw_from_file<P: AsRef<Path>>(path: P) -> Result<RawConfigFile, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    parse_raw(&content, ConfigFormat::from_path(path))
}

/// Concrete queue service configuration with defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub queue: QueueConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueConfig {
    pub prefix: String,
    pub default_attempts: u32,
    pub default_concurrency: usize,
    pub backoff_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedisConfig {
    #[serde(serialize_with = "serialize_masked_url")]
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub tls: bool,
}

/// Serialize a connection URL with its password masked.
fn serialize_masked_url<S: serde::Serializer>(
    url: &Option<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match url {
        Some(raw) => serializer.serialize_some(&mask_password(raw)),
        None => serializer.serialize_none(),
    }
}

fn mask_password(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(_) => raw.to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkersConfig {
    pub queues: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig {
                prefix: DEFAULT_QUEUE_PREFIX.to_string(),
                default_attempts: DEFAULT_ATTEMPTS,
                default_concurrency: DEFAULT_CONCURRENCY,
                backoff_delay_ms: DEFAULT_BACKOFF_DELAY_MS,
            },
            redis: RedisConfig {
                url: None,
                host: "localhost".to_string(),
                port: 6379,
                db: 0,
                username: None,
                password: None,
                tls: false,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
            workers: WorkersConfig {
                queues: vec!["notifications".to_string(), "reports".to_string()],
            },
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}

fn merge<T>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

fn merge_opt<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}

/// Load `Config`: defaults, then the optional file, then environment variables.
/// The result is validated before it is returned.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();
    if let Some(p) = path {
        apply_raw(&mut cfg, load_raw_from_file(p)?);
    }
    apply_env_overrides(&mut cfg, |key| env::var(key).ok())?;
    validate_config(&cfg)?;
    Ok(cfg)
}

fn apply_raw(cfg: &mut Config, raw: RawConfigFile) {
    if let Some(q) = raw.queue {
        merge(&mut cfg.queue.prefix, q.prefix);
        merge(&mut cfg.queue.default_attempts, q.default_attempts);
        merge(&mut cfg.queue.default_concurrency, q.default_concurrency);
        merge(&mut cfg.queue.backoff_delay_ms, q.backoff_delay_ms);
    }
    if let Some(r) = raw.redis {
        merge_opt(&mut cfg.redis.url, r.url);
        merge(&mut cfg.redis.host, r.host);
        merge(&mut cfg.redis.port, r.port);
        merge(&mut cfg.redis.db, r.db);
        merge_opt(&mut cfg.redis.username, r.username);
        merge_opt(&mut cfg.redis.password, r.password);
        merge(&mut cfg.redis.tls, r.tls);
    }
    if let Some(l) = raw.logging {
        merge(&mut cfg.logging.level, l.level);
        merge(&mut cfg.logging.json, l.json);
    }
    if let Some(w) = raw.workers {
        merge(&mut cfg.workers.queues, w.queues);
    }
}

/// Typed access to override variables. Blank values count as unset.
struct EnvSource<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.string(key)
            .map(|v| {
                v.trim()
                    .parse::<T>()
                    .map_err(|e| ConfigError::Parse(format!("{key}={v:?}: {e}")))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.string(key)
            .map(|v| {
                parse_flag(&v)
                    .ok_or_else(|| ConfigError::Parse(format!("{key}={v:?}: expected a boolean")))
            })
            .transpose()
    }
}

fn apply_env_overrides<F>(cfg: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvSource { lookup };

    merge(
        &mut cfg.queue.prefix,
        env.string("QUEUE_PREFIX").or_else(|| env.string("APP_NAME")),
    );
    merge(&mut cfg.queue.default_attempts, env.parsed("QUEUE_DEFAULT_ATTEMPTS")?);
    merge(&mut cfg.queue.default_concurrency, env.parsed("QUEUE_DEFAULT_CONCURRENCY")?);
    merge(&mut cfg.queue.backoff_delay_ms, env.parsed("QUEUE_BACKOFF_DELAY_MS")?);

    merge_opt(&mut cfg.redis.url, env.string("REDIS_URL"));
    merge(&mut cfg.redis.host, env.string("REDIS_HOST"));
    merge(&mut cfg.redis.port, env.parsed("REDIS_PORT")?);
    merge(&mut cfg.redis.db, env.parsed("REDIS_DB")?);
    merge_opt(&mut cfg.redis.username, env.string("REDIS_USERNAME"));
    merge_opt(&mut cfg.redis.password, env.string("REDIS_PASSWORD"));
    merge(&mut cfg.redis.tls, env.flag("REDIS_TLS")?);

    merge(&mut cfg.logging.level, env.string("AIMQ_LOG_LEVEL"));
    merge(&mut cfg.logging.json, env.flag("AIMQ_LOG_JSON")?);

    merge(
        &mut cfg.workers.queues,
        env.string("AIMQ_WORKER_QUEUES").map(|v| split_list(&v)),
    );
    Ok(())
}

fn rejected(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

/// Check ranges, names and the Redis endpoint of a resolved configuration.
pub fn validate_config(cfg: &Config) -> Result<(), ConfigError> {
    if !NAME_REGEX.is_match(&cfg.queue.prefix) {
        return Err(rejected(format!("queue.prefix {:?} has unsupported characters", cfg.queue.prefix)));
    }
    if cfg.queue.default_attempts == 0 {
        return Err(rejected("queue.default_attempts must be at least 1"));
    }
    if cfg.queue.default_concurrency == 0 {
        return Err(rejected("queue.default_concurrency must be at least 1"));
    }

    if let Some(raw) = &cfg.redis.url {
        let parsed = url::Url::parse(raw).map_err(|e| rejected(format!("redis.url: {e}")))?;
        if !matches!(parsed.scheme(), "redis" | "rediss") {
            return Err(rejected(format!(
                "redis.url scheme `{}` is not redis or rediss",
                parsed.scheme()
            )));
        }
    } else {
        let host = &cfg.redis.host;
        if host.parse::<IpAddr>().is_err() && !HOSTNAME_REGEX.is_match(host) {
            return Err(rejected(format!("redis.host {host:?} is not a hostname or IP")));
        }
        if cfg.redis.port == 0 {
            return Err(rejected("redis.port must not be 0"));
        }
    }
    if cfg.redis.db < 0 {
        return Err(rejected("redis.db must not be negative"));
    }

    if let Some(bad) = cfg.workers.queues.iter().find(|q| !NAME_REGEX.is_match(q)) {
        return Err(rejected(format!("workers.queues entry {bad:?} is not a valid queue name")));
    }
    Ok(())
}
