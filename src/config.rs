//! Configuration loader and validator for the fuel-log sync client.
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub server: Server,
    pub cache: Cache,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// LubeLogger backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub base_url: String,
}

/// Request interceptor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cache {
    /// Origin the precache manifest paths are resolved against.
    pub origin: String,
    pub static_name: String,
    pub runtime_name: String,
    pub precache: Vec<String>,
    /// Regexes matched against the request path of API GETs worth caching.
    pub api_read_patterns: Vec<String>,
    pub write_endpoint: String,
    pub sync_tag: String,
    pub offline_page: String,
}

fn default_sync_interval_ms() -> u64 {
    60_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// Database URL: `DATABASE_URL` if set, else a file inside the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/fuel_sync.db", self.app.resolved_data_dir())
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sync_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.sync_interval_ms must be > 0"));
    }
    if cfg.app.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_secs must be > 0"));
    }

    if Url::parse(&cfg.server.base_url).is_err() {
        return Err(ConfigError::Invalid("server.base_url must be an absolute URL"));
    }

    let c = &cfg.cache;
    if Url::parse(&c.origin).is_err() {
        return Err(ConfigError::Invalid("cache.origin must be an absolute URL"));
    }
    if c.static_name.trim().is_empty() || c.runtime_name.trim().is_empty() {
        return Err(ConfigError::Invalid("cache.static_name and cache.runtime_name must be non-empty"));
    }
    if c.static_name == c.runtime_name {
        return Err(ConfigError::Invalid("cache.static_name and cache.runtime_name must differ"));
    }
    if c.precache.iter().any(|p| !p.starts_with('/')) {
        return Err(ConfigError::Invalid("cache.precache entries must be absolute paths"));
    }
    if c.api_read_patterns.iter().any(|p| Regex::new(p).is_err()) {
        return Err(ConfigError::Invalid("cache.api_read_patterns must be valid regexes"));
    }
    if !c.write_endpoint.starts_with('/') {
        return Err(ConfigError::Invalid("cache.write_endpoint must be an absolute path"));
    }
    if c.sync_tag.trim().is_empty() {
        return Err(ConfigError::Invalid("cache.sync_tag must be non-empty"));
    }
    if !c.offline_page.starts_with('/') {
        return Err(ConfigError::Invalid("cache.offline_page must be an absolute path"));
    }

    Ok(())
}

/// Example configuration; also used as the test fixture.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_interval_ms: 60000
  request_timeout_secs: 30

server:
  base_url: "https://lubelogger.example.com"

cache:
  origin: "https://fuel.example.com"
  static_name: "fuel-logger-v1"
  runtime_name: "runtime-cache"
  precache:
    - "/"
    - "/index.html"
    - "/static/js/main.bundle.js"
    - "/static/css/main.bundle.css"
    - "/manifest.json"
    - "/favicon.ico"
    - "/offline.html"
  api_read_patterns:
    - "^/api/vehicles$"
    - "^/api/vehicle/info$"
  write_endpoint: "/api/vehicle/gasrecords/add"
  sync_tag: "sync-fuel-logs"
  offline_page: "/offline.html"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.sync_interval_ms, 60_000);
    }

    #[test]
    fn defaults_apply_when_omitted() {
        let raw = example()
            .replace("  sync_interval_ms: 60000\n", "")
            .replace("  request_timeout_secs: 30\n", "");
        let cfg: Config = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(cfg.app.sync_interval_ms, 60_000);
        assert_eq!(cfg.app.request_timeout_secs, 30);
    }

    #[test]
    fn invalid_interval() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.sync_interval_ms = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("sync_interval_ms")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_base_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.server.base_url = "not a url".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("server.base_url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_cache_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cache.api_read_patterns.push("(".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cache.runtime_name = cfg.cache.static_name.clone();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cache.precache.push("relative.js".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.cache.sync_tag = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.cache.sync_tag, "sync-fuel-logs");
        assert_eq!(cfg.cache.precache.len(), 7);
    }
}
