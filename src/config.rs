use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  /// Address the proxy listens on
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// Largest request body accepted for forwarding or queueing
  #[serde(default = "default_max_body_bytes")]
  pub max_body_bytes: usize,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Override for the SQLite database path (defaults to the data directory)
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL relative request paths are resolved against
  #[serde(default = "default_backend_url")]
  pub url: String,
  /// Request timeout in seconds. No timeout when unset.
  pub timeout_secs: Option<u64>,
  /// Path probed by the connectivity monitor
  #[serde(default = "default_health_path")]
  pub health_path: String,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: default_backend_url(),
      timeout_secs: None,
      health_path: default_health_path(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Prefix shared by all region names (e.g. "workout" -> "workout-static-v1")
  #[serde(default = "default_region_prefix")]
  pub region_prefix: String,
  /// Generation tag embedded in region names. Bumping it invalidates every region.
  #[serde(default = "default_version")]
  pub version: String,
  /// Path prefixes that always go to the network and never touch the cache
  #[serde(default = "default_api_prefixes")]
  pub api_prefixes: Vec<String>,
  /// Path prefix served cache-first from the static region
  #[serde(default = "default_static_prefix")]
  pub static_prefix: String,
  /// Fallback document for HTML requests when network and cache both miss
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Assets fetched into the static region on install
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      region_prefix: default_region_prefix(),
      version: default_version(),
      api_prefixes: default_api_prefixes(),
      static_prefix: default_static_prefix(),
      offline_page: default_offline_page(),
      precache: default_precache(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Write paths that are queued for later replay when the backend is unreachable
  #[serde(default = "default_queue_prefixes")]
  pub queue_prefixes: Vec<String>,
  /// Failed replays before a write moves to the dead-letter list (0 = never)
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// Seconds between connectivity probes
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      queue_prefixes: default_queue_prefixes(),
      max_attempts: default_max_attempts(),
      probe_interval_secs: default_probe_interval(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Also write logs to a daily rolling file in the data directory
  #[serde(default)]
  pub file: bool,
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8787))
}

fn default_max_body_bytes() -> usize {
  16 * 1024 * 1024
}

fn default_backend_url() -> String {
  "http://127.0.0.1:5000".to_string()
}

fn default_health_path() -> String {
  "/".to_string()
}

fn default_region_prefix() -> String {
  "workout".to_string()
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_api_prefixes() -> Vec<String> {
  vec!["/api/".to_string(), "/analytics/api/".to_string()]
}

fn default_static_prefix() -> String {
  "/static/".to_string()
}

fn default_offline_page() -> String {
  "/offline.html".to_string()
}

fn default_precache() -> Vec<String> {
  [
    "/",
    "/static/css/style.css",
    "/static/js/app.js",
    "/static/manifest.json",
    "/offline.html",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_queue_prefixes() -> Vec<String> {
  vec![
    "/api/v1/workouts".to_string(),
    "/api/v1/recovery".to_string(),
  ]
}

fn default_max_attempts() -> u32 {
  5
}

fn default_probe_interval() -> u64 {
  15
}

impl Default for Config {
  fn default() -> Self {
    Self {
      backend: BackendConfig::default(),
      listen: default_listen(),
      max_body_bytes: default_max_body_bytes(),
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      database: None,
      log: LogConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./workout-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/workout-offline/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Some(url) = Self::backend_from_env() {
      config.backend.url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("workout-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("workout-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Backend URL override from the environment.
  ///
  /// Checks WORKOUT_OFFLINE_BACKEND.
  fn backend_from_env() -> Option<String> {
    std::env::var("WORKOUT_OFFLINE_BACKEND")
      .ok()
      .filter(|s| !s.trim().is_empty())
  }

  /// Directory for the database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("workout-offline"))
  }

  /// Resolved path of the SQLite database.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_yaml_uses_defaults() {
    let config = Config::from_yaml("{}").unwrap();
    assert_eq!(config.cache.version, "v1");
    assert_eq!(config.cache.static_prefix, "/static/");
    assert_eq!(config.sync.max_attempts, 5);
    assert_eq!(config.listen, default_listen());
    assert_eq!(config.max_body_bytes, 16 * 1024 * 1024);
    assert!(config.cache.precache.contains(&"/offline.html".to_string()));
  }

  #[test]
  fn test_partial_override() {
    let yaml = r#"
backend:
  url: "https://workouts.example.com"
  timeout_secs: 10
cache:
  version: v7
  api_prefixes: ["/rest/"]
sync:
  max_attempts: 0
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.backend.url, "https://workouts.example.com");
    assert_eq!(config.backend.timeout_secs, Some(10));
    assert_eq!(config.backend.health_path, "/");
    assert_eq!(config.cache.version, "v7");
    assert_eq!(config.cache.api_prefixes, vec!["/rest/".to_string()]);
    assert_eq!(config.cache.region_prefix, "workout");
    assert_eq!(config.sync.max_attempts, 0);
    assert!(!config.log.file);
  }

  #[test]
  fn test_explicit_database_path() {
    let config = Config::from_yaml("database: /tmp/wo.db").unwrap();
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/wo.db"));
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    let result = Config::load(Some(Path::new("/nonexistent/workout-offline.yaml")));
    assert!(result.is_err());
  }
}
