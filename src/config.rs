use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{VersionTags, DEFAULT_OFFLINE_BODY};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the hosting application; static asset paths resolve against it
  pub scope: Url,
  /// Current cache generation names
  #[serde(default)]
  pub tags: VersionTags,
  /// Application shell, cached on install
  #[serde(default = "default_static_assets")]
  pub static_assets: Vec<String>,
  /// Third-party resources served network-first (query strings ignored)
  #[serde(default = "default_cdn_resources")]
  pub cdn_resources: Vec<String>,
  /// Body of the 503 placeholder served for unreachable local resources
  #[serde(default = "default_offline_body")]
  pub offline_body: String,
  /// Cache database location (defaults to the user data directory)
  pub cache_path: Option<PathBuf>,
  /// Directory for daily-rotated log files; logs go to stderr only if unset
  pub log_dir: Option<PathBuf>,
}

fn default_static_assets() -> Vec<String> {
  ["./", "./index.html", "./manifest.json", "./script.js", "./style.css"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_cdn_resources() -> Vec<String> {
  [
    "https://cdnjs.cloudflare.com/ajax/libs/xlsx/0.18.5/xlsx.full.min.js",
    "https://cdnjs.cloudflare.com/ajax/libs/gsap/3.12.2/gsap.min.js",
    "https://cdnjs.cloudflare.com/ajax/libs/gsap/3.12.2/TweenMax.min.js",
    "https://cdn.jsdelivr.net/npm/winwheel@1.0.1/dist/Winwheel.min.js",
    "https://cdnjs.cloudflare.com/ajax/libs/qrcodejs/1.0.0/qrcode.min.js",
    "https://fonts.googleapis.com/css2?family=Noto+Sans+SC:wght@400;500;700&display=swap",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_offline_body() -> String {
  DEFAULT_OFFLINE_BODY.to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-shell.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-shell/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offline-shell/config.yaml\n\
                 At minimum it needs a `scope:` URL for the application."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-shell.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-shell").join("config.yaml");
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

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if !matches!(config.scope.scheme(), "http" | "https") {
      return Err(eyre!("scope must be an http(s) URL, got {}", config.scope));
    }

    Ok(config)
  }

  /// Resolve the cache database path.
  pub fn cache_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache_path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-shell").join("cache.db"))
  }
}
