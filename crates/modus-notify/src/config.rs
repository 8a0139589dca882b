use std::{
    collections::HashSet,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    history::{HistoryConfig, MAX_HISTORY},
    image_cache::{DEFAULT_THUMBNAIL_SIZE, ImageCache},
    live::{DEFAULT_TIMEOUT_MS, LiveConfig, MAX_LIVE},
    subscribers::DEFAULT_CHANNEL_CAPACITY,
};

const APP_DIR: &str = "modus";
const HISTORY_FILE: &str = "notification_history.json";
const SETTINGS_FILE: &str = "settings.json";

/// Errors from [`load_config_from`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub history: HistorySection,
    pub images: ImageSection,
    pub live: LiveSection,
    pub events: EventsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// History file; defaults to the cache directory.
    pub path: Option<PathBuf>,
    /// Settings file holding the DND flag; defaults to the config directory.
    pub settings_path: Option<PathBuf>,
    pub max_entries: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            path: None,
            settings_path: None,
            max_entries: MAX_HISTORY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageSection {
    /// Thumbnail directory; defaults to the cache directory.
    pub dir: Option<PathBuf>,
    pub thumbnail_size: u32,
}

impl Default for ImageSection {
    fn default() -> Self {
        Self {
            dir: None,
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiveSection {
    pub max_visible: usize,
    pub default_timeout_ms: u64,
    pub coalescing_apps: Vec<String>,
}

impl Default for LiveSection {
    fn default() -> Self {
        Self {
            max_visible: MAX_LIVE,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            coalescing_apps: vec!["Spotify".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// Per-subscriber queue size; a subscriber that falls this far behind
    /// loses events and is told to re-read state.
    pub channel_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl AppConfig {
    pub fn history_path(&self) -> PathBuf {
        self.history
            .path
            .clone()
            .unwrap_or_else(|| cache_dir().join(HISTORY_FILE))
    }

    pub fn settings_path(&self) -> PathBuf {
        self.history
            .settings_path
            .clone()
            .unwrap_or_else(|| config_dir().join(SETTINGS_FILE))
    }

    pub fn image_dir(&self) -> PathBuf {
        self.images.dir.clone().unwrap_or_else(cache_dir)
    }

    pub fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            max_history: self.history.max_entries,
            channel_capacity: self.events.channel_capacity,
            ..HistoryConfig::new(self.history_path(), self.settings_path())
        }
    }

    pub fn image_cache(&self) -> ImageCache {
        ImageCache::new(self.image_dir(), self.images.thumbnail_size)
    }

    pub fn live_config(&self) -> LiveConfig {
        LiveConfig {
            max_live: self.live.max_visible,
            default_timeout_ms: self.live.default_timeout_ms,
            coalescing_apps: self.live.coalescing_apps.iter().cloned().collect::<HashSet<_>>(),
            channel_capacity: self.events.channel_capacity,
        }
    }
}

/// `$XDG_CONFIG_HOME/modus`, falling back to `$HOME/.config/modus`.
pub fn config_dir() -> PathBuf {
    base_dir(
        std::env::var_os("XDG_CONFIG_HOME"),
        std::env::var_os("HOME"),
        ".config",
    )
    .join(APP_DIR)
}

/// `$XDG_CACHE_HOME/modus/notifications`, falling back to `$HOME/.cache`.
pub fn cache_dir() -> PathBuf {
    base_dir(
        std::env::var_os("XDG_CACHE_HOME"),
        std::env::var_os("HOME"),
        ".cache",
    )
    .join(APP_DIR)
    .join("notifications")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Loads the config file, falling back to defaults when it is missing or
/// invalid.
pub fn load_config() -> AppConfig {
    let path = config_path();
    match load_config_from(&path) {
        Ok(cfg) => {
            info!(path = %path.display(), "loaded config");
            cfg
        }
        Err(ConfigError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config not found, using defaults");
            AppConfig::default()
        }
        Err(err) => {
            warn!(%err, "failed to load config, using defaults");
            AppConfig::default()
        }
    }
}

pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn base_dir(xdg: Option<OsString>, home: Option<OsString>, home_subdir: &str) -> PathBuf {
    xdg.filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| home.map(|home| PathBuf::from(home).join(home_subdir)))
        .unwrap_or_else(|| PathBuf::from("."))
}
