use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
};

use modus_types::{HistoryEvent, NotificationId, NotificationRecord};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    image_cache::ImageCache,
    subscribers::{DEFAULT_CHANNEL_CAPACITY, Subscribers, Subscription, SubscriptionId},
};

/// Default number of records kept in history.
pub const MAX_HISTORY: usize = 100;

/// Key of the DND flag inside the settings object.
const DND_KEY: &str = "dnd_enabled";

/// Configuration for [`HistoryStore`].
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// JSON array of records.
    pub history_path: PathBuf,
    /// JSON object holding the DND flag.
    pub settings_path: PathBuf,
    /// Maximum number of records kept.
    pub max_history: usize,
    /// Capacity of each subscriber queue. Overflow drops events and marks the
    /// subscription lagged.
    pub channel_capacity: usize,
}

impl HistoryConfig {
    /// Configuration with default limits for the given files.
    pub fn new(history_path: impl Into<PathBuf>, settings_path: impl Into<PathBuf>) -> Self {
        Self {
            history_path: history_path.into(),
            settings_path: settings_path.into(),
            max_history: MAX_HISTORY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Errors produced while reading or writing the store's files.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Reading or writing a file failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A file did not contain the expected JSON.
    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from [`StoreLock::acquire`].
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process owns the history.
    #[error("{path} is locked by another process")]
    Held { path: PathBuf },
    #[error("failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive advisory lock on a history file, released on drop.
///
/// A running center holds it for as long as it owns the history. Anything
/// else that writes the same files must hold it too.
#[derive(Debug)]
pub struct StoreLock {
    _file: fs::File,
    path: PathBuf,
}

impl StoreLock {
    /// Locks `<history_path>.lock` without waiting.
    pub fn acquire(history_path: &Path) -> Result<Self, LockError> {
        let mut path = history_path.as_os_str().to_owned();
        path.push(".lock");
        let path = PathBuf::from(path);
        let io_err = |source: io::Error| LockError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock() {
            Ok(()) => {
                debug!(path = %path.display(), "history lock acquired");
                Ok(Self { _file: file, path })
            }
            Err(fs::TryLockError::WouldBlock) => Err(LockError::Held { path }),
            Err(fs::TryLockError::Error(source)) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Single source of truth for notifications that are no longer live.
///
/// Every mutation writes through to disk before its event is published.
/// Persistence failures are logged and never undo the in-memory change.
#[derive(Debug)]
pub struct HistoryStore {
    cfg: HistoryConfig,
    records: Vec<NotificationRecord>,
    dnd_enabled: bool,
    images: ImageCache,
    subscribers: Subscribers<HistoryEvent>,
}

impl HistoryStore {
    /// Loads the store from disk.
    ///
    /// Missing, unreadable or corrupt files yield an empty history and DND off.
    pub fn open(cfg: HistoryConfig, images: ImageCache) -> Self {
        let max_history = cfg.max_history.max(1);
        let mut records = match load_records(&cfg.history_path) {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "failed to load notification history, starting empty");
                Vec::new()
            }
        };
        records.sort_by_key(|record| record.timestamp);
        if records.len() > max_history {
            let excess = records.len() - max_history;
            records.drain(..excess);
        }

        let dnd_enabled = match load_settings(&cfg.settings_path) {
            Ok(settings) => settings
                .get(DND_KEY)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(err) => {
                warn!(%err, "failed to load notification settings, dnd off");
                false
            }
        };

        info!(
            path = %cfg.history_path.display(),
            records = records.len(),
            dnd_enabled,
            "notification history opened"
        );

        let subscribers = Subscribers::new("history", cfg.channel_capacity);
        Self {
            cfg: HistoryConfig {
                max_history,
                ..cfg
            },
            records,
            dnd_enabled,
            images,
            subscribers,
        }
    }

    /// Records, oldest first.
    pub fn records(&self) -> &[NotificationRecord] {
        &self.records
    }

    /// Looks up a record by id.
    pub fn get(&self, id: &NotificationId) -> Option<&NotificationRecord> {
        self.records.iter().find(|record| &record.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Maximum number of records kept.
    pub fn max_history(&self) -> usize {
        self.cfg.max_history
    }

    /// Whether Do-Not-Disturb is on.
    pub fn dnd_enabled(&self) -> bool {
        self.dnd_enabled
    }

    /// The thumbnail cache whose files the records point to.
    pub fn image_cache(&self) -> &ImageCache {
        &self.images
    }

    /// Registers a subscriber for history events.
    pub fn subscribe(&mut self) -> Subscription<HistoryEvent> {
        self.subscribers.subscribe()
    }

    /// Removes a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Adds a record, evicting the oldest one when the store is full.
    ///
    /// Records stay ordered by timestamp; a record is placed after every
    /// record that is not newer than it.
    pub fn add(&mut self, record: NotificationRecord) {
        let id = record.id.clone();
        let position = self
            .records
            .partition_point(|existing| existing.timestamp <= record.timestamp);
        info!(%id, app = %record.app_name, summary = %record.summary, "notification historized");
        self.records.insert(position, record);

        let mut kept = true;
        while self.records.len() > self.cfg.max_history {
            let evicted = self.records.remove(0);
            debug!(id = %evicted.id, "history full, evicting oldest record");
            self.images.delete(&evicted.id);
            kept &= evicted.id != id;
        }

        self.persist_records();
        if kept {
            self.subscribers
                .publish(HistoryEvent::NotificationAdded { id });
        }
    }

    /// Removes every record of `app_name` together with its cached image.
    ///
    /// Part of the coalescing flow; publishes nothing.
    pub fn clear_for_app(&mut self, app_name: &str) -> usize {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .records
            .drain(..)
            .partition(|record| record.app_name == app_name);
        self.records = kept;

        if removed.is_empty() {
            return 0;
        }
        for record in &removed {
            self.images.delete(&record.id);
        }
        self.persist_records();
        info!(app = %app_name, removed = removed.len(), "cleared app history");
        removed.len()
    }

    /// Deletes one record and its cached image. Returns whether it existed.
    pub fn delete(&mut self, id: &NotificationId) -> bool {
        let Some(position) = self.records.iter().position(|record| &record.id == id) else {
            return false;
        };
        self.records.remove(position);
        self.images.delete(id);
        self.persist_records();
        info!(%id, "history record deleted");

        self.subscribers
            .publish(HistoryEvent::NotificationRemoved { id: id.clone() });
        true
    }

    /// Sets the DND flag. Returns whether the value changed.
    pub fn set_dnd(&mut self, enabled: bool) -> bool {
        if self.dnd_enabled == enabled {
            return false;
        }
        self.dnd_enabled = enabled;
        self.persist_settings();
        info!(enabled, "do-not-disturb changed");

        self.subscribers
            .publish(HistoryEvent::DndStateChanged { enabled });
        true
    }

    /// Flips the DND flag and returns the new value.
    pub fn toggle_dnd(&mut self) -> bool {
        let enabled = !self.dnd_enabled;
        self.set_dnd(enabled);
        enabled
    }

    /// Removes every record and every cached image they reference.
    pub fn clear_all(&mut self) -> usize {
        let removed = std::mem::take(&mut self.records);
        for record in &removed {
            self.images.delete(&record.id);
        }
        self.persist_records();
        info!(removed = removed.len(), "history cleared");

        if !removed.is_empty() {
            self.subscribers.publish(HistoryEvent::Cleared {
                removed: removed.len(),
            });
        }
        removed.len()
    }

    /// Deletes cached images that no record refers to anymore.
    pub fn sweep_orphans(&self) -> usize {
        let valid: HashSet<NotificationId> =
            self.records.iter().map(|record| record.id.clone()).collect();
        self.images.sweep(&valid)
    }

    fn persist_records(&self) {
        if let Err(err) = write_json(&self.cfg.history_path, &self.records) {
            warn!(%err, "failed to persist notification history");
        }
    }

    fn persist_settings(&self) {
        let path = &self.cfg.settings_path;
        // Unrelated keys in the settings object are kept.
        let mut settings = load_settings(path).unwrap_or_default();
        settings.insert(DND_KEY.to_string(), Value::Bool(self.dnd_enabled));

        if let Err(err) = write_json(path, &settings) {
            warn!(%err, "failed to persist notification settings");
        }
    }
}

fn load_records(path: &Path) -> Result<Vec<NotificationRecord>, PersistError> {
    let Some(raw) = read_optional(path)? else {
        debug!(path = %path.display(), "no history file yet");
        return Ok(Vec::new());
    };

    let entries: Vec<Value> = serde_json::from_str(&raw).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let mut seen = HashSet::new();
    let records = entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<NotificationRecord>(entry) {
            Ok(record) if seen.insert(record.id.clone()) => Some(record),
            Ok(record) => {
                warn!(id = %record.id, "skipping duplicate history record");
                None
            }
            Err(err) => {
                warn!(%err, "skipping malformed history record");
                None
            }
        })
        .collect();

    Ok(records)
}

fn load_settings(path: &Path) -> Result<Map<String, Value>, PersistError> {
    let Some(raw) = read_optional(path)? else {
        return Ok(Map::new());
    };

    serde_json::from_str(&raw).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, PersistError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PersistError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Replaces `path` with the pretty-printed JSON of `value`.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    let io_err = |source: io::Error| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut raw = serde_json::to_vec_pretty(value).map_err(|source| PersistError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    raw.push(b'\n');

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, &raw).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeDelta};
    use modus_types::NotificationImage;

    use super::*;
    use crate::image_cache::DEFAULT_THUMBNAIL_SIZE;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn config(&self) -> HistoryConfig {
            HistoryConfig::new(
                self.dir.path().join("notification_history.json"),
                self.dir.path().join("settings.json"),
            )
        }

        fn images(&self) -> ImageCache {
            ImageCache::new(self.dir.path().join("images"), DEFAULT_THUMBNAIL_SIZE)
        }

        fn open(&self) -> HistoryStore {
            HistoryStore::open(self.config(), self.images())
        }
    }

    fn record(id: &str, app: &str, minutes_ago: i64) -> NotificationRecord {
        NotificationRecord {
            id: NotificationId::from(id),
            app_icon: "dialog-information-symbolic".to_string(),
            summary: format!("summary {id}"),
            body: String::new(),
            app_name: app.to_string(),
            timestamp: Local::now() - TimeDelta::minutes(minutes_ago),
            cached_image_path: None,
        }
    }

    fn tiny_png() -> NotificationImage {
        let img = image::RgbaImage::from_pixel(8, 8, image::Rgba([1, 2, 3, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        NotificationImage::Encoded(out.into_inner())
    }

    #[test]
    fn missing_files_start_empty() {
        let fixture = Fixture::new();
        let store = fixture.open();

        assert!(store.is_empty());
        assert!(!store.dnd_enabled());
    }

    #[test]
    fn corrupt_history_starts_empty() {
        let fixture = Fixture::new();
        let cfg = fixture.config();
        fs::write(&cfg.history_path, "{ not json").unwrap();
        fs::write(&cfg.settings_path, "[1, 2").unwrap();

        let store = fixture.open();
        assert!(store.is_empty());
        assert!(!store.dnd_enabled());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let fixture = Fixture::new();
        let good = serde_json::to_value(record("good", "mail", 1)).unwrap();
        let raw = serde_json::json!([{ "id": "bad" }, good]);
        fs::write(&fixture.config().history_path, raw.to_string()).unwrap();

        let store = fixture.open();
        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].id.as_str(), "good");
    }

    #[test]
    fn add_persists_and_publishes() {
        let fixture = Fixture::new();
        let mut store = fixture.open();
        let mut events = store.subscribe();

        store.add(record("a", "mail", 0));

        assert_eq!(
            events.drain(),
            vec![HistoryEvent::NotificationAdded {
                id: NotificationId::from("a")
            }]
        );
        let reloaded = fixture.open();
        assert_eq!(reloaded.records(), store.records());
    }

    #[test]
    fn history_is_bounded_and_evicts_oldest_first() {
        let fixture = Fixture::new();
        let mut store = fixture.open();

        for i in 0..(MAX_HISTORY + 5) {
            let minutes_ago = (MAX_HISTORY + 5 - i) as i64;
            store.add(record(&format!("n{i}"), "app", minutes_ago));
            assert!(store.len() <= MAX_HISTORY);
        }

        assert_eq!(store.len(), MAX_HISTORY);
        assert_eq!(store.records()[0].id.as_str(), "n5");
        assert!(
            store
                .records()
                .windows(2)
                .all(|pair| pair[0].timestamp <= pair[1].timestamp)
        );
    }

    #[test]
    fn late_arrivals_are_ordered_by_timestamp() {
        let fixture = Fixture::new();
        let mut store = fixture.open();

        store.add(record("new", "app", 1));
        store.add(record("old", "app", 10));

        let ids: Vec<_> = store.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "new"]);
    }

    #[test]
    fn eviction_deletes_the_evicted_image() {
        let fixture = Fixture::new();
        let mut cfg = fixture.config();
        cfg.max_history = 1;
        let mut store = HistoryStore::open(cfg, fixture.images());

        let mut first = record("first", "app", 2);
        first.cached_image_path = store
            .image_cache()
            .store(&first.id, &tiny_png());
        let path = first.cached_image_path.clone().unwrap();
        store.add(first);
        store.add(record("second", "app", 1));

        assert!(!path.exists());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn record_older_than_a_full_history_is_dropped_silently() {
        let fixture = Fixture::new();
        let mut cfg = fixture.config();
        cfg.max_history = 1;
        let mut store = HistoryStore::open(cfg, fixture.images());
        store.add(record("recent", "app", 1));
        let mut events = store.subscribe();

        store.add(record("ancient", "app", 60));

        assert_eq!(store.records()[0].id.as_str(), "recent");
        assert!(events.drain().is_empty());
    }

    #[test]
    fn clear_for_app_is_silent_and_scoped() {
        let fixture = Fixture::new();
        let mut store = fixture.open();
        store.add(record("s1", "Spotify", 3));
        store.add(record("m1", "mail", 2));
        store.add(record("s2", "Spotify", 1));
        let mut events = store.subscribe();

        assert_eq!(store.clear_for_app("Spotify"), 2);
        assert_eq!(store.clear_for_app("Spotify"), 0);

        assert_eq!(store.len(), 1);
        assert!(events.drain().is_empty());
        assert_eq!(fixture.open().len(), 1);
    }

    #[test]
    fn delete_removes_record_and_image() {
        let fixture = Fixture::new();
        let mut store = fixture.open();
        let mut with_image = record("pic", "photos", 1);
        with_image.cached_image_path = store.image_cache().store(&with_image.id, &tiny_png());
        let path = with_image.cached_image_path.clone().unwrap();
        store.add(with_image);
        let mut events = store.subscribe();

        assert!(store.delete(&NotificationId::from("pic")));
        assert!(!store.delete(&NotificationId::from("pic")));

        assert!(!path.exists());
        assert!(store.is_empty());
        assert_eq!(events.drain().len(), 1);
    }

    #[test]
    fn dnd_change_is_published_once() {
        let fixture = Fixture::new();
        let mut store = fixture.open();
        let mut events = store.subscribe();

        assert!(store.set_dnd(true));
        assert!(!store.set_dnd(true));

        assert_eq!(
            events.drain(),
            vec![HistoryEvent::DndStateChanged { enabled: true }]
        );
        assert!(fixture.open().dnd_enabled());
    }

    #[test]
    fn dnd_write_keeps_other_settings() {
        let fixture = Fixture::new();
        let cfg = fixture.config();
        fs::write(&cfg.settings_path, r#"{"theme": "dark"}"#).unwrap();
        let mut store = fixture.open();

        assert!(store.toggle_dnd());

        let raw = fs::read_to_string(&cfg.settings_path).unwrap();
        let settings: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(settings["theme"], "dark");
        assert_eq!(settings["dnd_enabled"], true);
    }

    #[test]
    fn round_trip_preserves_records_and_dnd() {
        let fixture = Fixture::new();
        let mut store = fixture.open();
        store.add(record("a", "mail", 3));
        store.add(record("b", "chat", 2));
        store.set_dnd(true);

        let reloaded = fixture.open();
        assert_eq!(reloaded.records(), store.records());
        assert_eq!(reloaded.dnd_enabled(), store.dnd_enabled());
    }

    #[test]
    fn clear_all_empties_store_and_images() {
        let fixture = Fixture::new();
        let mut store = fixture.open();
        let mut pic = record("pic", "photos", 1);
        pic.cached_image_path = store.image_cache().store(&pic.id, &tiny_png());
        let path = pic.cached_image_path.clone().unwrap();
        store.add(pic);
        store.add(record("plain", "mail", 0));
        let mut events = store.subscribe();

        assert_eq!(store.clear_all(), 2);

        assert!(!path.exists());
        assert!(fixture.open().is_empty());
        assert_eq!(events.drain(), vec![HistoryEvent::Cleared { removed: 2 }]);
    }

    #[test]
    fn sweep_uses_current_records() {
        let fixture = Fixture::new();
        let mut store = fixture.open();
        let mut pic = record("kept", "photos", 1);
        pic.cached_image_path = store.image_cache().store(&pic.id, &tiny_png());
        store.add(pic);
        let orphan = store
            .image_cache()
            .store(&NotificationId::from("orphan"), &tiny_png())
            .unwrap();

        assert_eq!(store.sweep_orphans(), 1);
        assert!(!orphan.exists());
    }

    #[test]
    fn history_lock_is_exclusive_until_dropped() {
        let fixture = Fixture::new();
        let history_path = fixture.config().history_path;

        let lock = StoreLock::acquire(&history_path).unwrap();
        assert!(lock.path().ends_with("notification_history.json.lock"));
        assert!(matches!(
            StoreLock::acquire(&history_path),
            Err(LockError::Held { .. })
        ));

        drop(lock);
        assert!(StoreLock::acquire(&history_path).is_ok());
    }

    #[test]
    fn write_failure_keeps_memory_state() {
        let fixture = Fixture::new();
        let blocker = fixture.dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        let cfg = HistoryConfig::new(blocker.join("history.json"), blocker.join("settings.json"));
        let mut store = HistoryStore::open(cfg, fixture.images());

        store.add(record("a", "mail", 0));
        assert!(store.set_dnd(true));

        assert_eq!(store.len(), 1);
        assert!(store.dnd_enabled());
    }
}
