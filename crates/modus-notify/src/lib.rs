//! Notification lifecycle and history engine.
//!
//! Incoming notifications enter a bounded [`LiveStack`] with per-item
//! countdowns, and every notification that leaves it is kept in a persisted
//! [`HistoryStore`] with cached thumbnails. [`NotificationCenter`] ties both
//! together and is the single owner of that state.

pub mod center;
pub mod config;
pub mod history;
pub mod image_cache;
pub mod live;
pub mod subscribers;
pub mod timeout;

pub use center::{CenterError, CenterHandle, Command, LiveEntry, NotificationCenter, Snapshot};
pub use config::{AppConfig, ConfigError, load_config, load_config_from};
pub use history::{HistoryConfig, HistoryStore, LockError, MAX_HISTORY, PersistError, StoreLock};
pub use image_cache::{DEFAULT_THUMBNAIL_SIZE, ImageCache, ImageCacheError};
pub use live::{
    Accepted, Action, IncomingNotification, LiveConfig, LiveNotification, LiveStack, LiveState,
    MAX_LIVE,
};
pub use subscribers::{Subscription, SubscriptionId};
pub use timeout::{Expiry, TimeoutController};
