use std::{fmt, path::PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Stable identifier of a notification, shared by its live and historical forms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NotificationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NotificationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reason why a live notification left the stack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseReason {
    /// Notification timed out and expired.
    Expired,
    /// Notification was dismissed by the user.
    Dismissed,
    /// A newer notification from the same coalescing app took its place.
    Replaced,
    /// The stack was full and this was the oldest entry.
    Evicted,
    /// The sending application asked for it to be closed.
    ClosedByCall,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CloseReason::Expired => "expired",
            CloseReason::Dismissed => "dismissed",
            CloseReason::Replaced => "replaced",
            CloseReason::Evicted => "evicted",
            CloseReason::ClosedByCall => "closed-by-call",
        };
        f.write_str(label)
    }
}

/// An actionable button attached to a notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationAction {
    /// Stable action identifier used by clients.
    pub key: String,
    /// Human-readable label shown in UI.
    pub label: String,
}

/// Raw pixel data as carried by the freedesktop `image-data` hint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImagePixmap {
    pub width: u32,
    pub height: u32,
    /// Bytes between the start of two consecutive rows.
    pub rowstride: u32,
    pub has_alpha: bool,
    pub bits_per_sample: u8,
    pub channels: u8,
    pub data: Vec<u8>,
}

/// Image payload attached to an incoming notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationImage {
    /// Encoded image bytes (PNG, JPEG, ...).
    Encoded(Vec<u8>),
    /// Path to an image file on disk.
    File(PathBuf),
    /// Raw pixel buffer.
    Pixmap(ImagePixmap),
}

/// Persisted form of a notification, as written to the history file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub app_icon: String,
    pub summary: String,
    /// Empty when the notification carried no body.
    #[serde(default)]
    pub body: String,
    pub app_name: String,
    /// Creation instant.
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Local>,
    /// Thumbnail stored by the image cache, if the notification had an image.
    #[serde(default)]
    pub cached_image_path: Option<PathBuf>,
}

/// What `accept` did with an incoming notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Shown in the live stack.
    Displayed,
    /// Shown in the live stack in place of an older notification of the same app.
    Replaced {
        /// Id of the notification that was historized.
        previous: NotificationId,
    },
    /// Do-Not-Disturb was on; the notification went straight to history.
    Suppressed,
}

/// Change published by the history store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryEvent {
    /// A record was added to history.
    NotificationAdded {
        /// Added record id.
        id: NotificationId,
    },
    /// A record was explicitly deleted.
    NotificationRemoved {
        /// Deleted record id.
        id: NotificationId,
    },
    /// History was emptied.
    Cleared {
        /// Number of records that were removed.
        removed: usize,
    },
    /// Do-Not-Disturb was switched on or off.
    DndStateChanged {
        /// New flag value.
        enabled: bool,
    },
}

/// Change published by the live stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LiveEvent {
    /// A notification became visible and is now the current one.
    Displayed {
        id: NotificationId,
        index: usize,
        outcome: AcceptOutcome,
    },
    /// A live notification was closed and historized.
    Closed {
        id: NotificationId,
        reason: CloseReason,
    },
    /// The current notification changed through navigation.
    Navigated { index: usize },
    /// A notification action was invoked.
    ActionInvoked {
        id: NotificationId,
        action_key: String,
    },
    /// The last live notification was closed.
    Emptied,
}

/// Serde helpers for record timestamps.
///
/// Writes RFC 3339. Reads RFC 3339 as well as offset-less ISO-8601, which is
/// interpreted in local time.
pub mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S>(value: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, false))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Local>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp: {raw}")))
    }

    /// Parses an ISO-8601 timestamp with or without an offset.
    pub fn parse(raw: &str) -> Option<DateTime<Local>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Local));
        }

        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        Local.from_local_datetime(&naive).earliest()
    }
}
