use std::{collections::HashSet, fmt};

use chrono::Local;
use modus_types::{
    AcceptOutcome, CloseReason, LiveEvent, NotificationAction, NotificationId, NotificationImage,
    NotificationRecord,
};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    history::HistoryStore,
    image_cache::ImageCache,
    subscribers::{DEFAULT_CHANNEL_CAPACITY, Subscribers, Subscription, SubscriptionId},
    timeout::{Expiry, TimeoutController},
};

/// Default number of notifications shown at once.
pub const MAX_LIVE: usize = 5;
/// Timeout used when the sender does not request one.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// App name substituted when the sender gives none.
pub const DEFAULT_APP_NAME: &str = "Unknown";
/// Icon substituted when the sender gives none.
pub const DEFAULT_APP_ICON: &str = "dialog-information-symbolic";

/// Configuration for [`LiveStack`].
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Maximum number of live notifications.
    pub max_live: usize,
    /// Timeout applied when the requested timeout is negative.
    pub default_timeout_ms: u64,
    /// Apps whose notifications replace each other instead of piling up.
    pub coalescing_apps: HashSet<String>,
    /// Capacity of each subscriber queue. Overflow drops events and marks the
    /// subscription lagged.
    pub channel_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            max_live: MAX_LIVE,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            coalescing_apps: HashSet::from(["Spotify".to_string()]),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// A single-shot action attached to an incoming notification.
pub struct Action {
    /// Stable action identifier.
    pub key: String,
    /// Human-readable label.
    pub label: String,
    invoke: Option<Box<dyn FnOnce() + Send>>,
}

impl Action {
    /// Creates an action that runs `invoke` the first time it is triggered.
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        invoke: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            invoke: Some(Box::new(invoke)),
        }
    }

    /// Key and label of the action.
    pub fn descriptor(&self) -> NotificationAction {
        NotificationAction {
            key: self.key.clone(),
            label: self.label.clone(),
        }
    }

    /// Whether the action has already been triggered.
    pub fn is_spent(&self) -> bool {
        self.invoke.is_none()
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// A notification as delivered by the transport.
///
/// Empty `app_name` and `app_icon` are replaced by defaults on acceptance.
#[derive(Debug)]
pub struct IncomingNotification {
    pub app_name: String,
    pub app_icon: String,
    pub summary: String,
    pub body: String,
    pub image: Option<NotificationImage>,
    pub actions: Vec<Action>,
    /// Negative selects the configured default, zero never expires.
    pub requested_timeout_ms: i32,
}

impl IncomingNotification {
    /// A notification with default icon, no body and the default timeout.
    pub fn new(app_name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            summary: summary.into(),
            ..Self::default()
        }
    }
}

impl Default for IncomingNotification {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            app_icon: String::new(),
            summary: String::new(),
            body: String::new(),
            image: None,
            actions: Vec::new(),
            requested_timeout_ms: -1,
        }
    }
}

/// Countdown state of a live notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Active,
    Paused,
    Closing,
}

/// A notification currently in the live stack.
#[derive(Debug)]
pub struct LiveNotification {
    record: NotificationRecord,
    actions: Vec<Action>,
    timeout_ms: u64,
    state: LiveState,
}

impl LiveNotification {
    pub fn id(&self) -> &NotificationId {
        &self.record.id
    }

    /// The record this notification becomes once historized.
    pub fn record(&self) -> &NotificationRecord {
        &self.record
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Effective timeout; zero means it never expires.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn state(&self) -> LiveState {
        self.state
    }
}

/// Result of [`LiveStack::accept`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Id assigned to the notification.
    pub id: NotificationId,
    pub outcome: AcceptOutcome,
}

/// Ordered collection of live notifications with a current selection.
#[derive(Debug)]
pub struct LiveStack {
    cfg: LiveConfig,
    items: Vec<LiveNotification>,
    current: Option<usize>,
    timeouts: TimeoutController,
    subscribers: Subscribers<LiveEvent>,
}

impl LiveStack {
    /// Creates an empty stack and the receiver its timer expiries arrive on.
    ///
    /// Expiries must be fed back through [`handle_expiry`](Self::handle_expiry).
    pub fn new(cfg: LiveConfig) -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (timeouts, expiries) = TimeoutController::new();
        let subscribers = Subscribers::new("live", cfg.channel_capacity);
        let stack = Self {
            cfg: LiveConfig {
                max_live: cfg.max_live.max(1),
                ..cfg
            },
            items: Vec::new(),
            current: None,
            timeouts,
            subscribers,
        };

        (stack, expiries)
    }

    /// Live notifications in insertion order.
    pub fn items(&self) -> &[LiveNotification] {
        &self.items
    }

    pub fn get(&self, id: &NotificationId) -> Option<&LiveNotification> {
        self.items.iter().find(|item| item.id() == id)
    }

    /// Index of the notification shown to the user; `None` when empty.
    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&LiveNotification> {
        self.current.and_then(|index| self.items.get(index))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether countdowns are paused.
    pub fn is_paused(&self) -> bool {
        self.timeouts.is_paused()
    }

    /// Registers a subscriber for live stack events.
    pub fn subscribe(&mut self) -> Subscription<LiveEvent> {
        self.subscribers.subscribe()
    }

    /// Removes a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Takes in a new notification.
    ///
    /// With Do-Not-Disturb on the notification goes straight to history.
    /// Otherwise it becomes the current live notification, after replacing
    /// the live entry of the same coalescing app or evicting the oldest entry
    /// of a full stack.
    ///
    /// # Panics
    ///
    /// Countdowns run as tokio tasks, so this panics outside a tokio runtime
    /// unless the effective timeout is zero or Do-Not-Disturb is on.
    pub fn accept(&mut self, incoming: IncomingNotification, history: &mut HistoryStore) -> Accepted {
        let mut live = self.ingest(incoming, history.image_cache());
        let id = live.id().clone();

        if history.dnd_enabled() {
            info!(%id, app = %live.record.app_name, "do-not-disturb on, notification sent to history");
            history.add(live.record);
            return Accepted {
                id,
                outcome: AcceptOutcome::Suppressed,
            };
        }

        let mut outcome = AcceptOutcome::Displayed;
        let app_name = live.record.app_name.clone();
        if self.cfg.coalescing_apps.contains(&app_name) {
            history.clear_for_app(&app_name);
            if let Some(position) = self
                .items
                .iter()
                .position(|item| item.record.app_name == app_name)
            {
                let previous = self.historize_at(position, CloseReason::Replaced, history);
                outcome = AcceptOutcome::Replaced { previous };
            }
        }

        while self.items.len() >= self.cfg.max_live {
            self.historize_at(0, CloseReason::Evicted, history);
        }

        self.timeouts.start(&id, live.timeout_ms);
        if self.timeouts.is_paused() && live.timeout_ms > 0 {
            live.state = LiveState::Paused;
        }
        info!(%id, app = %app_name, summary = %live.record.summary, timeout_ms = live.timeout_ms, "notification displayed");
        self.items.push(live);

        let index = self.items.len() - 1;
        self.current = Some(index);
        self.subscribers.publish(LiveEvent::Displayed {
            id: id.clone(),
            index,
            outcome: outcome.clone(),
        });

        Accepted { id, outcome }
    }

    /// Closes a live notification and moves its record to history.
    ///
    /// Returns `false` if `id` is not live, which makes repeated closes no-ops.
    pub fn close(
        &mut self,
        id: &NotificationId,
        reason: CloseReason,
        history: &mut HistoryStore,
    ) -> bool {
        let Some(position) = self.position(id) else {
            debug!(%id, %reason, "close ignored, notification not live");
            return false;
        };

        self.historize_at(position, reason, history);
        if self.items.is_empty() {
            debug!("live stack emptied");
            self.subscribers.publish(LiveEvent::Emptied);
        }
        true
    }

    /// Dismisses every live notification. Returns how many were closed.
    pub fn close_all(&mut self, history: &mut HistoryStore) -> usize {
        let ids: Vec<NotificationId> = self.items.iter().map(|item| item.id().clone()).collect();
        ids.iter()
            .filter(|id| self.close(id, CloseReason::Dismissed, history))
            .count()
    }

    /// Moves the selection by `delta` positions without wrapping.
    ///
    /// Returns `false` when there is nothing to navigate or the target is out
    /// of range.
    pub fn navigate(&mut self, delta: isize) -> bool {
        if self.items.len() <= 1 {
            return false;
        }
        let Some(current) = self.current else {
            return false;
        };
        let Some(target) = current
            .checked_add_signed(delta)
            .filter(|target| *target < self.items.len() && *target != current)
        else {
            return false;
        };

        self.current = Some(target);
        debug!(from = current, to = target, "navigated live stack");
        self.subscribers
            .publish(LiveEvent::Navigated { index: target });
        true
    }

    /// Stops every countdown, typically while the pointer is over the stack.
    pub fn pause_all(&mut self) {
        self.timeouts.pause_all();
        for item in &mut self.items {
            if item.state == LiveState::Active && item.timeout_ms > 0 {
                item.state = LiveState::Paused;
            }
        }
    }

    /// Restarts every countdown at its full duration.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime when countdowns are registered.
    pub fn resume_all(&mut self) {
        self.timeouts.resume_all();
        for item in &mut self.items {
            if item.state == LiveState::Paused {
                item.state = LiveState::Active;
            }
        }
    }

    /// Closes the notification of an elapsed countdown, if it is still current.
    pub fn handle_expiry(&mut self, expiry: Expiry, history: &mut HistoryStore) -> bool {
        if !self.timeouts.accept_expiry(&expiry) {
            debug!(id = %expiry.id, "stale expiry ignored");
            return false;
        }
        self.close(&expiry.id, CloseReason::Expired, history)
    }

    /// Runs an action of a live notification and dismisses it.
    ///
    /// Returns `false` for unknown notifications or actions and for actions
    /// that already ran.
    pub fn invoke_action(
        &mut self,
        id: &NotificationId,
        action_key: &str,
        history: &mut HistoryStore,
    ) -> bool {
        let Some(position) = self.position(id) else {
            return false;
        };
        let Some(invoke) = self.items[position]
            .actions
            .iter_mut()
            .find(|action| action.key == action_key)
            .and_then(|action| action.invoke.take())
        else {
            debug!(%id, action_key, "action not available");
            return false;
        };

        info!(%id, action_key, "invoking notification action");
        invoke();
        self.subscribers.publish(LiveEvent::ActionInvoked {
            id: id.clone(),
            action_key: action_key.to_string(),
        });
        self.close(id, CloseReason::Dismissed, history)
    }

    fn ingest(&self, incoming: IncomingNotification, images: &ImageCache) -> LiveNotification {
        let id = NotificationId::from(Uuid::new_v4().to_string());
        let cached_image_path = incoming
            .image
            .as_ref()
            .and_then(|image| images.store(&id, image));

        let record = NotificationRecord {
            id,
            app_icon: non_empty_or(incoming.app_icon, DEFAULT_APP_ICON),
            summary: incoming.summary,
            body: incoming.body,
            app_name: non_empty_or(incoming.app_name, DEFAULT_APP_NAME),
            timestamp: Local::now(),
            cached_image_path,
        };

        LiveNotification {
            record,
            actions: incoming.actions,
            timeout_ms: self.effective_timeout_ms(incoming.requested_timeout_ms),
            state: LiveState::Active,
        }
    }

    fn effective_timeout_ms(&self, requested_timeout_ms: i32) -> u64 {
        match requested_timeout_ms {
            0 => 0,
            x if x < 0 => self.cfg.default_timeout_ms,
            x => u64::try_from(x).unwrap_or(self.cfg.default_timeout_ms),
        }
    }

    fn position(&self, id: &NotificationId) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    /// Removes the item at `position`, hands its record to history and
    /// publishes the close. Does not announce an empty stack.
    fn historize_at(
        &mut self,
        position: usize,
        reason: CloseReason,
        history: &mut HistoryStore,
    ) -> NotificationId {
        let id = self.items[position].id().clone();
        self.timeouts.cancel(&id);
        self.items[position].state = LiveState::Closing;

        let item = self.remove_at(position);
        history.add(item.record);
        debug!(%id, %reason, remaining = self.items.len(), "live notification closed");

        self.subscribers.publish(LiveEvent::Closed {
            id: id.clone(),
            reason,
        });
        id
    }

    fn remove_at(&mut self, position: usize) -> LiveNotification {
        let item = self.items.remove(position);

        self.current = match self.current {
            _ if self.items.is_empty() => None,
            Some(current) if position < current => Some(current - 1),
            Some(current) if position == current => Some(current.saturating_sub(1)),
            Some(current) => Some(current),
            None => Some(self.items.len() - 1),
        }
        .map(|index| index.min(self.items.len() - 1));

        item
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}
