use modus_types::{
    CloseReason, HistoryEvent, LiveEvent, NotificationAction, NotificationId, NotificationRecord,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::AppConfig,
    history::{HistoryConfig, HistoryStore, StoreLock},
    image_cache::ImageCache,
    live::{Accepted, IncomingNotification, LiveConfig, LiveStack, LiveState},
    subscribers::{DEFAULT_CHANNEL_CAPACITY, Subscription},
    timeout::Expiry,
};

/// Errors returned by [`CenterHandle`].
#[derive(Debug, Error)]
pub enum CenterError {
    /// The center stopped running.
    #[error("notification center is not running")]
    ChannelClosed,
}

/// A request for a running center.
#[derive(Debug)]
pub enum Command {
    Notify {
        notification: IncomingNotification,
        reply: Option<oneshot::Sender<Accepted>>,
    },
    Close {
        id: NotificationId,
        reason: CloseReason,
    },
    CloseAll,
    Navigate {
        delta: isize,
    },
    PauseAll,
    ResumeAll,
    InvokeAction {
        id: NotificationId,
        action_key: String,
    },
    SetDnd {
        enabled: bool,
    },
    ToggleDnd,
    DeleteRecord {
        id: NotificationId,
    },
    ClearHistory,
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    SubscribeHistory {
        reply: oneshot::Sender<Subscription<HistoryEvent>>,
    },
    SubscribeLive {
        reply: oneshot::Sender<Subscription<LiveEvent>>,
    },
}

/// A live notification as seen from outside the center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEntry {
    pub record: NotificationRecord,
    pub actions: Vec<NotificationAction>,
    pub timeout_ms: u64,
    pub state: LiveState,
}

/// Point-in-time copy of everything an observer can pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub live: Vec<LiveEntry>,
    pub current_index: Option<usize>,
    /// Oldest first.
    pub history: Vec<NotificationRecord>,
    pub dnd_enabled: bool,
    pub paused: bool,
}

/// Owner of the history store and the live stack.
#[derive(Debug)]
pub struct NotificationCenter {
    history: HistoryStore,
    live: LiveStack,
    expiries: mpsc::UnboundedReceiver<Expiry>,
    lock: Option<StoreLock>,
}

impl NotificationCenter {
    /// Builds a center from application config.
    pub fn new(cfg: &AppConfig) -> Self {
        Self::from_parts(cfg.history_config(), cfg.image_cache(), cfg.live_config())
    }

    /// Locks and opens the history store, then sweeps cached images no record
    /// refers to.
    ///
    /// If another process holds the history lock the center still runs but
    /// skips the sweep, since the other owner's live images are not in the
    /// history file.
    pub fn from_parts(history: HistoryConfig, images: ImageCache, live: LiveConfig) -> Self {
        let lock = match StoreLock::acquire(&history.history_path) {
            Ok(lock) => Some(lock),
            Err(err) => {
                warn!(%err, "notification history is shared, skipping orphan sweep");
                None
            }
        };
        let history = HistoryStore::open(history, images);
        if lock.is_some() {
            history.sweep_orphans();
        }
        let (live, expiries) = LiveStack::new(live);

        Self {
            history,
            live,
            expiries,
            lock,
        }
    }

    /// Whether this center exclusively owns its history files.
    pub fn owns_history(&self) -> bool {
        self.lock.is_some()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn live(&self) -> &LiveStack {
        &self.live
    }

    /// Accepts an incoming notification.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime when the notification gets a countdown.
    pub fn notify(&mut self, notification: IncomingNotification) -> Accepted {
        self.live.accept(notification, &mut self.history)
    }

    pub fn close(&mut self, id: &NotificationId, reason: CloseReason) -> bool {
        self.live.close(id, reason, &mut self.history)
    }

    pub fn close_all(&mut self) -> usize {
        self.live.close_all(&mut self.history)
    }

    pub fn navigate(&mut self, delta: isize) -> bool {
        self.live.navigate(delta)
    }

    pub fn pause_all(&mut self) {
        self.live.pause_all();
    }

    /// # Panics
    ///
    /// Panics outside a tokio runtime when countdowns are registered.
    pub fn resume_all(&mut self) {
        self.live.resume_all();
    }

    pub fn invoke_action(&mut self, id: &NotificationId, action_key: &str) -> bool {
        self.live.invoke_action(id, action_key, &mut self.history)
    }

    pub fn set_dnd(&mut self, enabled: bool) -> bool {
        self.history.set_dnd(enabled)
    }

    pub fn toggle_dnd(&mut self) -> bool {
        self.history.toggle_dnd()
    }

    pub fn delete_record(&mut self, id: &NotificationId) -> bool {
        self.history.delete(id)
    }

    pub fn clear_history(&mut self) -> usize {
        self.history.clear_all()
    }

    pub fn subscribe_history(&mut self) -> Subscription<HistoryEvent> {
        self.history.subscribe()
    }

    pub fn subscribe_live(&mut self) -> Subscription<LiveEvent> {
        self.live.subscribe()
    }

    /// Closes the notification of an elapsed timer.
    pub fn handle_expiry(&mut self, expiry: Expiry) -> bool {
        self.live.handle_expiry(expiry, &mut self.history)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            live: self
                .live
                .items()
                .iter()
                .map(|item| LiveEntry {
                    record: item.record().clone(),
                    actions: item.actions().iter().map(|action| action.descriptor()).collect(),
                    timeout_ms: item.timeout_ms(),
                    state: item.state(),
                })
                .collect(),
            current_index: self.live.current_index(),
            history: self.history.records().to_vec(),
            dnd_enabled: self.history.dnd_enabled(),
            paused: self.live.is_paused(),
        }
    }

    /// Executes one command.
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Notify {
                notification,
                reply,
            } => {
                let accepted = self.notify(notification);
                if let Some(reply) = reply {
                    let _ = reply.send(accepted);
                }
            }
            Command::Close { id, reason } => {
                self.close(&id, reason);
            }
            Command::CloseAll => {
                self.close_all();
            }
            Command::Navigate { delta } => {
                self.navigate(delta);
            }
            Command::PauseAll => self.pause_all(),
            Command::ResumeAll => self.resume_all(),
            Command::InvokeAction { id, action_key } => {
                self.invoke_action(&id, &action_key);
            }
            Command::SetDnd { enabled } => {
                self.set_dnd(enabled);
            }
            Command::ToggleDnd => {
                self.toggle_dnd();
            }
            Command::DeleteRecord { id } => {
                self.delete_record(&id);
            }
            Command::ClearHistory => {
                self.clear_history();
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::SubscribeHistory { reply } => {
                let _ = reply.send(self.subscribe_history());
            }
            Command::SubscribeLive { reply } => {
                let _ = reply.send(self.subscribe_live());
            }
        }
    }

    /// Processes commands and timer expiries until every handle is dropped.
    ///
    /// Due expiries are handled before pending commands.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Self {
        info!("notification center running");
        loop {
            tokio::select! {
                biased;

                Some(expiry) = self.expiries.recv() => {
                    self.handle_expiry(expiry);
                }
                command = commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
            }
        }
        debug!("all center handles dropped");
        self
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self) -> (CenterHandle, JoinHandle<Self>) {
        let (handle, commands) = CenterHandle::channel(DEFAULT_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(commands));
        (handle, task)
    }
}

/// Cloneable sender of [`Command`]s to a running center.
#[derive(Debug, Clone)]
pub struct CenterHandle {
    commands: mpsc::Sender<Command>,
}

impl CenterHandle {
    /// Creates a handle and the receiver to pass to [`NotificationCenter::run`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (commands, receiver) = mpsc::channel(capacity.max(1));
        (Self { commands }, receiver)
    }

    pub async fn send(&self, command: Command) -> Result<(), CenterError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CenterError::ChannelClosed)
    }

    pub async fn notify(&self, notification: IncomingNotification) -> Result<Accepted, CenterError> {
        let (reply, accepted) = oneshot::channel();
        self.send(Command::Notify {
            notification,
            reply: Some(reply),
        })
        .await?;
        accepted.await.map_err(|_| CenterError::ChannelClosed)
    }

    pub async fn close(&self, id: NotificationId, reason: CloseReason) -> Result<(), CenterError> {
        self.send(Command::Close { id, reason }).await
    }

    pub async fn close_all(&self) -> Result<(), CenterError> {
        self.send(Command::CloseAll).await
    }

    pub async fn navigate(&self, delta: isize) -> Result<(), CenterError> {
        self.send(Command::Navigate { delta }).await
    }

    pub async fn pause_all(&self) -> Result<(), CenterError> {
        self.send(Command::PauseAll).await
    }

    pub async fn resume_all(&self) -> Result<(), CenterError> {
        self.send(Command::ResumeAll).await
    }

    pub async fn invoke_action(
        &self,
        id: NotificationId,
        action_key: impl Into<String>,
    ) -> Result<(), CenterError> {
        self.send(Command::InvokeAction {
            id,
            action_key: action_key.into(),
        })
        .await
    }

    pub async fn set_dnd(&self, enabled: bool) -> Result<(), CenterError> {
        self.send(Command::SetDnd { enabled }).await
    }

    pub async fn toggle_dnd(&self) -> Result<(), CenterError> {
        self.send(Command::ToggleDnd).await
    }

    pub async fn delete_record(&self, id: NotificationId) -> Result<(), CenterError> {
        self.send(Command::DeleteRecord { id }).await
    }

    pub async fn clear_history(&self) -> Result<(), CenterError> {
        self.send(Command::ClearHistory).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot, CenterError> {
        let (reply, snapshot) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        snapshot.await.map_err(|_| CenterError::ChannelClosed)
    }

    pub async fn subscribe_history(&self) -> Result<Subscription<HistoryEvent>, CenterError> {
        let (reply, subscription) = oneshot::channel();
        self.send(Command::SubscribeHistory { reply }).await?;
        subscription.await.map_err(|_| CenterError::ChannelClosed)
    }

    pub async fn subscribe_live(&self) -> Result<Subscription<LiveEvent>, CenterError> {
        let (reply, subscription) = oneshot::channel();
        self.send(Command::SubscribeLive { reply }).await?;
        subscription.await.map_err(|_| CenterError::ChannelClosed)
    }
}
