use std::{collections::HashMap, time::Duration};

use modus_types::NotificationId;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::debug;

/// A countdown that elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    /// Notification whose countdown elapsed.
    pub id: NotificationId,
    generation: u64,
}

#[derive(Debug)]
struct Timer {
    duration: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Drives at most one countdown per live notification.
///
/// Each running countdown is a task that sleeps and then reports an
/// [`Expiry`]; the owner confirms it with
/// [`accept_expiry`](Self::accept_expiry).
///
/// Pausing is level-triggered and applies to every timer at once. Resuming
/// restarts each timer at its full original duration rather than at the time
/// that was left.
#[derive(Debug)]
pub struct TimeoutController {
    timers: HashMap<NotificationId, Timer>,
    paused: bool,
    next_generation: u64,
    expired: mpsc::UnboundedSender<Expiry>,
}

impl TimeoutController {
    /// Creates a controller and the receiver its expiries are delivered on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (expired, receiver) = mpsc::unbounded_channel();
        let controller = Self {
            timers: HashMap::new(),
            paused: false,
            next_generation: 1,
            expired,
        };

        (controller, receiver)
    }

    /// Starts (or restarts) the countdown for `id`.
    ///
    /// A zero duration means the notification never expires; any previous
    /// timer for `id` is dropped. While paused the timer is registered but
    /// only starts counting on [`resume_all`](Self::resume_all).
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime with a non-zero duration.
    pub fn start(&mut self, id: &NotificationId, duration_ms: u64) {
        self.cancel(id);
        if duration_ms == 0 {
            debug!(%id, "no timeout requested");
            return;
        }

        let mut timer = Timer {
            duration: Duration::from_millis(duration_ms),
            generation: self.bump_generation(),
            task: None,
        };
        if !self.paused {
            timer.task = Some(spawn_countdown(
                self.expired.clone(),
                id.clone(),
                timer.generation,
                timer.duration,
            ));
        }
        debug!(%id, duration_ms, paused = self.paused, "timeout armed");
        self.timers.insert(id.clone(), timer);
    }

    /// Stops every running countdown. Calling it again is a no-op.
    pub fn pause_all(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        for timer in self.timers.values_mut() {
            timer.stop();
        }
        debug!(timers = self.timers.len(), "timeouts paused");
    }

    /// Restarts every registered countdown at its full duration.
    ///
    /// No-op unless currently paused.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime while timers are registered.
    pub fn resume_all(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;

        let mut generation = self.next_generation;
        for (id, timer) in self.timers.iter_mut() {
            timer.generation = generation;
            generation = generation.saturating_add(1);
            timer.task = Some(spawn_countdown(
                self.expired.clone(),
                id.clone(),
                timer.generation,
                timer.duration,
            ));
        }
        self.next_generation = generation;
        debug!(timers = self.timers.len(), "timeouts resumed");
    }

    /// Stops and forgets the countdown for `id`. Unknown ids are ignored.
    pub fn cancel(&mut self, id: &NotificationId) {
        if let Some(mut timer) = self.timers.remove(id) {
            timer.stop();
            debug!(%id, "timeout cancelled");
        }
    }

    /// Confirms an expiry and forgets its timer.
    ///
    /// Returns `false` for expiries of cancelled, restarted or paused timers.
    pub fn accept_expiry(&mut self, expiry: &Expiry) -> bool {
        if self.paused {
            return false;
        }
        let current = self
            .timers
            .get(&expiry.id)
            .is_some_and(|timer| timer.generation == expiry.generation);
        if current {
            self.timers.remove(&expiry.id);
        }
        current
    }

    /// Returns whether `id` has a registered countdown.
    pub fn has_timer(&self, id: &NotificationId) -> bool {
        self.timers.contains_key(id)
    }

    /// Returns whether timers are currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.saturating_add(1);
        generation
    }
}

impl Drop for TimeoutController {
    fn drop(&mut self) {
        for timer in self.timers.values_mut() {
            timer.stop();
        }
    }
}

fn spawn_countdown(
    expired: mpsc::UnboundedSender<Expiry>,
    id: NotificationId,
    generation: u64,
    duration: Duration,
) -> JoinHandle<()> {
    let deadline = Instant::now() + duration;
    tokio::spawn(async move {
        sleep_until(deadline).await;
        // The receiver only goes away together with the controller's owner.
        let _ = expired.send(Expiry { id, generation });
    })
}
