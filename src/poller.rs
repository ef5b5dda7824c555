//! Alert polling scheduler.
//!
//! A `Poller` owns one coordinator task. Every aggregation for the poller,
//! whether triggered by the timer or by `refresh()`, runs on that task, so
//! cycles never overlap and snapshots are published in the order they
//! complete. The coordinator is the only writer of the latest snapshot.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::AlertProvider;
use crate::feed::AlertRecord;
use crate::TARGET_POLLER;

/// Immutable result of one poll cycle, shared with every subscriber.
pub type AlertSnapshot = Arc<Vec<AlertRecord>>;

/// Reads the selected region; called once per cycle.
pub type RegionSource = Arc<dyn Fn() -> String + Send + Sync>;

type Callback = Arc<dyn Fn(&AlertSnapshot) + Send + Sync>;

pub const DEFAULT_POLL_MINUTES: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollerError {
    #[error("poller is already running")]
    AlreadyStarted,
    #[error("poller has not been started")]
    NotRunning,
    #[error("poller has been stopped")]
    Stopped,
    #[error("poll interval must be greater than zero")]
    InvalidInterval,
}

enum Command {
    Refresh(oneshot::Sender<AlertSnapshot>),
}

enum PollerState {
    Idle {
        latest_tx: watch::Sender<Option<AlertSnapshot>>,
        finished_tx: watch::Sender<bool>,
    },
    Running {
        cancel: CancellationToken,
        commands: mpsc::Sender<Command>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl Subscribers {
    fn add(&self, callback: Callback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push((id, callback));
        }
        id
    }

    fn remove(&self, id: u64) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.retain(|(existing, _)| *existing != id);
        }
    }

    fn publish(&self, snapshot: &AlertSnapshot) {
        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let callbacks: Vec<Callback> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(snapshot))) {
                error!(
                    target: TARGET_POLLER,
                    "Subscriber panicked while handling {} alerts: {}",
                    snapshot.len(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Handle returned by `Poller::subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(self.id);
        }
    }
}

/// Periodically aggregates alerts and publishes them to subscribers.
///
/// Lifecycle is `Idle -> Running -> Stopped`; a stopped poller cannot be
/// restarted. Callbacks run on the coordinator task and must not call
/// `stop()` or `refresh()` on the same poller. A panicking callback is
/// logged and skipped; the other subscribers and the timer keep going.
pub struct Poller {
    provider: Arc<dyn AlertProvider>,
    region: RegionSource,
    subscribers: Arc<Subscribers>,
    latest_rx: watch::Receiver<Option<AlertSnapshot>>,
    /// Flips to `true` when the coordinator exits. A dropped sender counts too.
    finished_rx: watch::Receiver<bool>,
    state: Mutex<PollerState>,
}

impl Poller {
    pub fn new<F>(provider: Arc<dyn AlertProvider>, region: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        let (latest_tx, latest_rx) = watch::channel(None);
        let (finished_tx, finished_rx) = watch::channel(false);
        Poller {
            provider,
            region: Arc::new(region),
            subscribers: Arc::new(Subscribers::default()),
            latest_rx,
            finished_rx,
            state: Mutex::new(PollerState::Idle {
                latest_tx,
                finished_tx,
            }),
        }
    }

    /// Poller for a region that never changes.
    pub fn with_region(provider: Arc<dyn AlertProvider>, region: impl Into<String>) -> Self {
        let region = region.into();
        Self::new(provider, move || region.clone())
    }

    pub fn start(&self, interval_minutes: u64) -> Result<(), PollerError> {
        self.start_with_period(Duration::from_secs(interval_minutes.saturating_mul(60)))
    }

    /// Load immediately, then every `period`. Must be called inside a Tokio runtime.
    pub fn start_with_period(&self, period: Duration) -> Result<(), PollerError> {
        if period.is_zero() {
            return Err(PollerError::InvalidInterval);
        }

        let mut state = self.state.lock().map_err(|_| PollerError::Stopped)?;
        let (latest_tx, finished_tx) = match std::mem::replace(&mut *state, PollerState::Stopped) {
            PollerState::Idle {
                latest_tx,
                finished_tx,
            } => (latest_tx, finished_tx),
            running @ PollerState::Running { .. } => {
                *state = running;
                return Err(PollerError::AlreadyStarted);
            }
            PollerState::Stopped => return Err(PollerError::Stopped),
        };

        let cancel = CancellationToken::new();
        let (commands, command_rx) = mpsc::channel(16);
        let coordinator = Coordinator {
            provider: Arc::clone(&self.provider),
            region: Arc::clone(&self.region),
            subscribers: Arc::clone(&self.subscribers),
            latest_tx,
            finished_tx,
            cancel: cancel.clone(),
            commands: command_rx,
            period,
        };
        let handle = tokio::spawn(coordinator.run());

        info!(target: TARGET_POLLER, "Alert polling started (interval: {:?})", period);
        *state = PollerState::Running {
            cancel,
            commands,
            handle,
        };
        Ok(())
    }

    /// Run an extra cycle now without moving the timer.
    ///
    /// A request made while a cycle is in flight waits for the next cycle,
    /// which starts as soon as the current one finishes; requests queued
    /// together share that cycle's result.
    pub async fn refresh(&self) -> Result<AlertSnapshot, PollerError> {
        let commands = {
            let state = self.state.lock().map_err(|_| PollerError::Stopped)?;
            match &*state {
                PollerState::Running { commands, .. } => commands.clone(),
                PollerState::Idle { .. } => return Err(PollerError::NotRunning),
                PollerState::Stopped => return Err(PollerError::Stopped),
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(Command::Refresh(reply_tx))
            .await
            .map_err(|_| PollerError::Stopped)?;
        reply_rx.await.map_err(|_| PollerError::Stopped)
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AlertSnapshot) + Send + Sync + 'static,
    {
        let id = self.subscribers.add(Arc::new(callback));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Most recently published snapshot, if any cycle has completed.
    pub fn latest(&self) -> Option<AlertSnapshot> {
        self.latest_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state.lock().as_deref(),
            Ok(PollerState::Running { .. })
        )
    }

    /// Cancel the timer and any in-flight fetches.
    ///
    /// Once this returns no subscriber callback will fire again. That holds
    /// for every caller, including one that arrives while another `stop()`
    /// is still waiting for the coordinator.
    pub async fn stop(&self) {
        let previous = match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, PollerState::Stopped),
            Err(_) => return,
        };

        if let PollerState::Running { cancel, handle, .. } = previous {
            cancel.cancel();
            if let Err(err) = handle.await {
                error!(target: TARGET_POLLER, "Polling task ended abnormally: {}", err);
            }
            info!(target: TARGET_POLLER, "Alert polling stopped");
        }

        // An error means the coordinator is gone (or never started).
        let mut finished = self.finished_rx.clone();
        let _ = finished.wait_for(|done| *done).await;
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let PollerState::Running { cancel, .. } = state {
                cancel.cancel();
            }
        }
    }
}

/// State owned by the polling task.
struct Coordinator {
    provider: Arc<dyn AlertProvider>,
    region: RegionSource,
    subscribers: Arc<Subscribers>,
    latest_tx: watch::Sender<Option<AlertSnapshot>>,
    finished_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    commands: mpsc::Receiver<Command>,
    period: Duration,
}

impl Coordinator {
    async fn run(mut self) {
        self.cycle("initial load").await;

        let mut ticker = time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Refresh(reply)) => {
                        let mut waiting = vec![reply];
                        while let Ok(Command::Refresh(reply)) = self.commands.try_recv() {
                            waiting.push(reply);
                        }
                        debug!(target: TARGET_POLLER, "Manual refresh for {} callers", waiting.len());
                        if let Some(snapshot) = self.cycle("manual refresh").await {
                            for reply in waiting {
                                let _ = reply.send(Arc::clone(&snapshot));
                            }
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.cycle("timer").await;
                }
            }
        }

        debug!(target: TARGET_POLLER, "Polling task exiting");
        self.finished_tx.send_replace(true);
    }

    /// One fetch, merge and publish. Returns `None` if cancelled midway.
    async fn cycle(&self, trigger: &str) -> Option<AlertSnapshot> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let region = (self.region)();
        debug!(target: TARGET_POLLER, "Poll cycle ({}) for region {:?}", trigger, region);

        let alerts = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            alerts = self.provider.aggregate(&region, &self.cancel) => alerts,
        };
        if self.cancel.is_cancelled() {
            return None;
        }

        let snapshot: AlertSnapshot = Arc::new(alerts);
        self.latest_tx.send_replace(Some(Arc::clone(&snapshot)));
        self.subscribers.publish(&snapshot);
        info!(
            target: TARGET_POLLER,
            "Published {} alerts ({})",
            snapshot.len(),
            trigger
        );
        Some(snapshot)
    }
}
