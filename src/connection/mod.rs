//! Connection Monitor
//!
//! Tracks connectivity from two inputs: the runtime online/offline signal and
//! transport errors reported by remote-store callers. Transient errors drive
//! a bounded retry cycle that bounces the remote store's network layer after
//! an exponential delay. Every state change goes through one transition
//! function and is delivered synchronously to listeners before it returns.

pub mod backoff;
pub mod classify;

pub use backoff::Backoff;
pub use classify::{ErrorClassifier, PatternClassifier};

use crate::error::{ErrorKind, SyncError};
use crate::remote::{NetworkControl, RemoteError};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            error: None,
            retry_count: 0,
        }
    }
}

/// What `report_error` did with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// A reconnect is scheduled after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// The retry ceiling was exceeded; the monitor is now disconnected.
    GaveUp { attempts: u32 },
    /// Transient, but the cycle already gave up or the monitor is disposed.
    Suppressed,
    /// Not a transport problem.
    Ignored(ErrorKind),
}

/// User-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    RetriesExhausted { attempts: u32, last_error: String },
    Restored,
}

/// Floor for the health check period; `tokio::time::interval` rejects zero.
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub health_check_interval: Duration,
    pub jitter: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
            health_check_interval: Duration::from_secs(30),
            jitter: false,
        }
    }
}

type StatusListener = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    online: bool,
    gave_up: bool,
    restore_pending: bool,
    disposed: bool,
    reconnect_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

impl Inner {
    fn reconnect_pending(&self) -> bool {
        self.reconnect_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn abort_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

pub struct ConnectionMonitor {
    me: Weak<ConnectionMonitor>,
    network: Arc<dyn NetworkControl>,
    classifier: Arc<dyn ErrorClassifier>,
    backoff: Backoff,
    config: MonitorConfig,
    inner: Mutex<Inner>,
    listeners: Mutex<HashMap<u64, StatusListener>>,
    next_listener_id: AtomicU64,
    /// Held across a state update and its delivery, so listeners see
    /// transitions in order. Reentrant so a listener may trigger a transition.
    delivery: ReentrantMutex<()>,
    status_tx: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<ConnectionNotice>,
}

impl ConnectionMonitor {
    pub fn new(
        network: Arc<dyn NetworkControl>,
        classifier: Arc<dyn ErrorClassifier>,
        config: MonitorConfig,
    ) -> Arc<Self> {
        let backoff = Backoff::new(config.base_delay, config.max_delay).with_jitter(config.jitter);
        let (status_tx, _) = watch::channel(ConnectionState::default());
        let (notices, _) = broadcast::channel(16);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            network,
            classifier,
            backoff,
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::default(),
                online: true,
                gave_up: false,
                restore_pending: false,
                disposed: false,
                reconnect_task: None,
                health_task: None,
            }),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            delivery: ReentrantMutex::new(()),
            status_tx,
            notices,
        })
    }

    /// Start the health check and settle the initial status from the
    /// runtime online signal.
    pub async fn init(&self) {
        let me = self.me.clone();
        let interval = self
            .config
            .health_check_interval
            .max(MIN_HEALTH_CHECK_INTERVAL);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = me.upgrade() else { break };
                monitor.health_check().await;
            }
        });

        let online = {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.health_task.replace(task) {
                old.abort();
            }
            inner.online
        };

        let status = if online {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        self.update(|inner| {
            inner.state.status = status;
            inner.state.error = None;
        });
        info!("Connection monitor started ({})", status);
    }

    /// Stop background tasks and drop every listener.
    pub fn dispose(&self) {
        {
            let mut inner = self.inner.lock();
            inner.disposed = true;
            inner.abort_reconnect();
            if let Some(task) = inner.health_task.take() {
                task.abort();
            }
        }
        self.listeners.lock().clear();
        debug!("Connection monitor disposed");
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().state.status
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().online
    }

    /// Register a listener. It receives the current state immediately, then
    /// every subsequent transition.
    pub fn on_status_changed<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let listener: StatusListener = Arc::new(listener);
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);

        let _delivery = self.delivery.lock();
        self.listeners.lock().insert(id, listener.clone());
        let current = self.state();
        listener(&current);

        ListenerGuard {
            id,
            monitor: self.me.clone(),
            active: true,
        }
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status_tx.subscribe()
    }

    pub fn notifications(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.notices.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Convert a raw backend error into the crate taxonomy.
    pub fn classify(&self, error: &RemoteError) -> SyncError {
        SyncError::from_kind(self.classifier.classify(error), error.to_string())
    }

    pub fn classifier(&self) -> Arc<dyn ErrorClassifier> {
        self.classifier.clone()
    }

    /// A remote call succeeded: the consecutive error count starts over.
    pub fn record_success(&self) {
        self.update(|inner| {
            inner.state.retry_count = 0;
            if inner.state.status == ConnectionStatus::Error && inner.online {
                inner.abort_reconnect();
                inner.state.status = ConnectionStatus::Connected;
                inner.state.error = None;
            }
        });
    }

    /// Feed a remote-store error into the retry cycle.
    pub fn report_error(&self, error: &RemoteError) -> ErrorOutcome {
        let kind = self.classifier.classify(error);
        if kind != ErrorKind::Transient {
            debug!("Ignoring non-transport error ({:?}): {}", kind, error);
            return ErrorOutcome::Ignored(kind);
        }

        let message = error.to_string();
        let max_retries = self.config.max_retries;
        let outcome = self.update(|inner| {
            if inner.disposed || inner.gave_up {
                return ErrorOutcome::Suppressed;
            }

            inner.state.retry_count += 1;
            let attempt = inner.state.retry_count;
            inner.state.error = Some(message.clone());

            if attempt > max_retries {
                inner.abort_reconnect();
                inner.state.status = ConnectionStatus::Disconnected;
                inner.state.retry_count = 0;
                inner.gave_up = true;
                inner.restore_pending = true;
                ErrorOutcome::GaveUp {
                    attempts: max_retries,
                }
            } else {
                inner.state.status = ConnectionStatus::Error;
                ErrorOutcome::Retrying {
                    attempt,
                    delay: self.backoff.delay_for(attempt),
                }
            }
        });

        match &outcome {
            ErrorOutcome::Retrying { attempt, delay } => {
                warn!(
                    "Transport error (attempt {}/{}), reconnecting in {:?}: {}",
                    attempt, max_retries, delay, message
                );
                self.schedule_reconnect(*delay);
            }
            ErrorOutcome::GaveUp { attempts } => {
                warn!(
                    "Giving up after {} reconnect attempts: {}",
                    attempts, message
                );
                let _ = self.notices.send(ConnectionNotice::RetriesExhausted {
                    attempts: *attempts,
                    last_error: message,
                });
            }
            _ => {}
        }
        outcome
    }

    /// Runtime online/offline edge.
    pub async fn set_online(&self, online: bool) {
        let (was_online, status) = {
            let mut inner = self.inner.lock();
            let was = inner.online;
            inner.online = online;
            (was, inner.state.status)
        };

        if !online {
            info!("Runtime reports offline");
            self.update(|inner| {
                inner.abort_reconnect();
                inner.state.status = ConnectionStatus::Disconnected;
            });
            return;
        }

        if was_online && status == ConnectionStatus::Connected {
            return;
        }
        info!("Runtime reports online");
        self.start_fresh_cycle();
        self.reconnect().await;
    }

    /// Visibility/resume edge. Sockets may have died silently during the
    /// suspension, so bounce the network layer whenever the runtime is online.
    pub async fn on_resume(&self) {
        if !self.is_online() {
            return;
        }
        debug!("Resume signal, reconnecting");
        self.start_fresh_cycle();
        self.reconnect().await;
    }

    fn start_fresh_cycle(&self) {
        self.update(|inner| {
            inner.gave_up = false;
            inner.state.retry_count = 0;
            inner.abort_reconnect();
        });
    }

    async fn health_check(&self) {
        let due = {
            let inner = self.inner.lock();
            !inner.disposed
                && !inner.gave_up
                && inner.online
                && !inner.reconnect_pending()
                && matches!(
                    inner.state.status,
                    ConnectionStatus::Error | ConnectionStatus::Disconnected
                )
        };
        if due {
            debug!("Health check found a stuck connection, reconnecting");
            self.reconnect().await;
        }
    }

    fn schedule_reconnect(&self, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, reconnect not scheduled");
            return;
        };

        let me = self.me.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(monitor) = me.upgrade() {
                monitor.reconnect().await;
            }
        });

        let mut inner = self.inner.lock();
        if inner.disposed || inner.gave_up {
            task.abort();
            return;
        }
        if let Some(old) = inner.reconnect_task.replace(task) {
            old.abort();
        }
    }

    /// Bounce the remote network layer and settle on the outcome.
    async fn reconnect(&self) {
        if self.inner.lock().disposed {
            return;
        }
        if !self.is_online() {
            self.update(|inner| inner.state.status = ConnectionStatus::Disconnected);
            return;
        }

        self.update(|inner| inner.state.status = ConnectionStatus::Connecting);

        if let Err(e) = self.network.disable_network().await {
            debug!("disable_network failed during reconnect: {}", e);
        }
        let result = self.network.enable_network().await;

        self.update(|inner| match &result {
            Ok(()) if inner.online => {
                inner.state.status = ConnectionStatus::Connected;
                inner.state.error = None;
            }
            Ok(()) => inner.state.status = ConnectionStatus::Disconnected,
            Err(e) => {
                inner.state.status = ConnectionStatus::Error;
                inner.state.error = Some(e.to_string());
            }
        });

        match result {
            Ok(()) => debug!("Reconnect finished: {}", self.status()),
            Err(e) => warn!("Reconnect failed: {}", e),
        }
    }

    /// The single state-transition function. Mutates under lock, then
    /// publishes the new state if it changed.
    fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let _delivery = self.delivery.lock();

        let (result, changed, restored) = {
            let mut inner = self.inner.lock();
            let before = inner.state.clone();
            let result = f(&mut inner);

            let changed = (inner.state != before).then(|| inner.state.clone());
            let restored = inner.restore_pending
                && inner.state.status == ConnectionStatus::Connected
                && before.status != ConnectionStatus::Connected;
            if restored {
                inner.restore_pending = false;
            }
            (result, changed, restored)
        };

        if let Some(state) = changed {
            if restored {
                info!("Connection restored");
                let _ = self.notices.send(ConnectionNotice::Restored);
            }
            self.status_tx.send_replace(state.clone());

            let listeners: Vec<StatusListener> = self.listeners.lock().values().cloned().collect();
            for listener in listeners {
                listener(&state);
            }
        }
        result
    }

    fn remove_listener(&self, id: u64) {
        self.listeners.lock().remove(&id);
    }
}

/// Registration of one status listener. Unsubscribing twice is a no-op and
/// never affects other listeners; dropping the guard unsubscribes.
#[must_use = "dropping a ListenerGuard unsubscribes the listener"]
pub struct ListenerGuard {
    id: u64,
    monitor: Weak<ConnectionMonitor>,
    active: bool,
}

impl ListenerGuard {
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.remove_listener(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
