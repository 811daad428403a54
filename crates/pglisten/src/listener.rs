//! Consumer-facing listener
//!
//! # Example
//!
//! ```rust,no_run
//! use pglisten::{Listener, ListenerConfig};
//!
//! # async fn example() -> pglisten::Result<()> {
//! let config = ListenerConfig::new("localhost", "weather")
//!     .with_credentials("postgres", "secret")
//!     .with_channel("observations");
//!
//! let listener = Listener::new(config)?;
//! listener.on_notification(|n| {
//!     println!("{} #{}: {:?}", n.channel, n.sequence, n.payload_str());
//! });
//! listener.on_state_change(|state| println!("state: {}", state));
//!
//! listener.start()?;
//! listener.subscribe("alerts").await?;
//! // ...
//! listener.stop().await?;
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ListenerConfig;
use crate::controller::{ControlSignals, ControllerStats, ListenerState, ReconnectController};
use crate::dispatcher::NotificationDispatcher;
use crate::error::{Error, ErrorCategory, Result};
use crate::hooks::Hooks;
use crate::notification::Notification;
use crate::postgres::PgConnector;
use crate::session::Connector;
use crate::subscription::{ChannelSubscription, SubscriptionManager};

/// Listener counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Events read from the network
    pub received: u64,
    /// Notifications handed to callbacks
    pub delivered: u64,
    /// Notifications discarded by the overflow policy
    pub dropped: u64,
    /// Events skipped because they failed to decode
    pub malformed: u64,
    /// Sessions established after the first one
    pub reconnects: u64,
    /// Failed connection attempts
    pub connect_failures: u64,
    /// Sequence number of the most recent notification
    pub sequence: u64,
    /// Notifications waiting for delivery
    pub queued: usize,
}

struct Tasks {
    controller: JoinHandle<Result<()>>,
    delivery: Option<JoinHandle<()>>,
}

/// Durable LISTEN/NOTIFY listener
///
/// Survives connection loss: the channel set is replayed on every new session
/// and registered callbacks keep receiving notifications with a sequence that
/// continues across reconnections.
pub struct Listener {
    config: Arc<ListenerConfig>,
    connector: Arc<dyn Connector>,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: Arc<NotificationDispatcher>,
    hooks: Arc<Hooks>,
    state: Arc<watch::Sender<ListenerState>>,
    signals: Arc<ControlSignals>,
    controller_stats: Arc<ControllerStats>,
    started: AtomicBool,
    tasks: Mutex<Option<Tasks>>,
}

impl Listener {
    /// Create a PostgreSQL listener
    pub fn new(config: ListenerConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(PgConnector))
    }

    /// Create a listener that opens sessions through `connector`
    ///
    /// Channels listed in the configuration are added to the subscription set.
    pub fn with_connector(config: ListenerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let subscriptions = SubscriptionManager::with_channels(
            config.timeouts.command(),
            config.channels.iter().cloned(),
        )?;
        let hooks = Arc::new(Hooks::new());
        let dispatcher =
            NotificationDispatcher::new(&config.queue, config.payload_format, hooks.clone());

        Ok(Self {
            config: Arc::new(config),
            connector,
            subscriptions: Arc::new(subscriptions),
            dispatcher: Arc::new(dispatcher),
            hooks,
            state: Arc::new(watch::channel(ListenerState::Disconnected).0),
            signals: Arc::new(ControlSignals::default()),
            controller_stats: Arc::new(ControllerStats::default()),
            started: AtomicBool::new(false),
            tasks: Mutex::new(None),
        })
    }

    /// Start connecting and delivering
    ///
    /// Must be called from within a Tokio runtime. Returns immediately; watch
    /// [`on_state_change`](Self::on_state_change) to learn when the session is up.
    pub fn start(&self) -> Result<()> {
        if self.signals.is_shutdown() {
            return Err(Error::Shutdown);
        }
        tokio::runtime::Handle::try_current()
            .map_err(|_| Error::not_running("start() requires a Tokio runtime"))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let delivery = self.dispatcher.spawn_delivery();
        let controller = ReconnectController::new(
            self.config.clone(),
            self.connector.clone(),
            self.subscriptions.clone(),
            self.dispatcher.clone(),
            self.hooks.clone(),
            self.state.clone(),
            self.signals.clone(),
            self.controller_stats.clone(),
        )
        .spawn();

        *self.tasks.lock() = Some(Tasks {
            controller,
            delivery,
        });
        Ok(())
    }

    /// Shut down and wait for background tasks to exit
    ///
    /// Stops the backoff timer, closes the current session, and discards
    /// undelivered notifications. A callback that is already running is
    /// allowed to finish. Calling `stop` again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        self.signals.shutdown();
        self.dispatcher.close();

        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            if !self.started.load(Ordering::SeqCst) {
                self.publish_state(ListenerState::Stopped);
            }
            return Ok(());
        };

        match tasks.controller.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "controller had already failed"),
            Err(e) => error!(error = %e, "controller task panicked"),
        }
        if let Some(delivery) = tasks.delivery {
            if let Err(e) = delivery.await {
                error!(error = %e, "delivery task panicked");
            }
        }

        // A controller that failed never reaches Stopped on its own.
        self.publish_state(ListenerState::Stopped);
        info!("listener shut down");
        Ok(())
    }

    /// Drop the current session and reconnect right away
    pub fn reconnect(&self) {
        self.signals.reconnect();
    }

    /// Add a channel; sends `LISTEN` immediately when connected
    ///
    /// A rejected or unacknowledged command is returned and also reported to
    /// the [`on_error`](Self::on_error) callbacks. The channel stays in the set
    /// and is retried on the next session.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        if self.signals.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let result = self.subscriptions.subscribe(channel).await;
        self.report_command(result)
    }

    /// Remove a channel; sends `UNLISTEN` immediately when connected
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        if self.signals.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let result = self.subscriptions.unsubscribe(channel).await;
        self.report_command(result)
    }

    /// Register a notification callback
    ///
    /// Callbacks run on the delivery task, one notification at a time, in
    /// registration order.
    pub fn on_notification<F>(&self, callback: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.hooks.on_notification(Arc::new(callback));
    }

    /// Register a callback for non-fatal errors and the terminal failure
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.hooks.on_error(Arc::new(callback));
    }

    /// Register a callback for state transitions
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(ListenerState) + Send + Sync + 'static,
    {
        self.hooks.on_state_change(Arc::new(callback));
    }

    /// Current state
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Wait until the listener is stopped or has failed
    pub async fn wait(&self) -> ListenerState {
        let mut rx = self.state.subscribe();
        let terminal = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        terminal
    }

    /// Subscribed channel names, in insertion order
    pub fn channels(&self) -> Vec<String> {
        self.subscriptions.channels()
    }

    /// Subscribed channels with their acknowledgement status
    pub fn subscriptions(&self) -> Vec<ChannelSubscription> {
        self.subscriptions.subscriptions()
    }

    /// Snapshot counters
    pub fn stats(&self) -> ListenerStats {
        let dispatch = self.dispatcher.stats();
        let sessions = self.controller_stats.sessions.load(Ordering::Relaxed);
        ListenerStats {
            received: dispatch.received,
            delivered: dispatch.delivered,
            dropped: dispatch.dropped,
            malformed: dispatch.malformed,
            reconnects: sessions.saturating_sub(1),
            connect_failures: self.controller_stats.connect_failures.load(Ordering::Relaxed),
            sequence: dispatch.last_sequence,
            queued: dispatch.queued,
        }
    }

    /// Effective configuration
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    fn report_command(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            // Invalid channel names are the caller's problem, not the session's.
            if e.category() != ErrorCategory::Configuration {
                self.hooks.emit_error(e);
            }
        }
        result
    }

    fn publish_state(&self, next: ListenerState) {
        if self.state.send_replace(next) != next {
            self.hooks.emit_state(next);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.signals.shutdown();
        self.dispatcher.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("endpoint", &self.config.endpoint())
            .field("backend", &self.connector.name())
            .field("state", &self.state())
            .field("channels", &self.channels())
            .finish()
    }
}
