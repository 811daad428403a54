//! Reconnection controller
//!
//! Owns the session lifecycle and runs as a single task:
//!
//! ```text
//!   Disconnected ──start──▶ Connecting ──ok──▶ Connected
//!                             ▲    │               │
//!                   delay     │    │ fail          │ stream ended / health check or command failed
//!                   elapsed   │    ▼               ▼
//!                             └── Backoff ◀────────┘
//! ```
//!
//! On entering `Connected` the controller takes the session's event stream,
//! starts feeding the dispatcher, and replays the subscription set. Feeding and
//! replay run concurrently because the PostgreSQL driver only completes
//! commands while its connection half is being polled.
//!
//! Transient failures are retried forever, bounded by the backoff ceiling.
//! Authentication failures follow [`AuthFailurePolicy`].

use futures::FutureExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::{AuthFailurePolicy, ListenerConfig};
use crate::dispatcher::NotificationDispatcher;
use crate::error::{ConnectErrorKind, Error, Result};
use crate::hooks::Hooks;
use crate::session::{Connector, Session};
use crate::subscription::SubscriptionManager;

/// Observable listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// Not started, or between an explicit reconnect and the next attempt
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Session established; notifications are flowing
    Connected,
    /// Waiting before the next attempt
    Backoff,
    /// Gave up after a fatal error
    Failed,
    /// Shut down by the consumer
    Stopped,
}

impl ListenerState {
    /// Whether the controller has exited
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Backoff => write!(f, "backoff"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Connection counters
#[derive(Debug, Default)]
pub struct ControllerStats {
    /// Sessions that reached `Connected`
    pub sessions: AtomicU64,
    /// Failed connection attempts
    pub connect_failures: AtomicU64,
    /// Sessions lost after being established
    pub disconnects: AtomicU64,
}

/// Signals from the consumer API to the controller task
#[derive(Debug)]
pub struct ControlSignals {
    shutdown: watch::Sender<bool>,
    reconnect: Notify,
}

impl Default for ControlSignals {
    fn default() -> Self {
        Self {
            shutdown: watch::channel(false).0,
            reconnect: Notify::new(),
        }
    }
}

impl ControlSignals {
    /// Ask the controller to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drop the current session and reconnect without waiting for backoff
    ///
    /// A request made while a session is being established is satisfied by
    /// that session.
    pub fn reconnect(&self) {
        self.reconnect.notify_one();
    }

    fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

enum SessionEnd {
    Shutdown,
    Reconnect,
    Lost(Error),
}

/// Drives connect → serve → backoff until shutdown or a fatal error
pub struct ReconnectController {
    config: Arc<ListenerConfig>,
    connector: Arc<dyn Connector>,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: Arc<NotificationDispatcher>,
    hooks: Arc<Hooks>,
    state: Arc<watch::Sender<ListenerState>>,
    signals: Arc<ControlSignals>,
    stats: Arc<ControllerStats>,
    backoff: Backoff,
}

impl ReconnectController {
    /// Create a controller; nothing happens until [`run`](Self::run)
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ListenerConfig>,
        connector: Arc<dyn Connector>,
        subscriptions: Arc<SubscriptionManager>,
        dispatcher: Arc<NotificationDispatcher>,
        hooks: Arc<Hooks>,
        state: Arc<watch::Sender<ListenerState>>,
        signals: Arc<ControlSignals>,
        stats: Arc<ControllerStats>,
    ) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        Self {
            config,
            connector,
            subscriptions,
            dispatcher,
            hooks,
            state,
            signals,
            stats,
            backoff,
        }
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown (`Ok`) or a fatal error (`Err`)
    pub async fn run(mut self) -> Result<()> {
        let mut shutdown = self.signals.subscribe_shutdown();
        info!(
            endpoint = %self.config.endpoint(),
            backend = self.connector.name(),
            channels = self.subscriptions.len(),
            "listener starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ListenerState::Connecting);

            let attempt = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                result = self.connect() => result,
            };

            let skip_backoff = match attempt {
                Ok(session) => {
                    self.stats.sessions.fetch_add(1, Ordering::Relaxed);
                    match self.serve(session, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Reconnect => {
                            info!("reconnect requested");
                            self.set_state(ListenerState::Disconnected);
                            true
                        }
                        SessionEnd::Lost(e) => {
                            self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %e, "session lost");
                            self.hooks.emit_error(&e);
                            false
                        }
                    }
                }
                Err(e) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    self.hooks.emit_error(&e);
                    if e.is_authentication()
                        && self.config.auth_failure_policy == AuthFailurePolicy::Fatal
                    {
                        error!(error = %e, "authentication rejected; giving up");
                        self.set_state(ListenerState::Failed);
                        return Err(e);
                    }
                    warn!(error = %e, "connection attempt failed");
                    false
                }
            };

            if skip_backoff {
                continue;
            }

            self.set_state(ListenerState::Backoff);
            let delay = self.backoff.next_delay();
            info!(
                delay_ms = delay.as_millis() as u64,
                consecutive_failures = self.backoff.state().consecutive_failures,
                "waiting before reconnecting"
            );
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = self.signals.reconnect.notified() => {
                    debug!("backoff cut short by reconnect request");
                }
                _ = sleep(delay) => {}
            }
        }

        self.set_state(ListenerState::Stopped);
        info!("listener stopped");
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn Session>> {
        let limit = self.config.timeouts.connect();
        match timeout(limit, self.connector.connect(&self.config)).await {
            Ok(result) => result,
            Err(_) => Err(Error::connect(
                ConnectErrorKind::Timeout,
                format!("connect did not finish within {:?}", limit),
            )),
        }
    }

    async fn serve(
        &mut self,
        session: Box<dyn Session>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let session: Arc<dyn Session> = Arc::from(session);
        // Discard a reconnect permit stored before this session existed.
        let _ = self.signals.reconnect.notified().now_or_never();
        let events = match session.take_events() {
            Ok(events) => events,
            Err(e) => {
                let _ = session.close().await;
                return SessionEnd::Lost(e);
            }
        };

        self.set_state(ListenerState::Connected);

        let dispatcher = self.dispatcher.clone();
        let subscriptions = self.subscriptions.clone();
        let health_timeout = self.config.timeouts.health_check();
        let (health_enabled, health_period) = match self.config.timeouts.health_check_interval() {
            Some(period) => (true, period),
            None => (false, Duration::from_secs(3600)),
        };

        let end = {
            let feed = dispatcher.feed(events);
            tokio::pin!(feed);
            let restore = subscriptions.restore_all(session.clone());
            tokio::pin!(restore);
            let stability = sleep(self.config.backoff.stability_window());
            tokio::pin!(stability);
            let mut health = interval_at(Instant::now() + health_period, health_period);
            health.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut restored = false;
            let mut stable = false;
            let mut pending_ping: Option<JoinHandle<Result<()>>> = None;

            let end = loop {
                tokio::select! {
                    biased;
                    _ = shutdown_requested(shutdown) => break SessionEnd::Shutdown,
                    _ = self.signals.reconnect.notified() => break SessionEnd::Reconnect,
                    lost = subscriptions.session_lost() => break SessionEnd::Lost(lost),
                    reason = &mut feed => break SessionEnd::Lost(reason),
                    result = &mut restore, if !restored => {
                        restored = true;
                        match result {
                            Ok(outcome) => {
                                for failure in &outcome.failures {
                                    self.hooks.emit_error(failure);
                                }
                            }
                            Err(e) => break SessionEnd::Lost(e),
                        }
                    }
                    _ = &mut stability, if !stable => {
                        stable = true;
                        if self.backoff.state().consecutive_failures > 0 {
                            debug!("connection stable; resetting backoff");
                        }
                        self.backoff.reset();
                    }
                    _ = health.tick(), if health_enabled && restored && pending_ping.is_none() => {
                        let subscriptions = subscriptions.clone();
                        pending_ping = Some(tokio::spawn(async move {
                            subscriptions.ping(health_timeout).await
                        }));
                    }
                    joined = join_pending(&mut pending_ping), if pending_ping.is_some() => {
                        pending_ping = None;
                        match joined {
                            Ok(Ok(())) => debug!("health check passed"),
                            Ok(Err(e)) => {
                                warn!(error = %e, "health check failed");
                                break SessionEnd::Lost(e);
                            }
                            Err(e) => {
                                break SessionEnd::Lost(Error::stream_terminated(format!(
                                    "health check task failed: {}",
                                    e
                                )));
                            }
                        }
                    }
                }
            };

            if let Some(handle) = pending_ping.take() {
                handle.abort();
            }
            end
        };

        // Feed and restore futures are gone; release the session.
        subscriptions.detach().await;
        if let Err(e) = session.close().await {
            debug!(error = %e, "error while closing session");
        }
        end
    }

    fn set_state(&self, next: ListenerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "listener state changed");
            self.hooks.emit_state(next);
        }
    }
}

/// Resolves once shutdown is requested or the signal owner is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn join_pending<T>(
    handle: &mut Option<JoinHandle<T>>,
) -> std::result::Result<T, tokio::task::JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
