//! In-memory database used by the integration tests
//!
//! `MockServer` plays the database side: it hands out sessions through
//! [`MockConnector`], records every command they execute, routes `NOTIFY`s to
//! the current session when it listens on the channel, and can drop the
//! connection or refuse handshakes on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use pglisten::config::ListenerConfig;
use pglisten::error::{ConnectErrorKind, Error, Result};
use pglisten::notification::RawEvent;
use pglisten::session::{
    Command, Connector, EventStream, Session, SessionState, SessionStatus,
};

/// Handshake failure to inject
#[derive(Debug, Clone, Copy)]
pub enum ConnectFailure {
    Unreachable,
    Authentication,
}

struct Live {
    pid: i32,
    events: mpsc::UnboundedSender<Result<RawEvent>>,
    listening: Arc<Mutex<HashSet<String>>>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct ServerState {
    connects: usize,
    connect_times: Vec<Instant>,
    connect_delay: Duration,
    commands: Vec<Command>,
    pending_failures: VecDeque<ConnectFailure>,
    rejected: HashSet<String>,
    stalled: HashSet<String>,
    failing_pings: bool,
    current: Option<Live>,
    next_pid: i32,
}

/// Fake database shared by all sessions of a test
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            server: self.clone(),
        })
    }

    /// Refuse the next handshake(s)
    pub fn fail_next_connects(&self, count: usize, failure: ConnectFailure) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.pending_failures.push_back(failure);
        }
    }

    /// Reject `LISTEN` for `channel`
    pub fn reject_channel(&self, channel: &str) {
        self.state.lock().rejected.insert(channel.to_string());
    }

    /// Never acknowledge `LISTEN` for `channel` while `stalled` is set
    pub fn stall_listen(&self, channel: &str, stalled: bool) {
        let mut state = self.state.lock();
        if stalled {
            state.stalled.insert(channel.to_string());
        } else {
            state.stalled.remove(channel);
        }
    }

    /// Make every handshake take `delay`
    pub fn slow_connects(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Make health-check round trips report a dead connection
    pub fn fail_pings(&self, failing: bool) {
        self.state.lock().failing_pings = failing;
    }

    /// Deliver a notification if the current session listens on `channel`
    pub fn notify(&self, channel: &str, payload: &str) -> bool {
        let state = self.state.lock();
        let Some(live) = state.current.as_ref() else {
            return false;
        };
        if !live.listening.lock().contains(channel) {
            return false;
        }
        let event = RawEvent::new(channel, payload.to_string()).with_origin(live.pid);
        live.events.send(Ok(event)).is_ok()
    }

    /// Push a raw event to the current session regardless of subscriptions
    pub fn inject(&self, event: RawEvent) -> bool {
        let state = self.state.lock();
        match state.current.as_ref() {
            Some(live) => live.events.send(Ok(event)).is_ok(),
            None => false,
        }
    }

    /// Kill the current connection
    pub fn drop_connection(&self) -> bool {
        let live = self.state.lock().current.take();
        match live {
            Some(live) => {
                live.alive.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// When each handshake completed
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connect_times.clone()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Commands other than health checks
    pub fn subscription_commands(&self) -> Vec<Command> {
        self.commands()
            .into_iter()
            .filter(|c| *c != Command::Ping)
            .collect()
    }

    pub fn count(&self, command: &Command) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| *c == command)
            .count()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().current.is_some()
    }

    pub fn is_listening(&self, channel: &str) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .map(|live| live.listening.lock().contains(channel))
            .unwrap_or(false)
    }

    pub fn current_pid(&self) -> Option<i32> {
        self.state.lock().current.as_ref().map(|live| live.pid)
    }
}

/// Connector backed by a [`MockServer`]
pub struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _config: &ListenerConfig) -> Result<Box<dyn Session>> {
        let delay = self.server.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.server.state.lock();
        state.connects += 1;
        state.connect_times.push(Instant::now());

        if let Some(failure) = state.pending_failures.pop_front() {
            return Err(match failure {
                ConnectFailure::Unreachable => {
                    Error::connect(ConnectErrorKind::Unreachable, "connection refused")
                }
                ConnectFailure::Authentication => Error::connect(
                    ConnectErrorKind::Authentication,
                    "password authentication failed for user \"postgres\"",
                ),
            });
        }

        // The previous connection, if any, is superseded.
        if let Some(old) = state.current.take() {
            old.alive.store(false, Ordering::SeqCst);
        }

        state.next_pid += 1;
        let pid = 4000 + state.next_pid;
        let (tx, rx) = mpsc::unbounded_channel();
        let listening = Arc::new(Mutex::new(HashSet::new()));
        let alive = Arc::new(AtomicBool::new(true));
        state.current = Some(Live {
            pid,
            events: tx,
            listening: listening.clone(),
            alive: alive.clone(),
        });

        Ok(Box::new(MockSession {
            server: self.server.clone(),
            pid,
            events: Mutex::new(Some(rx)),
            listening,
            alive,
            closed: AtomicBool::new(false),
            status: SessionStatus::new(SessionState::Connected),
        }))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Session handed out by [`MockConnector`]
pub struct MockSession {
    server: MockServer,
    pid: i32,
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<RawEvent>>>>,
    listening: Arc<Mutex<HashSet<String>>>,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    status: SessionStatus,
}

#[async_trait]
impl Session for MockSession {
    fn state(&self) -> SessionState {
        self.status.state()
    }

    fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    async fn execute(&self, command: &Command) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            self.status.fail("connection closed");
            return Err(Error::command_connection_lost(
                command.to_string(),
                "connection closed",
            ));
        }

        let stalled = {
            let mut state = self.server.state.lock();
            state.commands.push(command.clone());
            matches!(command, Command::Listen(channel) if state.stalled.contains(channel))
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let state = self.server.state.lock();
        match command {
            Command::Listen(channel) => {
                if state.rejected.contains(channel) {
                    return Err(Error::command(
                        command.to_string(),
                        format!("permission denied for channel {}", channel),
                    ));
                }
                self.listening.lock().insert(channel.clone());
            }
            Command::Unlisten(channel) => {
                self.listening.lock().remove(channel);
            }
            Command::UnlistenAll => self.listening.lock().clear(),
            Command::Ping => {
                if state.failing_pings {
                    return Err(Error::command_connection_lost(
                        command.to_string(),
                        "server closed the connection unexpectedly",
                    ));
                }
            }
        }
        Ok(())
    }

    fn take_events(&self) -> Result<EventStream> {
        let mut rx = self
            .events
            .lock()
            .take()
            .ok_or_else(|| Error::not_running("event stream already taken"))?;
        let alive = self.alive.clone();
        let pid = self.pid;
        let events = stream::poll_fn(move |cx| rx.poll_recv(cx));
        let terminal = stream::once(async move {
            alive.store(false, Ordering::SeqCst);
            Err(Error::stream_terminated(format!(
                "connection to backend {} closed",
                pid
            )))
        });
        Ok(events.chain(terminal).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        self.status.transition(SessionState::Disconnected);
        let mut state = self.server.state.lock();
        if state.current.as_ref().map(|live| live.pid) == Some(self.pid) {
            state.current = None;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Listener configuration tuned for fast, deterministic tests
pub fn test_config() -> ListenerConfig {
    let mut config = ListenerConfig::new("mock", "weather");
    config.backoff.base_delay_ms = 100;
    config.backoff.max_delay_ms = 1_000;
    config.backoff.jitter = 0.0;
    config.backoff.stability_window_ms = 500;
    config.timeouts.health_check_interval_ms = 0;
    config
}

/// Poll `condition` until it holds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}
