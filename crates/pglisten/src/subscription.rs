//! Subscription manager
//!
//! Tracks the channels the consumer wants and keeps the attached session in
//! line with them. The managed set only changes through [`subscribe`] and
//! [`unsubscribe`]; the network layer never mutates it, so it is the source of
//! truth replayed by [`restore_all`] after every reconnection.
//!
//! Commands are serialized: the attached session sits behind an async mutex,
//! so a new command waits for the previous one to be acknowledged or to time
//! out before it is sent.
//!
//! A live command that finds the connection dead (or is never acknowledged)
//! detaches the session and wakes [`session_lost`], which the controller
//! treats like the end of the event stream.
//!
//! [`subscribe`]: SubscriptionManager::subscribe
//! [`unsubscribe`]: SubscriptionManager::unsubscribe
//! [`restore_all`]: SubscriptionManager::restore_all
//! [`session_lost`]: SubscriptionManager::session_lost

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::notification::validate_channel_name;
use crate::session::{Command, Session};

/// A channel the consumer wants notifications from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    /// Channel name
    pub name: String,
    /// Whether the attached session acknowledged `LISTEN` for it
    pub active: bool,
}

impl ChannelSubscription {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: false,
        }
    }
}

/// Result of replaying the subscription set on a new session
#[derive(Debug, Default)]
pub struct RestoreOutcome {
    /// Channels whose `LISTEN` was acknowledged
    pub restored: usize,
    /// Rejected commands; these channels stay in the set and are retried on
    /// the next reconnection
    pub failures: Vec<Error>,
}

type Gate = Option<Arc<dyn Session>>;

/// Ordered channel set plus the session it is applied to
pub struct SubscriptionManager {
    channels: Mutex<Vec<ChannelSubscription>>,
    session: tokio::sync::Mutex<Gate>,
    command_timeout: Duration,
    lost: Notify,
    lost_reason: Mutex<Option<String>>,
}

impl SubscriptionManager {
    /// Create an empty manager
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
            session: tokio::sync::Mutex::new(None),
            command_timeout,
            lost: Notify::new(),
            lost_reason: Mutex::new(None),
        }
    }

    /// Create a manager pre-populated with `channels` (duplicates ignored)
    pub fn with_channels<I, S>(command_timeout: Duration, channels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let manager = Self::new(command_timeout);
        {
            let mut set = manager.channels.lock();
            for channel in channels {
                let channel = channel.into();
                validate_channel_name(&channel)?;
                if !set.iter().any(|c| c.name == channel) {
                    set.push(ChannelSubscription::new(channel));
                }
            }
        }
        Ok(manager)
    }

    /// Add a channel; issues `LISTEN` right away if a session is attached
    ///
    /// Subscribing to a channel already in the set is a no-op. If the command
    /// is rejected the channel stays in the set and the error is returned; if
    /// it fails because the connection is gone the session is also detached.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        validate_channel_name(channel)?;
        {
            let mut set = self.channels.lock();
            if set.iter().any(|c| c.name == channel) {
                return Ok(());
            }
            set.push(ChannelSubscription::new(channel));
        }
        debug!(channel, "channel added to subscription set");

        let mut gate = self.session.lock().await;
        let Some(session) = gate.clone() else {
            return Ok(());
        };
        // An unsubscribe may have won the race for the gate.
        if !self.is_subscribed(channel) {
            return Ok(());
        }
        let result = self
            .issue(session.as_ref(), Command::Listen(channel.to_string()))
            .await;
        match result {
            Ok(()) => {
                self.set_active(channel, true);
                Ok(())
            }
            Err(e) => Err(self.command_failed(&mut gate, e)),
        }
    }

    /// Remove a channel; issues `UNLISTEN` if a session is attached
    ///
    /// Unsubscribing an unknown channel is a no-op.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let removed = {
            let mut set = self.channels.lock();
            let before = set.len();
            set.retain(|c| c.name != channel);
            set.len() != before
        };
        if !removed {
            return Ok(());
        }
        debug!(channel, "channel removed from subscription set");

        let mut gate = self.session.lock().await;
        let Some(session) = gate.clone() else {
            return Ok(());
        };
        if self.is_subscribed(channel) {
            return Ok(());
        }
        self.issue(session.as_ref(), Command::Unlisten(channel.to_string()))
            .await
            .map_err(|e| self.command_failed(&mut gate, e))
    }

    /// Attach `session` and re-issue `LISTEN` for every channel, in insertion order
    ///
    /// Holds the command gate for the whole replay, so concurrent subscribe
    /// calls are applied after it. Returns an error only when the session
    /// itself is lost; rejected commands are collected in the outcome.
    pub async fn restore_all(&self, session: Arc<dyn Session>) -> Result<RestoreOutcome> {
        let mut gate = self.session.lock().await;
        *gate = Some(session.clone());
        self.mark_all_inactive();

        let names = self.channels();
        let mut outcome = RestoreOutcome::default();
        for name in names {
            match self
                .issue(session.as_ref(), Command::Listen(name.clone()))
                .await
            {
                Ok(()) => {
                    self.set_active(&name, true);
                    outcome.restored += 1;
                }
                Err(e) if e.is_connection_lost() => {
                    *gate = None;
                    return Err(e);
                }
                Err(e) => {
                    warn!(channel = %name, error = %e, "failed to restore subscription");
                    outcome.failures.push(e);
                }
            }
        }

        info!(
            restored = outcome.restored,
            failed = outcome.failures.len(),
            "subscriptions restored"
        );
        Ok(outcome)
    }

    /// Detach the current session, returning it
    ///
    /// Waits for an in-flight command to finish first. A pending
    /// [`session_lost`](Self::session_lost) signal about the detached session
    /// is discarded.
    pub async fn detach(&self) -> Option<Arc<dyn Session>> {
        let session = self.session.lock().await.take();
        self.mark_all_inactive();
        // A stale permit without a reason is ignored by `session_lost`.
        self.lost_reason.lock().take();
        session
    }

    /// Resolves once a live `subscribe`/`unsubscribe` found the attached
    /// session unusable; returns why
    pub async fn session_lost(&self) -> Error {
        loop {
            self.lost.notified().await;
            if let Some(reason) = self.lost_reason.lock().take() {
                return Error::stream_terminated(reason);
            }
        }
    }

    /// Whether a session is attached
    pub async fn is_attached(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Health-check round trip, serialized with subscription commands
    pub async fn ping(&self, limit: Duration) -> Result<()> {
        let gate = self.session.lock().await;
        let session = gate
            .as_ref()
            .ok_or_else(|| Error::not_running("no session attached"))?;
        match timeout(limit, session.execute(&Command::Ping)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "health check not answered within {:?}",
                limit
            ))),
        }
    }

    /// Channel names in insertion order
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().iter().map(|c| c.name.clone()).collect()
    }

    /// Snapshot of the managed set
    pub fn subscriptions(&self) -> Vec<ChannelSubscription> {
        self.channels.lock().clone()
    }

    /// Whether `channel` is in the managed set
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.lock().iter().any(|c| c.name == channel)
    }

    /// Number of managed channels
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// Whether the managed set is empty
    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    async fn issue(&self, session: &dyn Session, command: Command) -> Result<()> {
        match timeout(self.command_timeout, session.execute(&command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "`{}` not acknowledged within {:?}",
                command, self.command_timeout
            ))),
        }
    }

    fn command_failed(&self, gate: &mut Gate, err: Error) -> Error {
        if err.is_connection_lost() && gate.take().is_some() {
            warn!(error = %err, "subscription command lost the session");
            self.mark_all_inactive();
            *self.lost_reason.lock() = Some(format!("subscription command failed: {}", err));
            self.lost.notify_one();
        }
        err
    }

    fn set_active(&self, channel: &str, active: bool) {
        if let Some(sub) = self.channels.lock().iter_mut().find(|c| c.name == channel) {
            sub.active = active;
        }
    }

    fn mark_all_inactive(&self) {
        for sub in self.channels.lock().iter_mut() {
            sub.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_without_session_is_recorded() {
        let manager = SubscriptionManager::new(Duration::from_secs(1));
        manager.subscribe("observations").await.unwrap();
        manager.subscribe("alerts").await.unwrap();
        manager.subscribe("observations").await.unwrap();

        assert_eq!(manager.channels(), vec!["observations", "alerts"]);
        assert!(manager.subscriptions().iter().all(|s| !s.active));
        assert!(!manager.is_attached().await);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let manager = SubscriptionManager::new(Duration::from_secs(1));
        manager.unsubscribe("never").await.unwrap();
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_invalid_name() {
        let manager = SubscriptionManager::new(Duration::from_secs(1));
        assert!(manager.subscribe("").await.is_err());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_with_channels_dedupes() {
        let manager =
            SubscriptionManager::with_channels(Duration::from_secs(1), ["a", "b", "a"]).unwrap();
        assert_eq!(manager.channels(), vec!["a", "b"]);
        assert_eq!(manager.len(), 2);

        assert!(SubscriptionManager::with_channels(Duration::from_secs(1), [""]).is_err());
    }

    #[tokio::test]
    async fn test_ping_without_session() {
        let manager = SubscriptionManager::new(Duration::from_secs(1));
        let err = manager.ping(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning { .. }));
    }
}
