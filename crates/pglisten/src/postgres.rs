//! PostgreSQL backend
//!
//! Sessions are built on tokio-postgres. The driver splits a connection into a
//! `Client` (used to send commands) and a `Connection` (the socket reader that
//! must be polled for anything to happen). The connection half moves into the
//! session's [`EventStream`], so the read loop task that consumes the stream is
//! the only one touching the socket. Commands issued through the client are
//! completed by that same read loop, which is why the listener always takes the
//! stream before sending `LISTEN`.

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::timeout;
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, NoTls, Socket};
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::error::{ConnectErrorKind, Error, Result};
use crate::notification::RawEvent;
use crate::session::{Command, Connector, EventStream, Session, SessionState, SessionStatus};

type PgConnection = tokio_postgres::Connection<Socket, NoTlsStream>;

/// PostgreSQL session factory
#[derive(Debug, Clone, Default)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, config: &ListenerConfig) -> Result<Box<dyn Session>> {
        let endpoint = config.endpoint();
        let status = Arc::new(SessionStatus::new(SessionState::Connecting));

        debug!(endpoint = %endpoint, "connecting to PostgreSQL");
        let pg_config = config.to_pg_config();
        let connect = pg_config.connect(NoTls);
        let result = match timeout(config.timeouts.connect(), connect).await {
            Ok(Ok(pair)) => Ok(pair),
            Ok(Err(e)) => Err(Error::from_pg_connect(e)),
            Err(_) => Err(Error::connect(
                ConnectErrorKind::Timeout,
                format!(
                    "handshake with {} did not finish within {:?}",
                    endpoint,
                    config.timeouts.connect()
                ),
            )),
        };

        let (client, connection) = match result {
            Ok(pair) => pair,
            Err(e) => {
                status.fail(e.to_string());
                return Err(e);
            }
        };

        status.transition(SessionState::Connected);
        info!(endpoint = %endpoint, "PostgreSQL session established");

        Ok(Box::new(PgSession {
            client: Mutex::new(Some(Arc::new(client))),
            connection: Mutex::new(Some(Box::new(connection))),
            status,
            command_timeout: config.timeouts.command(),
            closed: AtomicBool::new(false),
            endpoint,
        }))
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// One PostgreSQL connection
pub struct PgSession {
    client: Mutex<Option<Arc<tokio_postgres::Client>>>,
    connection: Mutex<Option<Box<PgConnection>>>,
    status: Arc<SessionStatus>,
    command_timeout: Duration,
    closed: AtomicBool,
    endpoint: String,
}

impl PgSession {
    /// `host:port/database` of this session
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Session for PgSession {
    fn state(&self) -> SessionState {
        self.status.state()
    }

    fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    async fn execute(&self, command: &Command) -> Result<()> {
        let sql = command.to_sql();
        let client = self
            .client
            .lock()
            .clone()
            .ok_or_else(|| Error::command_connection_lost(&sql, "session is closed"))?;

        match timeout(self.command_timeout, client.batch_execute(&sql)).await {
            Ok(Ok(())) => {
                debug!(endpoint = %self.endpoint, command = %sql, "command acknowledged");
                Ok(())
            }
            Ok(Err(e)) => {
                let err = Error::from_pg_command(&sql, e);
                if err.is_connection_lost() {
                    self.status.fail(err.to_string());
                }
                Err(err)
            }
            Err(_) => Err(Error::timeout(format!(
                "`{}` not acknowledged within {:?}",
                sql, self.command_timeout
            ))),
        }
    }

    fn take_events(&self) -> Result<EventStream> {
        let connection = self
            .connection
            .lock()
            .take()
            .ok_or_else(|| Error::not_running("event stream already taken"))?;

        Ok(Box::pin(NotificationStream {
            connection: Some(connection),
            status: self.status.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the last client ends the connection future, which in turn
        // terminates the event stream.
        self.client.lock().take();
        self.connection.lock().take();
        self.status.transition(SessionState::Disconnected);
        debug!(endpoint = %self.endpoint, "PostgreSQL session closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Drives the connection half and yields notifications
struct NotificationStream {
    connection: Option<Box<PgConnection>>,
    status: Arc<SessionStatus>,
}

impl Stream for NotificationStream {
    type Item = Result<RawEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(connection) = this.connection.as_mut() else {
                return Poll::Ready(None);
            };

            match connection.poll_message(cx) {
                Poll::Ready(Some(Ok(AsyncMessage::Notification(n)))) => {
                    return Poll::Ready(Some(Ok(RawEvent {
                        channel: n.channel().to_string(),
                        payload: bytes::Bytes::copy_from_slice(n.payload().as_bytes()),
                        origin: Some(n.process_id()),
                    })));
                }
                Poll::Ready(Some(Ok(AsyncMessage::Notice(notice)))) => {
                    debug!(
                        severity = %notice.severity(),
                        message = %notice.message(),
                        "server notice"
                    );
                }
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(e))) => {
                    this.connection = None;
                    warn!(error = %e, "PostgreSQL connection failed");
                    this.status.fail(e.to_string());
                    return Poll::Ready(Some(Err(Error::stream_terminated(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.connection = None;
                    this.status.fail("connection closed");
                    return Poll::Ready(Some(Err(Error::stream_terminated("connection closed"))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
