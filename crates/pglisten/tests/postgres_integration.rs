//! PostgreSQL end-to-end tests
//!
//! Require Docker. Run with:
//!
//! ```bash
//! cargo test -p pglisten --test postgres_integration -- --ignored
//! ```

mod common;

use anyhow::{Context, Result};
use common::eventually;
use parking_lot::Mutex;
use pglisten::config::ListenerConfig;
use pglisten::{Listener, ListenerState, Notification};
use std::sync::Arc;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls};
use tracing::info;

struct PostgresContainer {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    host: String,
    port: u16,
}

impl PostgresContainer {
    async fn start() -> Result<Self> {
        let container = Postgres::default()
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;
        info!("PostgreSQL container started on {}:{}", host, port);
        Ok(Self {
            container,
            host,
            port,
        })
    }

    fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.host.clone(), "postgres")
            .with_port(self.port)
            .with_credentials("postgres", "postgres")
            .with_application_name("pglisten-it")
            .with_channel("observations");
        config.backoff.base_delay_ms = 100;
        config.backoff.max_delay_ms = 1_000;
        config
    }

    async fn admin(&self) -> Result<Client> {
        let conn = format!(
            "host={} port={} user=postgres password=postgres dbname=postgres",
            self.host, self.port
        );
        let (client, connection) = tokio_postgres::connect(&conn, NoTls).await?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        Ok(client)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pglisten=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_notify_reaches_callback() -> Result<()> {
    init_tracing();
    let pg = PostgresContainer::start().await?;
    let listener = Listener::new(pg.listener_config())?;
    let seen: Arc<Mutex<Vec<Notification>>> = Arc::default();
    let sink = seen.clone();
    listener.on_notification(move |n| sink.lock().push(n.clone()));

    listener.start()?;
    eventually("listening", || {
        listener.subscriptions().iter().all(|s| s.active)
            && listener.state() == ListenerState::Connected
    })
    .await;

    let admin = pg.admin().await?;
    admin
        .execute("SELECT pg_notify('observations', 'temp=21.5')", &[])
        .await?;
    eventually("notification", || seen.lock().len() == 1).await;

    let n = seen.lock()[0].clone();
    assert_eq!(n.channel, "observations");
    assert_eq!(n.payload_str(), Some("temp=21.5"));
    assert_eq!(n.sequence, 1);
    assert!(n.origin.is_some());

    listener.stop().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_survives_backend_termination() -> Result<()> {
    init_tracing();
    let pg = PostgresContainer::start().await?;
    let listener = Listener::new(pg.listener_config())?;
    let states: Arc<Mutex<Vec<ListenerState>>> = Arc::default();
    let state_sink = states.clone();
    listener.on_state_change(move |s| state_sink.lock().push(s));
    let seen: Arc<Mutex<Vec<Notification>>> = Arc::default();
    let sink = seen.clone();
    listener.on_notification(move |n| sink.lock().push(n.clone()));

    listener.start()?;
    eventually("listening", || {
        listener.subscriptions().iter().all(|s| s.active)
    })
    .await;

    let admin = pg.admin().await?;
    let terminated = admin
        .query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE application_name = 'pglisten-it'",
            &[],
        )
        .await?;
    assert_eq!(terminated.len(), 1);

    eventually("backoff", || states.lock().contains(&ListenerState::Backoff)).await;
    eventually("resubscribed", || {
        listener.state() == ListenerState::Connected
            && listener.subscriptions().iter().all(|s| s.active)
    })
    .await;

    admin
        .execute("SELECT pg_notify('observations', 'temp=19.0')", &[])
        .await?;
    eventually("notification after reconnect", || seen.lock().len() == 1).await;
    assert_eq!(listener.stats().reconnects, 1);

    listener.stop().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_unknown_role_is_fatal_when_configured() -> Result<()> {
    init_tracing();
    let pg = PostgresContainer::start().await?;
    // The container trusts every connection, so reject by role instead of password.
    let config = pg
        .listener_config()
        .with_credentials("nobody", "irrelevant")
        .with_auth_failure_policy(pglisten::config::AuthFailurePolicy::Fatal);
    let listener = Listener::new(config)?;

    listener.start()?;
    assert_eq!(listener.wait().await, ListenerState::Failed);
    listener.stop().await?;
    Ok(())
}
