use std::{sync::Arc, time::Duration};

use outpost::inbox::{EventHandler, HandlerRegistry, sqlx::SqlxLedger};
use outpost::outbox::sqlx::SqlxOutbox;
use outpost::transport::{self, RawPayload, layers::JsonLayer};
use outpost::{
    BacklogMonitor, Delivery, EventEnvelope, Inbox, InboxConfig, MonitorConfig, Outbox, Relay,
    RelayConfig, Transport,
};
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use sqlx::{PgPool, Postgres};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Serialize)]
struct UserDeleted {
    user_id: i64,
    reason: &'static str,
}

/// Soft-deletes the posts of a deleted user in the consumer's transaction.
struct SoftDeletePosts;

#[async_trait::async_trait]
impl EventHandler<sqlx::Transaction<'static, Postgres>> for SoftDeletePosts {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        tx: &mut sqlx::Transaction<'static, Postgres>,
    ) -> Result<(), tower::BoxError> {
        let user_id: i64 = envelope.aggregate_id.parse()?;
        sqlx::query(
            "UPDATE posts SET deleted_at = now() WHERE author_id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

async fn create_domain_tables(pool: &PgPool) {
    for statement in [
        "CREATE TABLE IF NOT EXISTS users (id BIGINT PRIMARY KEY, deleted_at TIMESTAMPTZ)",
        "CREATE TABLE IF NOT EXISTS posts \
         (id BIGSERIAL PRIMARY KEY, author_id BIGINT NOT NULL, deleted_at TIMESTAMPTZ)",
    ] {
        sqlx::query(statement).execute(pool).await.unwrap();
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    // Postgres connection, configured through the PG* environment variables
    let pool = PgPool::connect_with(PgConnectOptions::new()).await.unwrap();
    let store = SqlxOutbox::try_new(pool.clone()).await.unwrap();
    create_domain_tables(&pool).await;

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    // Writer: delete a user and record the event in the same transaction
    let pool_clone = pool.clone();
    let outbox = Outbox::new(store.clone());
    let cancel_writer = cancel.clone();
    let writer_handle = tokio::spawn(async move {
        let mut user_id = 0_i64;
        while !cancel_writer.is_cancelled() {
            let mut tx = pool_clone.begin().await.unwrap();
            sqlx::query(
                "INSERT INTO users (id, deleted_at) VALUES ($1, now()) \
                 ON CONFLICT (id) DO UPDATE SET deleted_at = now()",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .unwrap();
            sqlx::query("INSERT INTO posts (author_id) VALUES ($1), ($1)")
                .bind(user_id)
                .execute(&mut *tx)
                .await
                .unwrap();
            let payload = UserDeleted {
                user_id,
                reason: "requested",
            };
            outbox
                .append_event(&mut tx, "User", user_id, "UserDeleted", payload)
                .await
                .expect("Failed to append event");
            tx.commit().await.unwrap();

            user_id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    // Relay: outbox -> in-memory bus, woken by the insert trigger
    let bus: transport::InMemory<RawPayload> = transport::InMemory::default();
    let subscription = bus.subscribe(["user.events"]).await;
    let wake = store.listen(cancel.clone()).await.unwrap();
    let relay = Relay::new(
        store.clone(),
        Transport::new(bus).layer(JsonLayer),
        RelayConfig::from_env().unwrap(),
    )
    .unwrap()
    .wake_on(wake);
    let relay_handle = tokio::spawn(relay.run(cancel.clone()));

    // Consumer: bus -> inbox, one side effect per event
    let registry = HandlerRegistry::builder()
        .register("UserDeleted", SoftDeletePosts)
        .build()
        .unwrap();
    let ledger = SqlxLedger::try_new(pool.clone()).await.unwrap();
    let inbox = Arc::new(Inbox::new(
        ledger,
        registry,
        InboxConfig::from_env().unwrap(),
    ));
    let deliveries = subscription.filter_map(|publication| match Delivery::try_from(publication) {
        Ok(delivery) => Some(delivery),
        Err(error) => {
            tracing::error!(%error, "Dropping undecodable message");
            None
        }
    });
    let inbox_handle = tokio::spawn(inbox.consume(Box::pin(deliveries), cancel.clone()));

    // Monitor: log backlog health
    let monitor = BacklogMonitor::new(store, MonitorConfig::from_env().unwrap());
    let monitor_handle = tokio::spawn(monitor.run(cancel));

    tokio::try_join!(
        cancel_handle,
        writer_handle,
        relay_handle,
        inbox_handle,
        monitor_handle
    )
    .unwrap();
}
