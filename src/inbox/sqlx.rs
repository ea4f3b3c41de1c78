use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use std::time::Duration;
use uuid::Uuid;

use crate::{
    event::EventEnvelope,
    inbox::Ledger,
    outbox::sqlx::{Error, MIGRATOR},
};

/// PostgreSQL processed-event ledger.
///
/// Handlers receive the `sqlx` transaction the ledger row is inserted in,
/// so their writes and the record commit atomically.
#[derive(Clone, Debug)]
pub struct SqlxLedger {
    pool: PgPool,
}

impl SqlxLedger {
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a new ledger and runs the embedded migrations.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        MIGRATOR.run(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Ledger for SqlxLedger {
    type Error = Error;
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(self.pool.begin().await?)
    }

    async fn try_record(
        &self,
        tx: &mut Self::Transaction,
        processor: &str,
        envelope: &EventEnvelope,
    ) -> Result<bool, Self::Error> {
        let inserted = sqlx::query(
            "INSERT INTO processed_events (processor_name, event_id, event_type) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (processor_name, event_id) DO NOTHING",
        )
        .bind(processor)
        .bind(envelope.event_id)
        .bind(&envelope.event_type)
        .execute(&mut **tx)
        .await?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.rollback().await?)
    }

    async fn is_processed(&self, processor: &str, event_id: Uuid) -> Result<bool, Self::Error> {
        let exists = sqlx::query_scalar(
            "SELECT EXISTS ( \
                 SELECT 1 FROM processed_events WHERE processor_name = $1 AND event_id = $2 \
             )",
        )
        .bind(processor)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn purge_older_than(
        &self,
        processor: &str,
        older_than: Duration,
    ) -> Result<u64, Self::Error> {
        let purged = sqlx::query(
            "DELETE FROM processed_events \
             WHERE processor_name = $1 AND processed_at < now() - make_interval(secs => $2)",
        )
        .bind(processor)
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(purged.rows_affected())
    }
}
