use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgListener, postgres::PgRow};
use std::{sync::Arc, time::Duration};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    event::{DomainEvent, NewEvent},
    outbox::{
        AdministerEvents, AppendEvents, BacklogStats, ClaimEvents, ClaimRequest, InspectBacklog,
        Retry,
    },
};

/// Embedded schema migrations for the outbox and the processed-event ledger.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Channel the insert trigger notifies on.
pub const NOTIFY_CHANNEL: &str = "outbox_events";

/// Name of the transaction-scoped advisory lock held while claiming.
pub const CLAIM_LOCK: &str = "outbox_events.claim";

macro_rules! columns {
    () => {
        "id, event_id, aggregate_type, aggregate_id, event_type, payload, metadata, \
         partition_key, created_at, published_at, retry_count, last_error, \
         next_attempt_at, dead_lettered_at"
    };
}

/// PostgreSQL outbox driver.
#[derive(Clone, Debug)]
pub struct SqlxOutbox {
    pool: PgPool,
}

impl SqlxOutbox {
    /// Creates a new outbox without touching the schema.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates a new outbox and runs the embedded migrations.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        MIGRATOR.run(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Listen for insert notifications and turn them into relay wake-ups.
    ///
    /// The listener runs in a background task until `cancel` fires. Lost
    /// connections are re-established by the listener itself; every
    /// reconnect also wakes the relay since notifications may have been
    /// missed in between.
    #[tracing::instrument(skip_all)]
    pub async fn listen(&self, cancel: CancellationToken) -> Result<Arc<Notify>, Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        let notify = Arc::new(Notify::new());
        let wake = Arc::clone(&notify);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = listener.try_recv() => match received {
                        Ok(Some(_)) => wake.notify_one(),
                        Ok(None) => {
                            tracing::warn!("Outbox listener connection lost, reconnecting");
                            wake.notify_one();
                        }
                        Err(error) => {
                            tracing::error!(?error, "Outbox listener failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                }
            }
        });

        Ok(notify)
    }
}

/// SQLx `AppendEvents` driver implementation.
#[async_trait]
impl AppendEvents for SqlxOutbox {
    type Error = Error;
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(count = events.len()))]
    async fn append(
        &self,
        events: Vec<NewEvent>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<Vec<i64>, Self::Error> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            let partition_key = event.partition_key().to_owned();
            // hashtext() keeps the slot stable across processes and versions.
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO outbox_events \
                 (event_id, aggregate_type, aggregate_id, event_type, payload, metadata, \
                  partition_key, partition) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, hashtext($7) & 2147483647) \
                 RETURNING id",
            )
            .bind(event.event_id)
            .bind(event.aggregate_type)
            .bind(event.aggregate_id)
            .bind(event.event_type)
            .bind(event.payload)
            .bind(event.metadata)
            .bind(partition_key)
            .fetch_one(&mut **tx)
            .await?;
            ids.push(id);
        }
        Ok(ids)
    }
}

#[async_trait]
impl ClaimEvents for SqlxOutbox {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(partition = ?request.partition, limit = request.limit))]
    async fn claim(&self, request: ClaimRequest) -> Result<Vec<DomainEvent>, Self::Error> {
        let mut tx = self.pool.begin().await?;
        // One claim at a time: the next one must see the leases committed by
        // the previous one, not skip past a locked older sibling.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(CLAIM_LOCK)
            .execute(&mut *tx)
            .await?;

        // now() is frozen at transaction start, before the lock wait.
        let rows = sqlx::query(concat!(
            "UPDATE outbox_events \
             SET next_attempt_at = statement_timestamp() + make_interval(secs => $3) \
             WHERE id IN ( \
                 SELECT c.id FROM outbox_events c \
                 WHERE c.published_at IS NULL \
                   AND c.dead_lettered_at IS NULL \
                   AND c.retry_count < $2 \
                   AND c.next_attempt_at <= statement_timestamp() \
                   AND c.partition % $4 = $5 \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM outbox_events s \
                       WHERE s.partition_key = c.partition_key \
                         AND s.published_at IS NULL \
                         AND s.dead_lettered_at IS NULL \
                         AND s.retry_count < $2 \
                         AND s.next_attempt_at > statement_timestamp() \
                         AND (s.created_at, s.id) < (c.created_at, c.id) \
                   ) \
                 ORDER BY c.created_at, c.id \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING ",
            columns!()
        ))
        .bind(request.limit as i64)
        .bind(request.max_retries)
        .bind(request.lease.as_secs_f64())
        .bind(request.partition.total.max(1) as i32)
        .bind(request.partition.id as i32)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(|e| (e.created_at, e.id));
        Ok(events)
    }

    #[tracing::instrument(skip(self))]
    async fn mark_published(&self, id: i64) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "UPDATE outbox_events SET published_at = now() WHERE id = $1 AND published_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, error))]
    async fn mark_failed(&self, id: i64, error: &str, retry: Retry) -> Result<bool, Self::Error> {
        let query = match retry {
            Retry::At(at) => sqlx::query(
                "UPDATE outbox_events \
                 SET retry_count = retry_count + 1, last_error = $2, next_attempt_at = $3 \
                 WHERE id = $1 AND published_at IS NULL",
            )
            .bind(id)
            .bind(error)
            .bind(at),
            Retry::Exhausted => sqlx::query(
                "UPDATE outbox_events \
                 SET retry_count = retry_count + 1, last_error = $2, \
                     next_attempt_at = now(), dead_lettered_at = now() \
                 WHERE id = $1 AND published_at IS NULL",
            )
            .bind(id)
            .bind(error),
        };
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, error))]
    async fn mark_dead_lettered(&self, id: i64, error: &str) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "UPDATE outbox_events \
             SET last_error = $2, next_attempt_at = now(), dead_lettered_at = now() \
             WHERE id = $1 AND published_at IS NULL",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip_all, fields(count = ids.len()))]
    async fn release(&self, ids: &[i64]) -> Result<u64, Self::Error> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE outbox_events SET next_attempt_at = now() \
             WHERE id = ANY($1) AND published_at IS NULL",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl InspectBacklog for SqlxOutbox {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn backlog_stats(&self, max_retries: i32) -> Result<BacklogStats, Self::Error> {
        let row = sqlx::query(
            "SELECT \
                 COUNT(*) FILTER (WHERE dead_lettered_at IS NULL AND retry_count < $1) \
                     AS unpublished_count, \
                 MIN(created_at) FILTER (WHERE dead_lettered_at IS NULL AND retry_count < $1) \
                     AS oldest_unpublished_at, \
                 COUNT(*) FILTER (WHERE dead_lettered_at IS NOT NULL OR retry_count >= $1) \
                     AS dead_lettered_count \
             FROM outbox_events WHERE published_at IS NULL",
        )
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await?;

        let unpublished_count: i64 = row.try_get("unpublished_count")?;
        let dead_lettered_count: i64 = row.try_get("dead_lettered_count")?;
        Ok(BacklogStats {
            unpublished_count: unpublished_count.max(0) as u64,
            oldest_unpublished_at: row.try_get("oldest_unpublished_at")?,
            dead_lettered_count: dead_lettered_count.max(0) as u64,
        })
    }
}

#[async_trait]
impl AdministerEvents for SqlxOutbox {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn list_dead_lettered(
        &self,
        max_retries: i32,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, Self::Error> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            columns!(),
            " FROM outbox_events \
             WHERE published_at IS NULL AND (dead_lettered_at IS NOT NULL OR retry_count >= $1) \
             ORDER BY id LIMIT $2"
        ))
        .bind(max_retries)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(event_from_row).collect::<Result<_, _>>()?)
    }

    #[tracing::instrument(skip(self))]
    async fn requeue(&self, id: i64) -> Result<bool, Self::Error> {
        let result = sqlx::query(
            "UPDATE outbox_events \
             SET retry_count = 0, dead_lettered_at = NULL, next_attempt_at = now() \
             WHERE id = $1 AND published_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self))]
    async fn purge_published_older_than(&self, older_than: Duration) -> Result<u64, Self::Error> {
        let result = sqlx::query(
            "DELETE FROM outbox_events \
             WHERE published_at IS NOT NULL AND published_at < now() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    async fn get(&self, id: i64) -> Result<Option<DomainEvent>, Self::Error> {
        let row = sqlx::query(concat!("SELECT ", columns!(), " FROM outbox_events WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(event_from_row).transpose()?)
    }
}

fn event_from_row(row: &PgRow) -> Result<DomainEvent, sqlx::Error> {
    Ok(DomainEvent {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        metadata: row.try_get("metadata")?,
        partition_key: row.try_get("partition_key")?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        dead_lettered_at: row.try_get("dead_lettered_at")?,
    })
}

/// Sqlx outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxDriverErrorKind,
}

/// Kinds of SQLx outbox errors.
#[derive(Debug)]
pub enum SqlxDriverErrorKind {
    Database(sqlx::Error),
    Migrate(sqlx::migrate::MigrateError),
}

impl Error {
    pub fn kind(&self) -> &SqlxDriverErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            SqlxDriverErrorKind::Migrate(err) => writeln!(f, "Migration error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => Some(err),
            SqlxDriverErrorKind::Migrate(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Database(err),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Migrate(err),
        }
    }
}
