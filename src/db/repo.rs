use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{check_transition, ClaimFilter, ItemUpdate, OrderKey, QueueStore, QueueTx, StoreError};
use crate::config::Database;
use crate::model::{ItemId, NewOutreachItem, OutreachItem, OutreachStatus};

pub type Pool = PgPool;

const ITEM_COLUMNS: &str = "outreach_id, company_name, contact_email, status, email_subject, \
     email_body, notes, created_at, updated_at, sent_at";

pub async fn init_pool(db: &Database) -> Result<Pool, StoreError> {
    let mut opts = PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .database(&db.name)
        .username(&db.user);
    if let Some(password) = db.password.as_deref() {
        opts = opts.password(password);
    }
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(opts)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct OutreachRow {
    outreach_id: Uuid,
    company_name: Option<String>,
    contact_email: Option<String>,
    status: String,
    email_subject: Option<String>,
    email_body: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutreachRow> for OutreachItem {
    type Error = StoreError;

    fn try_from(row: OutreachRow) -> Result<Self, Self::Error> {
        let status = OutreachStatus::parse_status(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "outreach {} has unknown status {:?}",
                row.outreach_id, row.status
            ))
        })?;
        Ok(OutreachItem {
            id: ItemId(row.outreach_id),
            company_name: row.company_name.unwrap_or_default(),
            contact_email: row.contact_email,
            status,
            email_subject: row.email_subject,
            email_body: row.email_body,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
        })
    }
}

fn claim_sql(order: OrderKey) -> String {
    format!(
        "SELECT {ITEM_COLUMNS}
FROM outreach_queue
WHERE status = $1
  AND ($2::text IS NULL OR strpos(lower(COALESCE(notes, '')), lower($2::text)) > 0)
  AND (NOT $3 OR (COALESCE(email_subject, '') <> '' AND COALESCE(email_body, '') <> ''))
  AND NOT (outreach_id = ANY($4))
ORDER BY {} ASC, outreach_id ASC
LIMIT $5
FOR UPDATE SKIP LOCKED",
        order.column()
    )
}

const UPDATE_SQL: &str = "UPDATE outreach_queue
SET status = $1,
    email_subject = COALESCE($2, email_subject),
    email_body = COALESCE($3, email_body),
    sent_at = COALESCE($4, sent_at),
    updated_at = $5,
    notes = COALESCE(notes, '') || COALESCE($6, '')
WHERE outreach_id = $7 AND status = $8";

/// PostgreSQL-backed queue. Row locks are taken with `FOR UPDATE SKIP LOCKED`
/// so concurrent workers never wait on each other.
#[derive(Debug, Clone)]
pub struct PgQueueStore {
    pool: Pool,
}

impl PgQueueStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[instrument(skip_all)]
    pub async fn insert(&self, item: NewOutreachItem) -> Result<ItemId, StoreError> {
        let id = ItemId::new();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO outreach_queue (outreach_id, company_name, contact_email, status, email_subject, email_body, notes, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)",
        )
        .bind(id.0)
        .bind(&item.company_name)
        .bind(&item.contact_email)
        .bind(item.status.unwrap_or(OutreachStatus::Qualified).as_str())
        .bind(&item.email_subject)
        .bind(&item.email_body)
        .bind(&item.notes)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    #[instrument(skip_all)]
    pub async fn get(&self, id: &ItemId) -> Result<Option<OutreachItem>, StoreError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM outreach_queue WHERE outreach_id = $1");
        let row: Option<OutreachRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutreachItem::try_from).transpose()
    }

    /// Row counts per status, in lifecycle order. Unknown statuses are skipped.
    #[instrument(skip_all)]
    pub async fn count_by_status(&self) -> Result<Vec<(OutreachStatus, i64)>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outreach_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts: Vec<(OutreachStatus, i64)> = rows
            .into_iter()
            .filter_map(|(s, n)| OutreachStatus::parse_status(&s).map(|st| (st, n)))
            .collect();
        counts.sort_by_key(|(s, _)| *s);
        Ok(counts)
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn begin(&self) -> Result<Box<dyn QueueTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgQueueTx { tx }))
    }
}

pub struct PgQueueTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl QueueTx for PgQueueTx {
    #[instrument(skip_all, fields(status = %filter.status, limit = filter.limit))]
    async fn claim(&mut self, filter: &ClaimFilter) -> Result<Vec<OutreachItem>, StoreError> {
        let sql = claim_sql(filter.order);
        let exclude: Vec<Uuid> = filter.exclude.iter().map(|id| id.0).collect();
        let rows: Vec<OutreachRow> = sqlx::query_as(&sql)
            .bind(filter.status.as_str())
            .bind(filter.note_filter.as_ref().map(|f| f.as_str().to_string()))
            .bind(filter.require_draft)
            .bind(exclude)
            .bind(filter.limit as i64)
            .fetch_all(&mut *self.tx)
            .await?;
        debug!(claimed = rows.len(), "claimed rows");
        rows.into_iter().map(OutreachItem::try_from).collect()
    }

    #[instrument(skip_all, fields(item_id = %id))]
    async fn update(&mut self, id: &ItemId, change: ItemUpdate) -> Result<(), StoreError> {
        check_transition(id, &change)?;
        let res = sqlx::query(UPDATE_SQL)
            .bind(change.status.as_str())
            .bind(change.email_subject)
            .bind(change.email_body)
            .bind(change.sent_at)
            .bind(change.updated_at)
            .bind(change.append_note)
            .bind(id.0)
            .bind(change.expected.as_str())
            .execute(&mut *self.tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                id: *id,
                expected: change.expected,
            });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_sql_orders_and_skips_locked() {
        let sql = claim_sql(OrderKey::UpdatedAt);
        assert!(sql.contains("ORDER BY updated_at ASC, outreach_id ASC"));
        assert!(sql.trim_end().ends_with("FOR UPDATE SKIP LOCKED"));
        assert!(claim_sql(OrderKey::CreatedAt).contains("ORDER BY created_at ASC"));
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let now = Utc::now();
        let row = OutreachRow {
            outreach_id: Uuid::new_v4(),
            company_name: None,
            contact_email: None,
            status: "new".into(),
            email_subject: None,
            email_body: None,
            notes: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
        };
        assert!(matches!(
            OutreachItem::try_from(row),
            Err(StoreError::Corrupt(_))
        ));
    }
}
