use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{AgreementId, ConversationId, LegacyRecordId, TaskId, UserId, Version};
use domain::{
    Agreement, Conversation, LedgerEntry, LedgerReason, LegacyRecord, Money, OrderSnapshot,
    RetryTask, Wallet,
};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{CollectionCounts, Result, Store, StoreError};

/// PostgreSQL-backed store implementation.
///
/// Each record is kept as a JSONB document next to the columns its queries
/// filter on. Agreement versions live in their own column and are authoritative.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    fn row_to_agreement(row: PgRow) -> Result<Agreement> {
        let mut agreement: Agreement = document(&row)?;
        agreement.set_version(Version::new(row.try_get("version")?));
        Ok(agreement)
    }
}

fn to_document<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn document<T: DeserializeOwned>(row: &PgRow) -> Result<T> {
    let value: serde_json::Value = row.try_get("document")?;
    Ok(serde_json::from_value(value)?)
}

fn documents<T: DeserializeOwned>(rows: Vec<PgRow>) -> Result<Vec<T>> {
    rows.iter().map(document).collect()
}

/// Maps unique-constraint violations onto `DuplicateKey`.
fn unique_violation(
    entity: &'static str,
    key: impl Into<String>,
) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.is_unique_violation()
        {
            return StoreError::DuplicateKey {
                entity,
                key: key.into(),
            };
        }
        StoreError::Database(e)
    }
}

/// Partial unique index allowing one open agreement per conversation.
const OPEN_AGREEMENT_INDEX: &str = "unique_open_agreement_per_conversation";

/// Like `unique_violation`, but reports the open-agreement guard on its own.
fn agreement_violation(agreement: &Agreement) -> impl FnOnce(sqlx::Error) -> StoreError {
    let conversation_id = agreement.conversation_id();
    let id = agreement.id().to_string();
    move |e| {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.constraint() == Some(OPEN_AGREEMENT_INDEX)
        {
            return StoreError::OpenAgreementExists(conversation_id);
        }
        unique_violation("agreement", id)(e)
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await?;
        Ok(())
    }

    async fn abort(&self, tx: Self::Tx) -> Result<()> {
        tx.rollback().await?;
        Ok(())
    }

    async fn insert_agreement(&self, tx: &mut Self::Tx, agreement: &Agreement) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agreements
                (id, conversation_id, legacy_record_id, creation_key, status, version, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(agreement.id().as_uuid())
        .bind(agreement.conversation_id().as_uuid())
        .bind(agreement.legacy_record_id().map(|id| id.as_uuid()))
        .bind(agreement.creation_key())
        .bind(agreement.status().as_str())
        .bind(agreement.version().as_i64())
        .bind(to_document(agreement)?)
        .bind(agreement.created_at())
        .bind(agreement.updated_at())
        .execute(&mut **tx)
        .await
        .map_err(agreement_violation(agreement))?;
        Ok(())
    }

    async fn update_agreement(
        &self,
        tx: &mut Self::Tx,
        agreement: &Agreement,
        expected: Version,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE agreements
            SET legacy_record_id = $2, status = $3, version = $4, document = $5, updated_at = $6
            WHERE id = $1 AND version = $7
            "#,
        )
        .bind(agreement.id().as_uuid())
        .bind(agreement.legacy_record_id().map(|id| id.as_uuid()))
        .bind(agreement.status().as_str())
        .bind(agreement.version().as_i64())
        .bind(to_document(agreement)?)
        .bind(agreement.updated_at())
        .bind(expected.as_i64())
        .execute(&mut **tx)
        .await
        .map_err(agreement_violation(agreement))?;

        if result.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM agreements WHERE id = $1")
                    .bind(agreement.id().as_uuid())
                    .fetch_optional(&mut **tx)
                    .await?;
            return match actual {
                Some(actual) => {
                    metrics::counter!("store_version_conflicts_total").increment(1);
                    Err(StoreError::VersionConflict {
                        entity: "agreement",
                        id: agreement.id().to_string(),
                        expected,
                        actual: Version::new(actual),
                    })
                }
                None => Err(StoreError::NotFound {
                    entity: "agreement",
                    id: agreement.id().to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn get_agreement(&self, tx: &mut Self::Tx, id: AgreementId) -> Result<Option<Agreement>> {
        let row = sqlx::query("SELECT version, document FROM agreements WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Self::row_to_agreement).transpose()
    }

    async fn find_agreement_by_creation_key(
        &self,
        tx: &mut Self::Tx,
        key: &str,
    ) -> Result<Option<Agreement>> {
        let row = sqlx::query("SELECT version, document FROM agreements WHERE creation_key = $1")
            .bind(key)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Self::row_to_agreement).transpose()
    }

    async fn find_agreement_by_legacy_record(
        &self,
        tx: &mut Self::Tx,
        legacy_record_id: LegacyRecordId,
    ) -> Result<Option<Agreement>> {
        let row =
            sqlx::query("SELECT version, document FROM agreements WHERE legacy_record_id = $1")
                .bind(legacy_record_id.as_uuid())
                .fetch_optional(&mut **tx)
                .await?;
        row.map(Self::row_to_agreement).transpose()
    }

    async fn list_agreements_for_conversation(
        &self,
        tx: &mut Self::Tx,
        conversation_id: ConversationId,
    ) -> Result<Vec<Agreement>> {
        let rows = sqlx::query(
            r#"
            SELECT version, document FROM agreements
            WHERE conversation_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(conversation_id.as_uuid())
        .fetch_all(&mut **tx)
        .await?;
        rows.into_iter().map(Self::row_to_agreement).collect()
    }

    async fn list_agreements_without_snapshot(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> Result<Vec<Agreement>> {
        let rows = sqlx::query(
            r#"
            SELECT a.version, a.document FROM agreements a
            LEFT JOIN order_snapshots s ON s.agreement_id = a.id
            WHERE s.agreement_id IS NULL
            ORDER BY a.created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut **tx)
        .await?;
        rows.into_iter().map(Self::row_to_agreement).collect()
    }

    async fn list_agreements_with_stale_snapshot(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> Result<Vec<Agreement>> {
        let rows = sqlx::query(
            r#"
            SELECT a.version, a.document FROM agreements a
            JOIN order_snapshots s ON s.agreement_id = a.id
            WHERE s.agreement_version < a.version OR s.status <> a.status
            ORDER BY a.created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut **tx)
        .await?;
        rows.into_iter().map(Self::row_to_agreement).collect()
    }

    async fn upsert_conversation(
        &self,
        tx: &mut Self::Tx,
        conversation: &Conversation,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, status, is_accepted, agreement_id, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                is_accepted = EXCLUDED.is_accepted,
                agreement_id = EXCLUDED.agreement_id,
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(conversation.id.as_uuid())
        .bind(conversation.status.as_str())
        .bind(conversation.is_accepted())
        .bind(conversation.agreement_id.map(|id| id.as_uuid()))
        .bind(to_document(conversation)?)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn get_conversation(
        &self,
        tx: &mut Self::Tx,
        id: ConversationId,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT document FROM conversations WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(document).transpose()
    }

    async fn list_accepted_conversations_without_agreement(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM conversations
            WHERE is_accepted AND agreement_id IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut **tx)
        .await?;
        documents(rows)
    }

    async fn upsert_legacy_record(&self, tx: &mut Self::Tx, record: &LegacyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO legacy_records (id, conversation_id, is_accepted, accepted_at, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                is_accepted = EXCLUDED.is_accepted,
                accepted_at = EXCLUDED.accepted_at,
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.conversation_id.as_uuid())
        .bind(record.is_accepted())
        .bind(record.accepted_or_created_at())
        .bind(to_document(record)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn get_legacy_record(
        &self,
        tx: &mut Self::Tx,
        id: LegacyRecordId,
    ) -> Result<Option<LegacyRecord>> {
        let row = sqlx::query("SELECT document FROM legacy_records WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(document).transpose()
    }

    async fn list_legacy_records_for_conversation(
        &self,
        tx: &mut Self::Tx,
        conversation_id: ConversationId,
    ) -> Result<Vec<LegacyRecord>> {
        let rows = sqlx::query(
            "SELECT document FROM legacy_records WHERE conversation_id = $1 ORDER BY created_at ASC",
        )
        .bind(conversation_id.as_uuid())
        .fetch_all(&mut **tx)
        .await?;
        documents(rows)
    }

    async fn list_accepted_legacy_records_since(
        &self,
        tx: &mut Self::Tx,
        since: DateTime<Utc>,
    ) -> Result<Vec<LegacyRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM legacy_records
            WHERE is_accepted AND accepted_at >= $1
            ORDER BY accepted_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(&mut **tx)
        .await?;
        documents(rows)
    }

    async fn list_all_legacy_records(&self, tx: &mut Self::Tx) -> Result<Vec<LegacyRecord>> {
        let rows = sqlx::query("SELECT document FROM legacy_records ORDER BY created_at ASC")
            .fetch_all(&mut **tx)
            .await?;
        documents(rows)
    }

    async fn insert_order_snapshot(
        &self,
        tx: &mut Self::Tx,
        snapshot: &OrderSnapshot,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_snapshots
                (agreement_id, conversation_id, status, agreement_version, document, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(snapshot.agreement_id.as_uuid())
        .bind(snapshot.conversation_id.as_uuid())
        .bind(snapshot.status.as_str())
        .bind(snapshot.agreement_version.as_i64())
        .bind(to_document(snapshot)?)
        .bind(snapshot.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(unique_violation(
            "order_snapshot",
            snapshot.agreement_id.to_string(),
        ))?;
        Ok(())
    }

    async fn update_order_snapshot(
        &self,
        tx: &mut Self::Tx,
        snapshot: &OrderSnapshot,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE order_snapshots
            SET status = $2, agreement_version = $3, document = $4, updated_at = $5
            WHERE agreement_id = $1 AND agreement_version <= $3
            "#,
        )
        .bind(snapshot.agreement_id.as_uuid())
        .bind(snapshot.status.as_str())
        .bind(snapshot.agreement_version.as_i64())
        .bind(to_document(snapshot)?)
        .bind(snapshot.updated_at)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar(
                "SELECT agreement_version FROM order_snapshots WHERE agreement_id = $1",
            )
            .bind(snapshot.agreement_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await?;
            return match exists {
                Some(stored) => {
                    tracing::debug!(
                        agreement_id = %snapshot.agreement_id,
                        stored,
                        attempted = snapshot.agreement_version.as_i64(),
                        "older order snapshot write dropped"
                    );
                    Ok(())
                }
                None => Err(StoreError::NotFound {
                    entity: "order_snapshot",
                    id: snapshot.agreement_id.to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn get_order_snapshot(
        &self,
        tx: &mut Self::Tx,
        agreement_id: AgreementId,
    ) -> Result<Option<OrderSnapshot>> {
        let row = sqlx::query("SELECT document FROM order_snapshots WHERE agreement_id = $1")
            .bind(agreement_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(document).transpose()
    }

    async fn get_wallet_for_update(
        &self,
        tx: &mut Self::Tx,
        user_id: UserId,
    ) -> Result<Option<Wallet>> {
        let row = sqlx::query(
            "SELECT balance_cents, updated_at FROM wallets WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;
        match row {
            Some(row) => Ok(Some(Wallet {
                user_id,
                balance: Money::from_cents(row.try_get("balance_cents")?),
                updated_at: row.try_get("updated_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert_wallet(&self, tx: &mut Self::Tx, wallet: &Wallet) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallets (user_id, balance_cents, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                balance_cents = EXCLUDED.balance_cents,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(wallet.user_id.as_uuid())
        .bind(wallet.balance.cents())
        .bind(wallet.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_ledger_entry(&self, tx: &mut Self::Tx, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, user_id, operation_id, reason, agreement_id, refunded, document, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.user_id.as_uuid())
        .bind(&entry.operation_id)
        .bind(entry.reason.as_str())
        .bind(entry.agreement_id.map(|id| id.as_uuid()))
        .bind(entry.is_refunded())
        .bind(to_document(entry)?)
        .bind(entry.created_at)
        .execute(&mut **tx)
        .await
        .map_err(unique_violation("ledger_entry", entry.operation_id.clone()))?;
        Ok(())
    }

    async fn update_ledger_entry(&self, tx: &mut Self::Tx, entry: &LedgerEntry) -> Result<()> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET refunded = $2, document = $3 WHERE id = $1",
        )
        .bind(entry.id.as_uuid())
        .bind(entry.is_refunded())
        .bind(to_document(entry)?)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "ledger_entry",
                id: entry.id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_ledger_entry_by_operation(
        &self,
        tx: &mut Self::Tx,
        operation_id: &str,
    ) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query("SELECT document FROM ledger_entries WHERE operation_id = $1")
            .bind(operation_id)
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(document).transpose()
    }

    async fn find_unrefunded_escrow_hold(
        &self,
        tx: &mut Self::Tx,
        agreement_id: AgreementId,
    ) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT document FROM ledger_entries
            WHERE agreement_id = $1 AND reason = $2 AND NOT refunded
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(agreement_id.as_uuid())
        .bind(LedgerReason::EscrowHold.as_str())
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(document).transpose()
    }

    async fn insert_task(&self, tx: &mut Self::Tx, task: &RetryTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_tasks
                (id, task_type, status, attempts, max_attempts, next_attempt, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(task.attempts as i32)
        .bind(task.max_attempts as i32)
        .bind(task.next_attempt)
        .bind(to_document(task)?)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn claim_due_task(
        &self,
        tx: &mut Self::Tx,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryTask>> {
        let row = sqlx::query(
            r#"
            SELECT document FROM retry_tasks
            WHERE status IN ('pending', 'processing') AND next_attempt <= $1
            ORDER BY next_attempt ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut task: RetryTask = document(&row)?;
        task.claim(now);
        self.update_task(tx, &task).await?;
        Ok(Some(task))
    }

    async fn update_task(&self, tx: &mut Self::Tx, task: &RetryTask) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE retry_tasks
            SET status = $2, attempts = $3, next_attempt = $4, document = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.status.as_str())
        .bind(task.attempts as i32)
        .bind(task.next_attempt)
        .bind(to_document(task)?)
        .bind(task.updated_at)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "retry_task",
                id: task.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_task(&self, tx: &mut Self::Tx, id: TaskId) -> Result<Option<RetryTask>> {
        let row = sqlx::query("SELECT document FROM retry_tasks WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(document).transpose()
    }

    async fn collection_counts(&self, tx: &mut Self::Tx) -> Result<CollectionCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM agreements) AS agreements,
                (SELECT COUNT(*) FROM agreements WHERE legacy_record_id IS NOT NULL)
                    AS agreements_with_legacy_record,
                (SELECT COUNT(*) FROM order_snapshots) AS order_snapshots,
                (SELECT COUNT(*) FROM legacy_records) AS legacy_records,
                (SELECT COUNT(*) FROM legacy_records WHERE is_accepted) AS accepted_legacy_records,
                (SELECT COUNT(*) FROM conversations WHERE is_accepted) AS accepted_conversations,
                (SELECT COUNT(*) FROM conversations WHERE is_accepted AND agreement_id IS NULL)
                    AS accepted_conversations_without_agreement,
                (SELECT COUNT(*) FROM retry_tasks WHERE status = 'pending') AS pending_tasks,
                (SELECT COUNT(*) FROM retry_tasks WHERE status = 'failed') AS failed_tasks
            "#,
        )
        .fetch_one(&mut **tx)
        .await?;

        let count = |column: &str| -> Result<u64> { Ok(row.try_get::<i64, _>(column)? as u64) };
        Ok(CollectionCounts {
            agreements: count("agreements")?,
            agreements_with_legacy_record: count("agreements_with_legacy_record")?,
            order_snapshots: count("order_snapshots")?,
            legacy_records: count("legacy_records")?,
            accepted_legacy_records: count("accepted_legacy_records")?,
            accepted_conversations: count("accepted_conversations")?,
            accepted_conversations_without_agreement: count(
                "accepted_conversations_without_agreement",
            )?,
            pending_tasks: count("pending_tasks")?,
            failed_tasks: count("failed_tasks")?,
        })
    }
}
