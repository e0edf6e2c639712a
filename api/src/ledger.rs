use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mindease_core::billing::{
    BillingEvent, IngestOutcome, LedgerRecord, LedgerStatus, Rejection, StatusTransition,
    SubscriptionStatus,
};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::alerts::{OperatorAlert, OperatorAlerts};
use crate::entitlement::EntitlementCache;
use crate::error::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("billing event '{id}' failed on attempt {attempts} (permanent: {permanent}): {source}")]
    Processing {
        id: String,
        attempts: i32,
        permanent: bool,
        #[source]
        source: StoreError,
    },
}

/// Durable record of billing events, keyed by event id.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Tx: LedgerTx;

    /// Insert the record as pending if absent, then lock it for the returned
    /// transaction. Concurrent claims of the same id wait here.
    async fn claim(&self, event: &BillingEvent) -> Result<(Self::Tx, LedgerRecord), StoreError>;
}

/// Unit of work holding the row lock of one ledger record. Dropping it
/// without `commit` rolls everything back.
#[async_trait]
pub trait LedgerTx: Send {
    /// Mark the point a failed attempt rolls back to.
    async fn begin_attempt(&mut self) -> Result<(), StoreError>;

    /// Undo everything since `begin_attempt` and count the attempt as failed,
    /// still under the row lock. Processed and permanently failed records are
    /// left untouched.
    async fn fail_attempt(
        &mut self,
        reason: &str,
        max_attempts: i32,
    ) -> Result<LedgerRecord, StoreError>;

    async fn write_subscription_status(
        &mut self,
        user_id: Uuid,
        status: SubscriptionStatus,
        event_id: &str,
    ) -> Result<(), StoreError>;

    async fn finalize(
        &mut self,
        status: LedgerStatus,
        permanent: bool,
        reason: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

/// What the webhook route needs from the ledger.
#[async_trait]
pub trait BillingLedger: Send + Sync {
    async fn ingest(&self, event: &BillingEvent) -> Result<IngestOutcome, LedgerError>;
}

#[async_trait]
impl<S: LedgerStore + 'static> BillingLedger for WebhookLedger<S> {
    async fn ingest(&self, event: &BillingEvent) -> Result<IngestOutcome, LedgerError> {
        WebhookLedger::ingest(self, event).await
    }
}

/// Idempotent ingestion of billing events into subscription status.
pub struct WebhookLedger<S> {
    store: S,
    entitlements: Arc<EntitlementCache>,
    alerts: Arc<dyn OperatorAlerts>,
    max_attempts: i32,
}

impl<S: LedgerStore> WebhookLedger<S> {
    pub fn new(
        store: S,
        entitlements: Arc<EntitlementCache>,
        alerts: Arc<dyn OperatorAlerts>,
        max_attempts: i32,
    ) -> Self {
        Self {
            store,
            entitlements,
            alerts,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Apply `event` at most once.
    ///
    /// Returns `Err` only for failures worth a redelivery: the record then
    /// stays retryable until `max_attempts` is reached. An event without an id
    /// is rejected without touching the store.
    pub async fn ingest(&self, event: &BillingEvent) -> Result<IngestOutcome, LedgerError> {
        if event.id.is_empty() {
            tracing::warn!(kind = %event.kind, "billing event without an id rejected");
            return Ok(IngestOutcome::Rejected {
                reason: Rejection::MissingId.to_string(),
            });
        }

        let (mut tx, record) = self.store.claim(event).await?;

        if record.payload_hash != event.payload_hash {
            tracing::warn!(
                event_id = %event.id,
                kind = %event.kind,
                "billing event id reused with a different payload"
            );
            return Ok(IngestOutcome::Conflict);
        }

        if record.is_terminal() {
            tracing::debug!(
                event_id = %event.id,
                status = record.status.as_str(),
                "billing event already handled"
            );
            return Ok(IngestOutcome::AlreadyProcessed {
                status: record.status,
            });
        }

        let transition = match event.transition() {
            Ok(transition) => transition,
            Err(rejection) => {
                let reason = rejection.to_string();
                tx.finalize(LedgerStatus::Failed, true, Some(&reason)).await?;
                tx.commit().await?;
                tracing::warn!(
                    event_id = %event.id,
                    kind = %event.kind,
                    reason = %reason,
                    "billing event rejected"
                );
                return Ok(IngestOutcome::Rejected { reason });
            }
        };

        // Held from before the status write until after commit, on both paths.
        let entitlement = self.entitlements.lock_for_update(transition.user_id).await;
        match Self::apply(&mut tx, &event.id, transition).await {
            Ok(()) => {
                tx.commit().await?;
                drop(entitlement);
                tracing::info!(
                    event_id = %event.id,
                    kind = %event.kind,
                    user_id = %transition.user_id,
                    status = transition.status.as_str(),
                    "billing event applied"
                );
                Ok(IngestOutcome::Accepted)
            }
            Err(source) => {
                let record = tx
                    .fail_attempt(&source.to_string(), self.max_attempts)
                    .await?;
                tx.commit().await?;
                drop(entitlement);
                let permanent = record.status == LedgerStatus::Failed && record.permanent;
                if permanent {
                    self.alerts
                        .raise(OperatorAlert {
                            source: "billing_ledger",
                            subject: event.id.clone(),
                            reason: format!(
                                "billing event gave up after {} attempts: {source}",
                                record.attempts
                            ),
                            details: serde_json::json!({
                                "kind": event.kind,
                                "user_id": transition.user_id,
                                "status": transition.status.as_str(),
                            }),
                        })
                        .await;
                }
                Err(LedgerError::Processing {
                    id: event.id.clone(),
                    attempts: record.attempts,
                    permanent,
                    source,
                })
            }
        }
    }

    /// Status write and record finalization, committed together by the caller.
    async fn apply(
        tx: &mut S::Tx,
        event_id: &str,
        transition: StatusTransition,
    ) -> Result<(), StoreError> {
        tx.begin_attempt().await?;
        tx.write_subscription_status(transition.user_id, transition.status, event_id)
            .await?;
        tx.finalize(LedgerStatus::Processed, false, None).await
    }
}

// --- Postgres store ---

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
    id: String,
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    id: String,
    kind: String,
    subject_user_id: Option<Uuid>,
    status: String,
    attempts: i32,
    permanent: bool,
    failure_reason: Option<String>,
    payload_hash: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<LedgerRow> for LedgerRecord {
    fn from(row: LedgerRow) -> Self {
        LedgerRecord {
            id: row.id,
            kind: row.kind,
            subject_user_id: row.subject_user_id,
            status: LedgerStatus::from_db_value(&row.status),
            attempts: row.attempts,
            permanent: row.permanent,
            failure_reason: row.failure_reason,
            payload_hash: row.payload_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const LEDGER_COLUMNS: &str = "id, kind, subject_user_id, status, attempts, permanent, \
                              failure_reason, payload_hash, created_at, updated_at";

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Tx = PgLedgerTx;

    async fn claim(&self, event: &BillingEvent) -> Result<(PgLedgerTx, LedgerRecord), StoreError> {
        // Autocommitted: the record survives even if processing rolls back.
        sqlx::query(
            "INSERT INTO billing_ledger \
             (id, kind, subject_user_id, status, attempts, permanent, payload_hash, created_at, updated_at) \
             VALUES ($1, $2, $3, 'pending', 0, FALSE, $4, $5, $5) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.kind)
        .bind(event.subject_user_id)
        .bind(&event.payload_hash)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM billing_ledger WHERE id = $1 FOR UPDATE"
        ))
        .bind(&event.id)
        .fetch_one(&mut *tx)
        .await?;

        Ok((
            PgLedgerTx {
                tx,
                id: event.id.clone(),
            },
            row.into(),
        ))
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn begin_attempt(&mut self) -> Result<(), StoreError> {
        sqlx::query("SAVEPOINT ledger_attempt")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn fail_attempt(
        &mut self,
        reason: &str,
        max_attempts: i32,
    ) -> Result<LedgerRecord, StoreError> {
        // Also clears an aborted-transaction state left by the failed statement.
        sqlx::query("ROLLBACK TO SAVEPOINT ledger_attempt")
            .execute(&mut *self.tx)
            .await?;

        let updated = sqlx::query_as::<_, LedgerRow>(&format!(
            "UPDATE billing_ledger \
             SET status = 'failed', attempts = attempts + 1, \
                 permanent = (attempts + 1 >= $3), failure_reason = $2, updated_at = NOW() \
             WHERE id = $1 AND status <> 'processed' AND NOT permanent \
             RETURNING {LEDGER_COLUMNS}"
        ))
        .bind(&self.id)
        .bind(reason)
        .bind(max_attempts)
        .fetch_optional(&mut *self.tx)
        .await?;

        let row = match updated {
            Some(row) => row,
            None => {
                sqlx::query_as::<_, LedgerRow>(&format!(
                    "SELECT {LEDGER_COLUMNS} FROM billing_ledger WHERE id = $1"
                ))
                .bind(&self.id)
                .fetch_one(&mut *self.tx)
                .await?
            }
        };
        Ok(row.into())
    }

    async fn write_subscription_status(
        &mut self,
        user_id: Uuid,
        status: SubscriptionStatus,
        event_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO subscription_status (user_id, status, last_event_id, updated_at) \
             VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (user_id) DO UPDATE \
             SET status = EXCLUDED.status, last_event_id = EXCLUDED.last_event_id, updated_at = NOW()",
        )
        .bind(user_id)
        .bind(status.as_str())
        .bind(event_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn finalize(
        &mut self,
        status: LedgerStatus,
        permanent: bool,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE billing_ledger \
             SET status = $2, permanent = $3, failure_reason = $4, \
                 attempts = attempts + 1, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(&self.id)
        .bind(status.as_str())
        .bind(permanent)
        .bind(reason)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
