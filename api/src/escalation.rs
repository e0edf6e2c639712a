use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use mindease_core::crisis::{CrisisFlag, CrisisOccurrence};
use mindease_core::risk::RiskLevel;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::alerts::{OperatorAlert, OperatorAlerts};

/// Upper bound on staging a job before the chat turn moves on without it.
const STAGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Unit of work for the delivery worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum EscalationJob {
    CreateFlag(CrisisFlag),
    RecordOccurrence(CrisisOccurrence),
}

impl EscalationJob {
    pub fn flag_id(&self) -> Uuid {
        match self {
            EscalationJob::CreateFlag(flag) => flag.id,
            EscalationJob::RecordOccurrence(occurrence) => occurrence.flag_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            EscalationJob::CreateFlag(flag) => flag.user_id,
            EscalationJob::RecordOccurrence(occurrence) => occurrence.user_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            EscalationJob::CreateFlag(_) => "create_flag",
            EscalationJob::RecordOccurrence(_) => "record_occurrence",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("job encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Durable destination of crisis records. Must be idempotent per flag id
/// (and per flag id + message ref for occurrences): jobs are redelivered.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn deliver(&self, job: &EscalationJob) -> Result<(), SinkError>;
}

pub struct PgEscalationSink {
    pool: PgPool,
}

impl PgEscalationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EscalationSink for PgEscalationSink {
    async fn deliver(&self, job: &EscalationJob) -> Result<(), SinkError> {
        match job {
            EscalationJob::CreateFlag(flag) => {
                let mut tx = self.pool.begin().await?;
                sqlx::query(
                    "INSERT INTO crisis_flags (id, user_id, risk_level, triggering_message_ref, created_at) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(flag.id)
                .bind(flag.user_id)
                .bind(flag.risk_level.as_str())
                .bind(&flag.triggering_message_ref)
                .bind(flag.created_at)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT INTO admin_notifications (id, flag_id, user_id, risk_level, message, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6) \
                     ON CONFLICT (flag_id) DO NOTHING",
                )
                .bind(Uuid::now_v7())
                .bind(flag.id)
                .bind(flag.user_id)
                .bind(flag.risk_level.as_str())
                .bind(format!(
                    "{} risk detected in a chat message; follow up with the user.",
                    flag.risk_level.as_str()
                ))
                .bind(flag.created_at)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
            }
            EscalationJob::RecordOccurrence(occurrence) => {
                sqlx::query(
                    "INSERT INTO crisis_flag_occurrences (flag_id, user_id, risk_level, message_ref, occurred_at) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (flag_id, message_ref) DO NOTHING",
                )
                .bind(occurrence.flag_id)
                .bind(occurrence.user_id)
                .bind(occurrence.risk_level.as_str())
                .bind(&occurrence.message_ref)
                .bind(occurrence.occurred_at)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}

/// Write-ahead log of escalation jobs. A job is staged before the chat turn
/// returns and marked delivered once the sink has it; whatever is still
/// unmarked when the process stops is replayed by the next worker.
#[async_trait]
pub trait EscalationOutbox: Send + Sync {
    /// Returns the entry id.
    async fn stage(&self, job: &EscalationJob) -> Result<Uuid, SinkError>;
    async fn mark_delivered(&self, entry_id: Uuid) -> Result<(), SinkError>;
    /// Undelivered entries staged before `before`, oldest first.
    async fn undelivered(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, EscalationJob)>, SinkError>;
}

pub struct PgEscalationOutbox {
    pool: PgPool,
}

impl PgEscalationOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EscalationOutbox for PgEscalationOutbox {
    async fn stage(&self, job: &EscalationJob) -> Result<Uuid, SinkError> {
        let entry_id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO crisis_escalation_outbox (id, kind, flag_id, user_id, job, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry_id)
        .bind(job.kind())
        .bind(job.flag_id())
        .bind(job.user_id())
        .bind(serde_json::to_value(job)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(entry_id)
    }

    async fn mark_delivered(&self, entry_id: Uuid) -> Result<(), SinkError> {
        sqlx::query("UPDATE crisis_escalation_outbox SET delivered_at = NOW() WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn undelivered(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, EscalationJob)>, SinkError> {
        let rows = sqlx::query_as::<_, (Uuid, serde_json::Value)>(
            "SELECT id, job FROM crisis_escalation_outbox \
             WHERE delivered_at IS NULL AND created_at < $1 \
             ORDER BY created_at, id",
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (entry_id, raw) in rows {
            match serde_json::from_value(raw) {
                Ok(job) => entries.push((entry_id, job)),
                Err(err) => tracing::error!(
                    entry_id = %entry_id,
                    error = %err,
                    "unreadable crisis escalation outbox entry skipped"
                ),
            }
        }
        Ok(entries)
    }
}

/// Exponential backoff with jitter for delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based): half of the
    /// capped exponential step plus a random share of the other half.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let half = capped / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

/// A job on its way to the worker, with its outbox entry if it was staged.
#[derive(Debug)]
struct QueuedJob {
    entry_id: Option<Uuid>,
    job: EscalationJob,
}

/// Replays the outbox, then drains the escalation queue one job at a time,
/// in enqueue order.
pub struct EscalationWorker {
    rx: mpsc::UnboundedReceiver<QueuedJob>,
    sink: Arc<dyn EscalationSink>,
    outbox: Arc<dyn EscalationOutbox>,
    alerts: Arc<dyn OperatorAlerts>,
    retry: RetryPolicy,
    started_at: DateTime<Utc>,
}

impl EscalationWorker {
    /// Runs until every sender is gone and the queue is empty.
    pub async fn run(mut self) {
        self.replay().await;
        while let Some(queued) = self.rx.recv().await {
            self.process(queued).await;
        }
        tracing::info!("escalation queue drained");
    }

    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<EscalationJob> {
        self.rx.try_recv().ok().map(|queued| queued.job)
    }

    /// Entries staged by an earlier process that never reached the sink.
    async fn replay(&self) {
        let entries = match self.outbox.undelivered(self.started_at).await {
            Ok(entries) => entries,
            Err(err) => {
                self.alerts
                    .raise(OperatorAlert {
                        source: "crisis_escalation",
                        subject: "outbox".to_string(),
                        reason: format!("undelivered escalations could not be replayed: {err}"),
                        details: serde_json::Value::Null,
                    })
                    .await;
                return;
            }
        };
        if entries.is_empty() {
            return;
        }

        tracing::warn!(count = entries.len(), "replaying undelivered crisis escalations");
        for (entry_id, job) in entries {
            self.process(QueuedJob {
                entry_id: Some(entry_id),
                job,
            })
            .await;
        }
    }

    async fn process(&self, queued: QueuedJob) {
        if !self.deliver(&queued.job).await {
            return;
        }
        let Some(entry_id) = queued.entry_id else {
            return;
        };
        if let Err(err) = self.outbox.mark_delivered(entry_id).await {
            tracing::warn!(
                entry_id = %entry_id,
                flag_id = %queued.job.flag_id(),
                error = %err,
                "delivered escalation not marked; it will be redelivered on restart"
            );
        }
    }

    /// False once the job is dead-lettered.
    async fn deliver(&self, job: &EscalationJob) -> bool {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.sink.deliver(job).await {
                Ok(()) => {
                    tracing::info!(
                        job = job.kind(),
                        flag_id = %job.flag_id(),
                        user_id = %job.user_id(),
                        attempt,
                        "crisis escalation delivered"
                    );
                    return true;
                }
                Err(err) => err,
            };

            if attempt >= self.retry.max_attempts {
                self.dead_letter(job, attempt, &err).await;
                return false;
            }

            let delay = self.retry.delay_after(attempt);
            tracing::warn!(
                job = job.kind(),
                flag_id = %job.flag_id(),
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "crisis escalation delivery failed"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn dead_letter(&self, job: &EscalationJob, attempts: u32, err: &SinkError) {
        self.alerts
            .raise(OperatorAlert {
                source: "crisis_escalation",
                subject: job.flag_id().to_string(),
                reason: format!("{} undeliverable after {attempts} attempts: {err}", job.kind()),
                details: serde_json::to_value(job).unwrap_or_default(),
            })
            .await;
    }
}

/// Outcome of a qualifying message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDecision {
    /// A new crisis flag was raised.
    Flagged(Uuid),
    /// The message fell inside an open flag's window and was attached to it.
    Attached(Uuid),
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    flag_id: Uuid,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct Anchors {
    by_user: HashMap<Uuid, Vec<Anchor>>,
    swept_at: Option<DateTime<Utc>>,
}

impl Anchors {
    /// Drop anchors nothing can attach to any more, at most once per `horizon`.
    fn sweep(&mut self, now: DateTime<Utc>, horizon: TimeDelta) {
        if self.swept_at.is_some_and(|at| now - at < horizon) {
            return;
        }
        self.by_user.retain(|_, anchors| {
            anchors.retain(|anchor| now - anchor.at < horizon);
            !anchors.is_empty()
        });
        self.swept_at = Some(now);
    }

    fn forget(&mut self, user_id: Uuid, flag_id: Uuid) {
        if let Some(anchors) = self.by_user.get_mut(&user_id) {
            anchors.retain(|anchor| anchor.flag_id != flag_id);
            if anchors.is_empty() {
                self.by_user.remove(&user_id);
            }
        }
    }
}

/// Stages a decided job and queues it for the worker.
struct HandOff {
    anchors: Arc<Mutex<Anchors>>,
    queue: mpsc::UnboundedSender<QueuedJob>,
    outbox: Arc<dyn EscalationOutbox>,
    alerts: Arc<dyn OperatorAlerts>,
}

impl HandOff {
    async fn run(self, decision: EscalationDecision, job: EscalationJob) {
        let entry_id = match tokio::time::timeout(STAGE_TIMEOUT, self.outbox.stage(&job)).await {
            Ok(Ok(entry_id)) => Some(entry_id),
            Ok(Err(err)) => {
                tracing::warn!(
                    flag_id = %job.flag_id(),
                    error = %err,
                    "crisis escalation not staged; queued in memory only"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    flag_id = %job.flag_id(),
                    timeout_ms = STAGE_TIMEOUT.as_millis() as u64,
                    "crisis escalation staging timed out; queued in memory only"
                );
                None
            }
        };

        let Err(mpsc::error::SendError(QueuedJob { job, .. })) =
            self.queue.send(QueuedJob { entry_id, job })
        else {
            return;
        };

        // Nobody will deliver this job in this process.
        let reason = if entry_id.is_some() {
            "escalation worker is not running; job staged for replay on restart"
        } else {
            if let EscalationDecision::Flagged(flag_id) = decision {
                self.anchors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .forget(job.user_id(), flag_id);
            }
            "escalation worker is not running and the job could not be staged"
        };
        self.alerts
            .raise(OperatorAlert {
                source: "crisis_escalation",
                subject: job.flag_id().to_string(),
                reason: format!("{}: {reason}", job.kind()),
                details: serde_json::to_value(&job).unwrap_or_default(),
            })
            .await;
    }
}

/// Debounces crisis flags per user and hands them to the delivery worker.
///
/// The decision is taken synchronously under a lock, so messages of one user
/// are decided in call order. Only the staging write is awaited; delivery
/// happens on the worker. A flag whose job reaches neither the outbox nor the
/// worker is forgotten, so the next qualifying message raises a fresh one.
pub struct CrisisEscalator {
    window: TimeDelta,
    anchors: Arc<Mutex<Anchors>>,
    queue: mpsc::UnboundedSender<QueuedJob>,
    outbox: Arc<dyn EscalationOutbox>,
    alerts: Arc<dyn OperatorAlerts>,
}

impl CrisisEscalator {
    pub fn new(
        debounce: Duration,
        sink: Arc<dyn EscalationSink>,
        outbox: Arc<dyn EscalationOutbox>,
        alerts: Arc<dyn OperatorAlerts>,
        retry: RetryPolicy,
    ) -> (Self, EscalationWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let escalator = Self {
            window: TimeDelta::from_std(debounce).unwrap_or(TimeDelta::seconds(60)),
            anchors: Arc::default(),
            queue: tx,
            outbox: outbox.clone(),
            alerts: alerts.clone(),
        };
        let worker = EscalationWorker {
            rx,
            sink,
            outbox,
            alerts,
            retry,
            started_at: Utc::now(),
        };
        (escalator, worker)
    }

    /// Only HIGH and CRITICAL messages escalate. A message within the window
    /// of an existing flag (in either direction, so late arrivals are handled)
    /// is attached to that flag instead of raising a new one.
    ///
    /// The hand-off runs on its own task: dropping this future does not
    /// cancel it.
    pub async fn maybe_escalate(
        &self,
        user_id: Uuid,
        message_ref: &str,
        level: RiskLevel,
        occurred_at: DateTime<Utc>,
    ) -> Option<EscalationDecision> {
        if !level.triggers_escalation() {
            return None;
        }

        let (decision, job) = self.decide(user_id, message_ref, level, occurred_at);
        match decision {
            EscalationDecision::Flagged(flag_id) => tracing::warn!(
                user_id = %user_id,
                flag_id = %flag_id,
                risk_level = level.as_str(),
                message_ref,
                "crisis flag raised"
            ),
            EscalationDecision::Attached(flag_id) => tracing::info!(
                user_id = %user_id,
                flag_id = %flag_id,
                risk_level = level.as_str(),
                message_ref,
                "crisis message attached to open flag"
            ),
        }

        let hand_off = HandOff {
            anchors: self.anchors.clone(),
            queue: self.queue.clone(),
            outbox: self.outbox.clone(),
            alerts: self.alerts.clone(),
        };
        if let Err(err) = tokio::spawn(hand_off.run(decision, job)).await {
            tracing::error!(user_id = %user_id, error = %err, "escalation hand-off task failed");
        }
        Some(decision)
    }

    fn decide(
        &self,
        user_id: Uuid,
        message_ref: &str,
        level: RiskLevel,
        occurred_at: DateTime<Utc>,
    ) -> (EscalationDecision, EscalationJob) {
        let mut anchors = self.anchors.lock().unwrap_or_else(PoisonError::into_inner);
        let horizon = self.window * 2;
        anchors.sweep(occurred_at, horizon);

        let user_anchors = anchors.by_user.entry(user_id).or_default();
        user_anchors.retain(|anchor| occurred_at - anchor.at < horizon);

        let open = user_anchors
            .iter()
            .filter(|anchor| (occurred_at - anchor.at).abs() < self.window)
            .min_by_key(|anchor| (occurred_at - anchor.at).abs())
            .copied();

        match open {
            Some(anchor) => (
                EscalationDecision::Attached(anchor.flag_id),
                EscalationJob::RecordOccurrence(CrisisOccurrence {
                    flag_id: anchor.flag_id,
                    user_id,
                    risk_level: level,
                    message_ref: message_ref.to_string(),
                    occurred_at,
                }),
            ),
            None => {
                let flag = CrisisFlag::new(user_id, level, message_ref, occurred_at);
                user_anchors.push(Anchor {
                    flag_id: flag.id,
                    at: occurred_at,
                });
                (
                    EscalationDecision::Flagged(flag.id),
                    EscalationJob::CreateFlag(flag),
                )
            }
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.anchors
            .lock()
            .map(|anchors| anchors.by_user.len())
            .unwrap_or_default()
    }
}
