use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

/// Something an operator has to look at: a billing event that will never be
/// applied, or a crisis escalation that could not be delivered.
#[derive(Debug, Clone)]
pub struct OperatorAlert {
    pub source: &'static str,
    pub subject: String,
    pub reason: String,
    pub details: Value,
}

#[async_trait]
pub trait OperatorAlerts: Send + Sync {
    async fn raise(&self, alert: OperatorAlert);
}

/// Logs at error level and keeps a row in `operator_alerts`.
pub struct PgOperatorAlerts {
    pool: PgPool,
}

impl PgOperatorAlerts {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OperatorAlerts for PgOperatorAlerts {
    async fn raise(&self, alert: OperatorAlert) {
        tracing::error!(
            alert_source = alert.source,
            subject = %alert.subject,
            reason = %alert.reason,
            details = %alert.details,
            "operator alert"
        );

        let inserted = sqlx::query(
            "INSERT INTO operator_alerts (id, source, subject, reason, details) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(uuid::Uuid::now_v7())
        .bind(alert.source)
        .bind(&alert.subject)
        .bind(&alert.reason)
        .bind(&alert.details)
        .execute(&self.pool)
        .await;

        if let Err(err) = inserted {
            tracing::error!(
                alert_source = alert.source,
                subject = %alert.subject,
                error = %err,
                "failed to persist operator alert"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Collects alerts in memory.
    #[derive(Default)]
    pub(crate) struct RecordingAlerts {
        pub raised: Mutex<Vec<OperatorAlert>>,
    }

    impl RecordingAlerts {
        pub fn count(&self) -> usize {
            self.raised.lock().map(|raised| raised.len()).unwrap_or(0)
        }

        pub fn sources(&self) -> Vec<&'static str> {
            self.raised
                .lock()
                .map(|raised| raised.iter().map(|a| a.source).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl OperatorAlerts for RecordingAlerts {
        async fn raise(&self, alert: OperatorAlert) {
            if let Ok(mut raised) = self.raised.lock() {
                raised.push(alert);
            }
        }
    }
}
