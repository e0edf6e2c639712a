use std::str::FromStr;
use std::time::Duration;

use mindease_core::chat::{CrisisResource, SelectionStrategy};
use mindease_core::risk::{RiskLevel, RiskThresholds, ThresholdError};

use crate::circuit::BreakerConfig;
use crate::escalation::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Thresholds(#[from] ThresholdError),
}

#[derive(Debug, Clone)]
pub struct CloudBackendConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    pub url: String,
}

/// Every tunable of the engine. Read from environment variables (key/value),
/// with `.env` loaded first when present.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub entitlement_ttl: Duration,
    pub entitlement_fetch_timeout: Duration,
    pub ledger_max_attempts: i32,
    pub webhook_secret: Option<String>,
    pub risk: RiskThresholds,
    pub crisis_debounce: Duration,
    pub escalation_retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub default_strategy: SelectionStrategy,
    pub backend_timeout: Duration,
    pub cloud: Option<CloudBackendConfig>,
    pub local: Option<LocalBackendConfig>,
    pub crisis_resources: Vec<CrisisResource>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            entitlement_ttl: Duration::from_secs(300),
            entitlement_fetch_timeout: Duration::from_secs(2),
            ledger_max_attempts: 5,
            webhook_secret: None,
            risk: RiskThresholds::default(),
            crisis_debounce: Duration::from_secs(60),
            escalation_retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            default_strategy: SelectionStrategy::UserPreference,
            backend_timeout: Duration::from_millis(10_000),
            cloud: None,
            local: None,
            crisis_resources: default_crisis_resources(),
        }
    }
}

fn default_crisis_resources() -> Vec<CrisisResource> {
    vec![
        CrisisResource {
            name: "988 Suicide & Crisis Lifeline".to_string(),
            contact: "Call or text 988".to_string(),
            url: Some("https://988lifeline.org".to_string()),
        },
        CrisisResource {
            name: "Emergency services".to_string(),
            contact: "Call your local emergency number (911 / 112)".to_string(),
            url: None,
        },
    ]
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let risk = RiskThresholds {
            low: parse_or(&get, "MINDEASE_RISK_LOW", defaults.risk.low)?,
            medium: parse_or(&get, "MINDEASE_RISK_MEDIUM", defaults.risk.medium)?,
            high: parse_or(&get, "MINDEASE_RISK_HIGH", defaults.risk.high)?,
            critical: parse_or(&get, "MINDEASE_RISK_CRITICAL", defaults.risk.critical)?,
            fail_safe: match get("MINDEASE_RISK_FAIL_SAFE").as_deref() {
                Some("CRITICAL") | Some("critical") => RiskLevel::Critical,
                _ => defaults.risk.fail_safe,
            },
        };
        risk.validate()?;

        let cloud = get("MINDEASE_CLOUD_URL").map(|url| CloudBackendConfig {
            url,
            api_key: get("MINDEASE_CLOUD_API_KEY"),
            model: get("MINDEASE_CLOUD_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
        });
        let local = get("MINDEASE_LOCAL_URL").map(|url| LocalBackendConfig { url });

        let crisis_resources = match get("MINDEASE_CRISIS_RESOURCES") {
            Some(raw) => serde_json::from_str::<Vec<CrisisResource>>(&raw).map_err(|e| {
                ConfigError::Invalid {
                    key: "MINDEASE_CRISIS_RESOURCES",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?,
            None => defaults.crisis_resources,
        };

        Ok(EngineConfig {
            entitlement_ttl: secs_or(&get, "MINDEASE_ENTITLEMENT_TTL_SECS", defaults.entitlement_ttl)?,
            entitlement_fetch_timeout: millis_or(
                &get,
                "MINDEASE_ENTITLEMENT_FETCH_TIMEOUT_MS",
                defaults.entitlement_fetch_timeout,
            )?,
            ledger_max_attempts: parse_or(
                &get,
                "MINDEASE_LEDGER_MAX_ATTEMPTS",
                defaults.ledger_max_attempts,
            )?
            .max(1),
            webhook_secret: get("MINDEASE_WEBHOOK_SECRET"),
            risk,
            crisis_debounce: secs_or(&get, "MINDEASE_CRISIS_DEBOUNCE_SECS", defaults.crisis_debounce)?,
            escalation_retry: RetryPolicy {
                max_attempts: parse_or(
                    &get,
                    "MINDEASE_ESCALATION_MAX_ATTEMPTS",
                    defaults.escalation_retry.max_attempts,
                )?
                .max(1),
                ..defaults.escalation_retry
            },
            breaker: BreakerConfig {
                failure_threshold: parse_or(
                    &get,
                    "MINDEASE_BREAKER_FAILURE_THRESHOLD",
                    defaults.breaker.failure_threshold,
                )?
                .max(1),
                failure_window: secs_or(
                    &get,
                    "MINDEASE_BREAKER_WINDOW_SECS",
                    defaults.breaker.failure_window,
                )?,
                cooldown: secs_or(&get, "MINDEASE_BREAKER_COOLDOWN_SECS", defaults.breaker.cooldown)?,
                trial_timeout: secs_or(
                    &get,
                    "MINDEASE_BREAKER_TRIAL_TIMEOUT_SECS",
                    defaults.breaker.trial_timeout,
                )?,
            },
            default_strategy: get("MINDEASE_SELECTION_STRATEGY")
                .map(|raw| SelectionStrategy::parse(&raw))
                .unwrap_or(defaults.default_strategy),
            backend_timeout: millis_or(&get, "MINDEASE_BACKEND_TIMEOUT_MS", defaults.backend_timeout)?,
            cloud,
            local,
            crisis_resources,
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn millis_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = config_from(&[]).expect("defaults should be valid");
        assert_eq!(config.entitlement_ttl, Duration::from_secs(300));
        assert_eq!(config.crisis_debounce, Duration::from_secs(60));
        assert_eq!(config.default_strategy, SelectionStrategy::UserPreference);
        assert!(config.cloud.is_none());
        assert!(config.local.is_none());
        assert_eq!(config.crisis_resources.len(), 2);
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("MINDEASE_ENTITLEMENT_TTL_SECS", "30"),
            ("MINDEASE_CRISIS_DEBOUNCE_SECS", "120"),
            ("MINDEASE_SELECTION_STRATEGY", "round_robin"),
            ("MINDEASE_BREAKER_COOLDOWN_SECS", "5"),
            ("MINDEASE_BREAKER_TRIAL_TIMEOUT_SECS", "12"),
            ("MINDEASE_CLOUD_URL", "https://api.example.test/v1"),
            ("MINDEASE_LOCAL_URL", "http://127.0.0.1:8000"),
        ])
        .expect("config should parse");
        assert_eq!(config.entitlement_ttl, Duration::from_secs(30));
        assert_eq!(config.crisis_debounce, Duration::from_secs(120));
        assert_eq!(config.default_strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(5));
        assert_eq!(config.breaker.trial_timeout, Duration::from_secs(12));
        assert_eq!(
            config.cloud.map(|c| c.model),
            Some("gpt-4o-mini".to_string())
        );
        assert_eq!(
            config.local.map(|l| l.url),
            Some("http://127.0.0.1:8000".to_string())
        );
    }

    #[test]
    fn unknown_strategy_falls_back_instead_of_failing() {
        let config = config_from(&[("MINDEASE_SELECTION_STRATEGY", "cheapest")])
            .expect("unknown strategy is not an error");
        assert_eq!(config.default_strategy, SelectionStrategy::UserPreference);
    }

    #[test]
    fn malformed_numbers_and_thresholds_are_rejected() {
        assert!(matches!(
            config_from(&[("MINDEASE_ENTITLEMENT_TTL_SECS", "five")]),
            Err(ConfigError::Invalid { key: "MINDEASE_ENTITLEMENT_TTL_SECS", .. })
        ));
        assert!(matches!(
            config_from(&[("MINDEASE_RISK_HIGH", "0.2")]),
            Err(ConfigError::Thresholds(_))
        ));
    }
}
