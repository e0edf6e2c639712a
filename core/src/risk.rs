use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::chat::ChatBackendResponse;

/// Ordered risk category derived from a backend response.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::None => "NONE",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    pub fn from_db_value(value: &str) -> Self {
        match value {
            "NONE" => RiskLevel::None,
            "LOW" => RiskLevel::Low,
            "MEDIUM" => RiskLevel::Medium,
            "CRITICAL" => RiskLevel::Critical,
            _ => RiskLevel::High,
        }
    }

    /// Only HIGH and CRITICAL raise crisis flags.
    pub fn triggers_escalation(self) -> bool {
        self >= RiskLevel::High
    }
}

/// How a safety label contributes to the final level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelClass {
    Benign,
    Caution,
    Unsafe,
    Unrecognized,
}

impl LabelClass {
    pub fn of(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "safe" | "ok" | "benign" | "none" => LabelClass::Benign,
            "caution" | "elevated" | "concern" => LabelClass::Caution,
            "crisis" | "unsafe" | "high_risk" | "self_harm" => LabelClass::Unsafe,
            _ => LabelClass::Unrecognized,
        }
    }
}

/// Score cutoffs, each the lower bound of its band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
    /// Level used when the score or label is missing or malformed.
    pub fail_safe: RiskLevel,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        RiskThresholds {
            low: 0.10,
            medium: 0.40,
            high: 0.70,
            critical: 0.90,
            fail_safe: RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThresholdError {
    #[error("risk thresholds must lie in [0, 1] and be strictly increasing (got {0:?})")]
    NotIncreasing([f64; 4]),
    #[error("fail-safe risk level must not be NONE")]
    FailSafeIsNone,
}

impl RiskThresholds {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        let cutoffs = [self.low, self.medium, self.high, self.critical];
        let in_range = cutoffs.iter().all(|c| (0.0..=1.0).contains(c));
        let increasing = cutoffs.windows(2).all(|pair| pair[0] < pair[1]);
        if !in_range || !increasing {
            return Err(ThresholdError::NotIncreasing(cutoffs));
        }
        if self.fail_safe == RiskLevel::None {
            return Err(ThresholdError::FailSafeIsNone);
        }
        Ok(())
    }

    fn band(&self, score: f64) -> RiskLevel {
        if score < self.low {
            RiskLevel::None
        } else if score < self.medium {
            RiskLevel::Low
        } else if score < self.high {
            RiskLevel::Medium
        } else if score < self.critical {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

/// Combine a categorical label and a continuous score into one level.
///
/// Total over all inputs. A missing, non-finite or out-of-range score and a
/// missing or unknown label each contribute `fail_safe`; an unsafe label is
/// CRITICAL regardless of score. The result is the maximum contribution.
pub fn classify(label: Option<&str>, score: Option<f64>, thresholds: &RiskThresholds) -> RiskLevel {
    let from_score = match score {
        Some(s) if s.is_finite() && (0.0..=1.0).contains(&s) => thresholds.band(s),
        _ => thresholds.fail_safe,
    };
    let from_label = match label.map(LabelClass::of) {
        Some(LabelClass::Benign) => RiskLevel::None,
        Some(LabelClass::Caution) => RiskLevel::Medium,
        Some(LabelClass::Unsafe) => RiskLevel::Critical,
        Some(LabelClass::Unrecognized) | None => thresholds.fail_safe,
    };
    from_score.max(from_label)
}

pub fn classify_response(response: &ChatBackendResponse, thresholds: &RiskThresholds) -> RiskLevel {
    classify(
        response.safety_label.as_deref(),
        response.risk_score,
        thresholds,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(label: Option<&str>, score: Option<f64>) -> RiskLevel {
        classify(label, score, &RiskThresholds::default())
    }

    #[test]
    fn low_score_with_benign_label_is_none() {
        assert_eq!(level(Some("SAFE"), Some(0.05)), RiskLevel::None);
    }

    #[test]
    fn high_score_with_benign_label_is_at_least_high() {
        assert!(level(Some("safe"), Some(0.95)) >= RiskLevel::High);
        assert_eq!(level(Some("safe"), Some(0.75)), RiskLevel::High);
    }

    #[test]
    fn unsafe_label_is_critical_at_any_score() {
        for score in [0.0, 0.05, 0.5, 1.0] {
            assert_eq!(level(Some("CRISIS"), Some(score)), RiskLevel::Critical);
        }
        assert_eq!(level(Some("self-harm"), None), RiskLevel::Critical);
    }

    #[test]
    fn malformed_input_fails_safe_to_high() {
        assert_eq!(level(None, None), RiskLevel::High);
        assert_eq!(level(Some("safe"), None), RiskLevel::High);
        assert_eq!(level(Some("safe"), Some(f64::NAN)), RiskLevel::High);
        assert_eq!(level(Some("safe"), Some(1.7)), RiskLevel::High);
        assert_eq!(level(Some("safe"), Some(-0.2)), RiskLevel::High);
        assert_eq!(level(Some("???"), Some(0.05)), RiskLevel::High);
        assert_eq!(level(None, Some(0.05)), RiskLevel::High);
    }

    #[test]
    fn caution_label_floors_at_medium() {
        assert_eq!(level(Some("caution"), Some(0.05)), RiskLevel::Medium);
        assert_eq!(level(Some("caution"), Some(0.8)), RiskLevel::High);
    }

    #[test]
    fn score_bands_cover_the_unit_interval() {
        assert_eq!(level(Some("ok"), Some(0.0)), RiskLevel::None);
        assert_eq!(level(Some("ok"), Some(0.10)), RiskLevel::Low);
        assert_eq!(level(Some("ok"), Some(0.40)), RiskLevel::Medium);
        assert_eq!(level(Some("ok"), Some(0.70)), RiskLevel::High);
        assert_eq!(level(Some("ok"), Some(0.90)), RiskLevel::Critical);
        assert_eq!(level(Some("ok"), Some(1.0)), RiskLevel::Critical);
    }

    #[test]
    fn thresholds_must_increase_and_fail_safe_must_not_be_none() {
        assert!(RiskThresholds::default().validate().is_ok());
        let inverted = RiskThresholds {
            medium: 0.05,
            ..RiskThresholds::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(ThresholdError::NotIncreasing(_))
        ));
        let permissive = RiskThresholds {
            fail_safe: RiskLevel::None,
            ..RiskThresholds::default()
        };
        assert_eq!(permissive.validate(), Err(ThresholdError::FailSafeIsNone));
    }

    #[test]
    fn only_high_and_critical_trigger_escalation() {
        assert!(!RiskLevel::Medium.triggers_escalation());
        assert!(RiskLevel::High.triggers_escalation());
        assert!(RiskLevel::Critical.triggers_escalation());
        assert_eq!(RiskLevel::from_db_value("CRITICAL"), RiskLevel::Critical);
    }
}
