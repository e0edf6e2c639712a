use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::risk::RiskLevel;

/// How the provider selector picks a backend for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionStrategy {
    #[default]
    UserPreference,
    Auto,
    RoundRobin,
}

impl SelectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionStrategy::UserPreference => "USER_PREFERENCE",
            SelectionStrategy::Auto => "AUTO",
            SelectionStrategy::RoundRobin => "ROUND_ROBIN",
        }
    }

    /// Parse a strategy name. Unrecognized input is not an error: it yields
    /// `UserPreference`, the safe default.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "AUTO" => SelectionStrategy::Auto,
            "ROUND_ROBIN" | "ROUNDROBIN" => SelectionStrategy::RoundRobin,
            _ => SelectionStrategy::UserPreference,
        }
    }
}

/// What the request needs from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Plain conversational answer; any backend will do.
    #[default]
    Standard,
    /// Retrieval-augmented answering and local risk modeling (premium-only).
    Advanced,
}

impl Capability {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "advanced" | "premium" | "rag" => Capability::Advanced,
            _ => Capability::Standard,
        }
    }
}

/// Service tier of a chat backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendTier {
    /// Cloud backend available to every user.
    Baseline,
    /// Advanced backend reserved for entitled users.
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Citation {
    pub title: String,
    pub source: String,
    #[serde(default)]
    pub relevance: Option<f64>,
}

/// What a backend returned for one chat call. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatBackendResponse {
    pub reply: String,
    /// Categorical safety label as reported by the backend (may be absent)
    pub safety_label: Option<String>,
    /// Continuous risk score, expected in [0, 1] (may be absent or malformed)
    pub risk_score: Option<f64>,
    pub citations: Vec<Citation>,
    pub model_used: String,
}

/// Body of `POST /v1/chat`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatRequest {
    pub message: String,
    /// "USER_PREFERENCE", "AUTO" or "ROUND_ROBIN"; unknown values fall back to USER_PREFERENCE
    #[serde(default)]
    pub strategy: Option<String>,
    /// Backend name to prefer ("cloud", "local")
    #[serde(default)]
    pub preferred_backend: Option<String>,
    /// "standard" (default) or "advanced"
    #[serde(default)]
    pub capability: Option<String>,
    /// Client-side message reference echoed into crisis records
    #[serde(default)]
    pub message_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChatMeta {
    /// Safety label reported by the backend ("unknown" when absent)
    pub safety: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    pub risk_level: RiskLevel,
    pub citations: Vec<Citation>,
    pub model_used: String,
    pub backend: String,
    /// True when a fallback backend served the request
    pub degraded: bool,
}

/// Helpline entry attached to high-risk replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CrisisResource {
    pub name: String,
    pub contact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ChatReply {
    pub reply: String,
    pub meta: ChatMeta,
    /// Set when the reply was classified HIGH or CRITICAL
    pub safety_banner: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub crisis_resources: Vec<CrisisResource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parse_falls_back_to_user_preference() {
        assert_eq!(SelectionStrategy::parse("auto"), SelectionStrategy::Auto);
        assert_eq!(SelectionStrategy::parse(" Round-Robin "), SelectionStrategy::RoundRobin);
        assert_eq!(SelectionStrategy::parse("ROUND_ROBIN"), SelectionStrategy::RoundRobin);
        assert_eq!(SelectionStrategy::parse("fastest"), SelectionStrategy::UserPreference);
        assert_eq!(SelectionStrategy::parse(""), SelectionStrategy::UserPreference);
    }

    #[test]
    fn strategy_names_round_trip_through_parse() {
        for strategy in [
            SelectionStrategy::UserPreference,
            SelectionStrategy::Auto,
            SelectionStrategy::RoundRobin,
        ] {
            assert_eq!(SelectionStrategy::parse(strategy.as_str()), strategy);
        }
    }

    #[test]
    fn capability_defaults_to_standard() {
        assert_eq!(Capability::parse("advanced"), Capability::Advanced);
        assert_eq!(Capability::parse("RAG"), Capability::Advanced);
        assert_eq!(Capability::parse("whatever"), Capability::Standard);
    }
}
