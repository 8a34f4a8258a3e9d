use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::limits::{LimitSource, RiskLimitSet};
use crate::request::{FailureReason, RequestId, RequestState};

/// Latency tier a request is validated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationTier {
    Fast,
    Comprehensive,
}

impl ValidationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationTier::Fast => "fast",
            ValidationTier::Comprehensive => "comprehensive",
        }
    }
}

impl fmt::Display for ValidationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a failed-check ratio in `[0, 1]` to a level.
    pub fn from_score(score: f64) -> Self {
        if score <= 0.0 {
            RiskLevel::Low
        } else if score <= 0.25 {
            RiskLevel::Medium
        } else if score <= 0.5 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

/// Outcome of one named check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub current: Option<Decimal>,
    pub limit: Option<Decimal>,
    pub message: String,
}

impl CheckOutcome {
    pub fn compare(name: &str, current: Decimal, limit: Decimal, label: &str) -> Self {
        let passed = current <= limit;
        Self {
            name: name.to_string(),
            passed,
            current: Some(current),
            limit: Some(limit),
            message: format!(
                "{label} {current} {} limit {limit}",
                if passed { "within" } else { "exceeds" }
            ),
        }
    }

    pub fn informational(name: &str, passed: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            current: None,
            limit: None,
            message: message.into(),
        }
    }
}

/// Structured answer to a validation request.
///
/// A failed check is a normal result (`passed == false` with reasons), not
/// an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub request_id: RequestId,
    pub strategy: String,
    pub symbol: String,
    pub tier: ValidationTier,
    pub passed: bool,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub checks: Vec<CheckOutcome>,
    pub limits_used: RiskLimitSet,
    pub limit_source: LimitSource,
    pub reasons: Vec<String>,
    pub recommendations: Vec<String>,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// What a caller sees when asking about a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending { state: RequestState },
    Completed { result: Box<ValidationResult> },
    Failed { reason: FailureReason },
    Unknown,
}

impl ValidationStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ValidationStatus::Pending { .. })
    }

    pub fn result(&self) -> Option<&ValidationResult> {
        match self {
            ValidationStatus::Completed { result } => Some(result),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn risk_level_thresholds() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.2), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.25), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.5), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.75), RiskLevel::Critical);
    }

    #[test]
    fn compare_check_message() {
        let ok = CheckOutcome::compare("leverage_check", dec!(1.5), dec!(2), "Leverage");
        assert!(ok.passed);
        assert!(ok.message.contains("within"));

        let bad = CheckOutcome::compare("leverage_check", dec!(3), dec!(2), "Leverage");
        assert!(!bad.passed);
        assert!(bad.message.contains("exceeds"));
    }

    #[test]
    fn status_serializes_with_tag() {
        let status = ValidationStatus::Pending {
            state: RequestState::Queued,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["state"], "QUEUED");
    }
}
