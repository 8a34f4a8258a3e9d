//! Validation checks, risk scoring and recommendations.

use chrono::Utc;
use rg_types::{
    CheckOutcome, ChecksConfig, RiskLevel, RiskRequest, TradePayload, ValidationResult,
    ValidationTier,
};
use rust_decimal::Decimal;

use crate::limits::EffectiveLimits;
use crate::signals::MarketSignals;

pub const POSITION_SIZE_CHECK: &str = "position_size_check";
pub const LEVERAGE_CHECK: &str = "leverage_check";
pub const STOP_LOSS_CHECK: &str = "stop_loss_check";
pub const PORTFOLIO_EXPOSURE_CHECK: &str = "portfolio_exposure_check";
pub const MARKET_CONDITION_CHECK: &str = "market_condition_check";
pub const CORRELATION_CHECK: &str = "correlation_check";

/// Position size, leverage and stop-loss against the effective limits.
pub fn essential_checks(payload: &TradePayload, limits: &EffectiveLimits) -> Vec<CheckOutcome> {
    let l = &limits.limits;
    vec![
        CheckOutcome::compare(
            POSITION_SIZE_CHECK,
            payload.position_size,
            l.max_position_size,
            "Position size",
        ),
        CheckOutcome::compare(LEVERAGE_CHECK, payload.leverage, l.max_leverage, "Leverage"),
        CheckOutcome::compare(STOP_LOSS_CHECK, payload.stop_loss, l.stop_loss, "Stop loss"),
    ]
}

/// Existing exposure plus the new position against the portfolio cap.
pub fn portfolio_exposure_check(
    current_exposure: Decimal,
    payload: &TradePayload,
    config: &ChecksConfig,
) -> CheckOutcome {
    CheckOutcome::compare(
        PORTFOLIO_EXPOSURE_CHECK,
        current_exposure + payload.position_size,
        config.max_portfolio_exposure,
        "Portfolio exposure",
    )
}

/// Volatility regime and liquidity. Passes when signals were unavailable.
pub fn market_condition_check(
    signals: Option<&MarketSignals>,
    config: &ChecksConfig,
) -> CheckOutcome {
    let Some(signals) = signals else {
        return CheckOutcome::informational(
            MARKET_CONDITION_CHECK,
            true,
            "Market signals unavailable, base limits applied",
        );
    };

    let ratio = signals.volatility.value().ratio().unwrap_or(Decimal::ONE);
    let liquidity = signals.liquidity.value().liquidity_score;

    if ratio > config.max_volatility_ratio {
        CheckOutcome {
            name: MARKET_CONDITION_CHECK.to_string(),
            passed: false,
            current: Some(ratio),
            limit: Some(config.max_volatility_ratio),
            message: format!(
                "Volatility ratio {ratio} exceeds limit {}",
                config.max_volatility_ratio
            ),
        }
    } else if liquidity < config.min_liquidity_score {
        CheckOutcome {
            name: MARKET_CONDITION_CHECK.to_string(),
            passed: false,
            current: Some(liquidity),
            limit: Some(config.min_liquidity_score),
            message: format!(
                "Liquidity score {liquidity} below minimum {}",
                config.min_liquidity_score
            ),
        }
    } else {
        CheckOutcome {
            name: MARKET_CONDITION_CHECK.to_string(),
            passed: true,
            current: Some(ratio),
            limit: Some(config.max_volatility_ratio),
            message: "Market conditions within limits".to_string(),
        }
    }
}

pub fn correlation_check(signals: Option<&MarketSignals>, config: &ChecksConfig) -> CheckOutcome {
    match signals {
        Some(signals) => CheckOutcome::compare(
            CORRELATION_CHECK,
            signals.correlation.value().portfolio_correlation,
            config.max_portfolio_correlation,
            "Portfolio correlation",
        ),
        None => CheckOutcome::informational(
            CORRELATION_CHECK,
            true,
            "Correlation data unavailable, base limits applied",
        ),
    }
}

/// Fraction of failed checks and the level it maps to.
pub fn risk_score(checks: &[CheckOutcome]) -> (f64, RiskLevel) {
    if checks.is_empty() {
        return (0.0, RiskLevel::Low);
    }
    let failed = checks.iter().filter(|c| !c.passed).count();
    let score = (failed as f64 / checks.len() as f64).min(1.0);
    (score, RiskLevel::from_score(score))
}

pub fn recommendations(checks: &[CheckOutcome], level: RiskLevel) -> Vec<String> {
    let mut out: Vec<String> = checks
        .iter()
        .filter(|c| !c.passed)
        .filter_map(|c| match c.name.as_str() {
            POSITION_SIZE_CHECK => Some("Reduce position size to comply with limits"),
            LEVERAGE_CHECK => Some("Reduce leverage to comply with limits"),
            STOP_LOSS_CHECK => Some("Adjust stop loss to comply with limits"),
            PORTFOLIO_EXPOSURE_CHECK => Some("Reduce portfolio exposure before adding positions"),
            MARKET_CONDITION_CHECK => Some("Wait for calmer or more liquid market conditions"),
            CORRELATION_CHECK => Some("Diversify away from correlated positions"),
            _ => None,
        })
        .map(str::to_string)
        .collect();

    match level {
        RiskLevel::High => out.push("Review risk parameters before proceeding".to_string()),
        RiskLevel::Critical => {
            out.push("Immediate action required - do not proceed with trade".to_string())
        }
        RiskLevel::Low | RiskLevel::Medium => {}
    }
    out
}

/// Assemble the final result for `request` from its check outcomes.
pub fn assess(
    request: &RiskRequest,
    tier: ValidationTier,
    checks: Vec<CheckOutcome>,
    limits: &EffectiveLimits,
    duration_ms: f64,
) -> ValidationResult {
    let (risk_score, risk_level) = risk_score(&checks);
    let reasons = checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.message.clone())
        .collect();
    let recommendations = recommendations(&checks, risk_level);

    ValidationResult {
        request_id: request.id,
        strategy: request.strategy.to_string(),
        symbol: request.symbol.clone(),
        tier,
        passed: checks.iter().all(|c| c.passed),
        risk_level,
        risk_score,
        checks,
        limits_used: limits.limits,
        limit_source: limits.source.clone(),
        reasons,
        recommendations,
        duration_ms,
        timestamp: Utc::now(),
    }
}
