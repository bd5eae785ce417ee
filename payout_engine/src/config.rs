//! Engine configuration.
//!
//! Fee tiers, payout limits and retry budgets are data, not code.  They
//! are stored in a JSON file whose path is usually supplied through the
//! `PAYOUT_CONFIG_PATH` environment variable; any field missing from
//! the file falls back to its default.

use crate::error::PayoutError;
use crate::fees::FeeSchedule;
use crate::models::{Money, PayoutType, PayrollSettings};
use anyhow::{Context, Result};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bounds per payout type.  `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayoutLimits {
    pub standard: Option<Money>,
    pub same_day: Option<Money>,
    pub instant: Option<Money>,
}

impl Default for PayoutLimits {
    fn default() -> Self {
        Self {
            standard: None,
            same_day: None,
            instant: Some(dec!(10000.00)),
        }
    }
}

impl PayoutLimits {
    pub fn for_type(&self, payout_type: PayoutType) -> Option<Money> {
        match payout_type {
            PayoutType::Standard => self.standard,
            PayoutType::SameDay => self.same_day,
            PayoutType::Instant => self.instant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// ISO currency code passed to the transfer provider.
    pub currency: String,
    pub fees: FeeSchedule,
    pub minimum_payout: Money,
    pub payout_limits: PayoutLimits,
    /// How many times a wallet write is retried after a version conflict.
    pub max_conflict_retries: u32,
    pub provider_timeout_secs: u64,
    /// Payroll policy for landlords without their own settings.
    pub payroll: PayrollSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: "usd".to_string(),
            fees: FeeSchedule::default(),
            minimum_payout: dec!(1.00),
            payout_limits: PayoutLimits::default(),
            max_conflict_retries: 3,
            provider_timeout_secs: 30,
            payroll: PayrollSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), PayoutError> {
        self.fees.validate()?;
        crate::payroll::validate_settings(&self.payroll)?;
        if self.minimum_payout <= Money::ZERO {
            return Err(PayoutError::InvalidConfig(
                "minimum_payout must be positive".into(),
            ));
        }
        if self.max_conflict_retries == 0 {
            return Err(PayoutError::InvalidConfig(
                "max_conflict_retries must be at least 1".into(),
            ));
        }
        if self.provider_timeout_secs == 0 {
            return Err(PayoutError::InvalidConfig(
                "provider_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Load and validate the engine configuration from a JSON file.
///
/// A missing file is not an error: the defaults are returned so that a
/// local server starts without any setup.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let config = if path.is_file() {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str::<EngineConfig>(&data)
            .with_context(|| format!("parsing config {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        EngineConfig::default()
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OvertimeRule;

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"fees": {"platform_fee_percent": "0"}, "payroll": {"overtime_rule": {"period": "daily", "threshold_hours": "8"}}}"#,
        )
        .unwrap();
        assert_eq!(config.fees.platform_fee_percent, dec!(0));
        assert_eq!(config.fees.same_day_flat_fee, dec!(1.50));
        assert_eq!(config.payroll.overtime_rule, OvertimeRule::Daily(dec!(8)));
        assert_eq!(config.minimum_payout, dec!(1.00));
        assert_eq!(config.max_conflict_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_multiplier_is_rejected() {
        let mut config = EngineConfig::default();
        config.payroll.overtime_multiplier = dec!(3.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/payout.json")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_limits_per_type() {
        let limits = PayoutLimits::default();
        assert_eq!(limits.for_type(PayoutType::Standard), None);
        assert_eq!(limits.for_type(PayoutType::Instant), Some(dec!(10000.00)));
    }
}
