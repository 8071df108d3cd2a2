use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use autoledger_core::matching::AUTO_AMOUNT_DATE_THRESHOLD;
use autoledger_core::{LedgerError, MatchTolerance, RoutingThresholds, ScoringConfig, TenantId};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RETRY_PAUSE_MS: u64 = 1_000;
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Patterns that fall below this success rate after a miss are deactivated.
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.5;

/// What happens to an event whose handler failed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum FailurePolicy {
    /// Mark the event processed and keep the error on the event row.
    #[default]
    FailOpen,
    /// Return the event to the queue until `max_attempts`, then park it.
    DeadLetter { max_attempts: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub routing: RoutingThresholds,
    /// Per-tenant routing overrides.
    pub tenant_routing: BTreeMap<TenantId, RoutingThresholds>,
    pub scoring: ScoringConfig,
    pub matching: MatchTolerance,
    /// Bank matches at or above this confidence are reconciled without review.
    pub auto_reconcile_threshold: u8,
    pub min_success_rate: f64,
    pub failure_policy: FailurePolicy,
    pub poll_interval_ms: u64,
    pub retry_pause_ms: u64,
    pub batch_size: usize,
    pub handler_deadline_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            routing: RoutingThresholds::default(),
            tenant_routing: BTreeMap::new(),
            scoring: ScoringConfig::default(),
            matching: MatchTolerance::default(),
            auto_reconcile_threshold: AUTO_AMOUNT_DATE_THRESHOLD,
            min_success_rate: DEFAULT_MIN_SUCCESS_RATE,
            failure_policy: FailurePolicy::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            retry_pause_ms: DEFAULT_RETRY_PAUSE_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            handler_deadline_ms: None,
        }
    }
}

impl EngineConfig {
    /// Load and validate an engine configuration from a YAML file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|err| anyhow!("invalid engine config YAML structure: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`LedgerError::Configuration`] describing the first invalid
    /// setting.
    pub fn validate(&self) -> Result<(), LedgerError> {
        self.routing.validate()?;
        for (tenant, thresholds) in &self.tenant_routing {
            thresholds.validate().map_err(|err| {
                LedgerError::Configuration(format!("tenant_routing.{tenant}: {err}"))
            })?;
        }
        self.scoring.validate()?;
        self.matching.validate()?;

        if self.auto_reconcile_threshold > 100 {
            return Err(LedgerError::Configuration(
                "auto_reconcile_threshold MUST be in [0, 100]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(LedgerError::Configuration(
                "min_success_rate MUST be in [0, 1]".to_string(),
            ));
        }
        if let FailurePolicy::DeadLetter { max_attempts: 0 } = self.failure_policy {
            return Err(LedgerError::Configuration(
                "failure_policy.max_attempts MUST be >= 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(LedgerError::Configuration(
                "batch_size MUST be >= 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(LedgerError::Configuration(
                "poll_interval_ms MUST be >= 1".to_string(),
            ));
        }
        if self.handler_deadline_ms == Some(0) {
            return Err(LedgerError::Configuration(
                "handler_deadline_ms MUST be >= 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn thresholds_for(&self, tenant: &TenantId) -> RoutingThresholds {
        self.tenant_routing
            .get(tenant)
            .copied()
            .unwrap_or(self.routing)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    #[must_use]
    pub fn handler_deadline(&self) -> Option<Duration> {
        self.handler_deadline_ms.map(Duration::from_millis)
    }
}
