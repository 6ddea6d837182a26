//! Data-quality validation engine.
//!
//! Evaluates the active quality rules of a dataset against a staged table
//! and produces a [`QualityReport`]. Rules are independent: every active
//! rule sees the full input and all outcomes are reported in one pass, so a
//! single run surfaces every problem instead of the first one.

pub mod engine;
pub mod registry;

pub use engine::QualityEngine;
pub use registry::{CheckFn, CustomCheckRegistry};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::Criticality;
use crate::error::{DatacraftError, Result};

/// Whether a rule's failure ratio stayed within its tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleStatus {
    Passed,
    Failed,
}

/// The evaluated result of one quality rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub qc_id: i64,
    pub rule: String,
    pub column: String,
    pub criticality: Criticality,
    /// Rows the rule examined after applying its filter.
    pub total_rows: u64,
    pub failed_rows: u64,
    /// Failure percentage in `0.0..=100.0`; `0.0` when no rows matched.
    pub error_pct: f64,
    pub threshold_pct: Option<f64>,
    pub status: RuleStatus,
}

impl RuleOutcome {
    pub fn passed(&self) -> bool {
        self.status == RuleStatus::Passed
    }
}

/// Which criticality tiers halt a dataset when a rule of that tier fails.
///
/// The default blocks on `HIGH` only; lower tiers are recorded and logged
/// but do not stop the run. Embedders with stricter postures widen the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalityPolicy {
    blocking: BTreeSet<Criticality>,
}

impl Default for CriticalityPolicy {
    fn default() -> Self {
        Self {
            blocking: BTreeSet::from([Criticality::High]),
        }
    }
}

impl CriticalityPolicy {
    /// A policy that blocks on the given tiers.
    pub fn blocking_on(tiers: impl IntoIterator<Item = Criticality>) -> Self {
        Self {
            blocking: tiers.into_iter().collect(),
        }
    }

    pub fn blocks(&self, criticality: Criticality) -> bool {
        self.blocking.contains(&criticality)
    }
}

/// All rule outcomes for one dataset evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub dataset_id: i64,
    pub outcomes: Vec<RuleOutcome>,
}

impl QualityReport {
    /// True when every evaluated rule passed, regardless of criticality.
    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(RuleOutcome::passed)
    }

    /// Failed outcomes whose criticality the policy treats as blocking.
    pub fn blocking_failures(&self, policy: &CriticalityPolicy) -> Vec<&RuleOutcome> {
        self.outcomes
            .iter()
            .filter(|o| !o.passed() && policy.blocks(o.criticality))
            .collect()
    }

    /// Returns an error for the worst blocking failure, if any.
    ///
    /// The worst failure is the one with the highest error percentage, so
    /// the surfaced message names the most damaged column.
    pub fn enforce(&self, policy: &CriticalityPolicy) -> Result<()> {
        let worst = self
            .blocking_failures(policy)
            .into_iter()
            .max_by(|a, b| a.error_pct.total_cmp(&b.error_pct));
        match worst {
            Some(outcome) => Err(DatacraftError::QualityViolation {
                dataset_id: self.dataset_id,
                rule: outcome.rule.clone(),
                error_pct: outcome.error_pct,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(rule: &str, criticality: Criticality, error_pct: f64) -> RuleOutcome {
        RuleOutcome {
            qc_id: 1,
            rule: rule.to_string(),
            column: "region".to_string(),
            criticality,
            total_rows: 100,
            failed_rows: error_pct as u64,
            error_pct,
            threshold_pct: Some(0.0),
            status: if error_pct > 0.0 {
                RuleStatus::Failed
            } else {
                RuleStatus::Passed
            },
        }
    }

    #[test]
    fn default_policy_blocks_high_only() {
        let report = QualityReport {
            dataset_id: 7,
            outcomes: vec![
                outcome("not-null:region", Criticality::Medium, 12.0),
                outcome("uniqueness:id", Criticality::Low, 3.0),
            ],
        };
        let policy = CriticalityPolicy::default();
        assert!(!report.all_passed());
        assert!(report.blocking_failures(&policy).is_empty());
        assert!(report.enforce(&policy).is_ok());
    }

    #[test]
    fn enforce_surfaces_worst_blocking_failure() {
        let report = QualityReport {
            dataset_id: 7,
            outcomes: vec![
                outcome("not-null:region", Criticality::High, 6.0),
                outcome("length:code", Criticality::High, 18.0),
            ],
        };
        let err = report.enforce(&CriticalityPolicy::default()).unwrap_err();
        match err {
            DatacraftError::QualityViolation { rule, error_pct, .. } => {
                assert_eq!(rule, "length:code");
                assert!((error_pct - 18.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn widened_policy_blocks_medium() {
        let report = QualityReport {
            dataset_id: 7,
            outcomes: vec![outcome("not-null:region", Criticality::Medium, 12.0)],
        };
        let policy = CriticalityPolicy::blocking_on([Criticality::High, Criticality::Medium]);
        assert_eq!(report.blocking_failures(&policy).len(), 1);
        assert!(report.enforce(&policy).is_err());
    }
}
