//! Trust-gated communication permissions
//!
//! Translates an external trust evaluation into boolean communication
//! permissions using fixed thresholds. The scoring formula lives behind
//! the [`TrustEvaluator`] port; this gate only applies policy.

use std::sync::Arc;

use tracing::warn;

use crate::config::TrustThresholds;
use crate::ports::{TrustAction, TrustEvaluator};
use crate::types::{PermissionDecision, PersonId};

/// Derives communication permissions from trust evaluations
pub struct TrustGate {
    evaluator: Arc<dyn TrustEvaluator>,
    thresholds: TrustThresholds,
}

impl TrustGate {
    /// Create a gate over the given evaluator and thresholds
    pub fn new(evaluator: Arc<dyn TrustEvaluator>, thresholds: TrustThresholds) -> Self {
        Self {
            evaluator,
            thresholds,
        }
    }

    /// Communication permissions for a person.
    ///
    /// When the evaluator cannot be reached this returns
    /// [`PermissionDecision::Unknown`] rather than defaulting either
    /// way; the caller decides how to treat an unevaluated contact.
    pub async fn communication_permissions(&self, person: &PersonId) -> PermissionDecision {
        match self
            .evaluator
            .evaluate(person, TrustAction::Communication)
            .await
        {
            Ok(evaluation) => {
                PermissionDecision::Known(self.thresholds.permissions_for(evaluation.level))
            }
            Err(e) => {
                warn!(person = %person, error = %e, "Trust evaluator unavailable");
                PermissionDecision::Unknown
            }
        }
    }
}
