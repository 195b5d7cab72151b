// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Errors returned from sync functions.
//!
//! A sync function reports everything through one [`SyncError`]. Besides
//! opaque failures it can carry typed [`ConditionError`]s naming the operator
//! condition they should surface as, and any mix of those can be combined
//! with [`SyncError::aggregate`] and taken apart again by the condition
//! helpers.

use thiserror::Error;

use crate::conditions::{ConditionKind, ConditionStatus, OperatorClientError, OperatorCondition};

/// Error returned by a sync pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Asks for another pass through the rate-limited queue without
    /// reporting a failure.
    #[error("synthetic requeue request")]
    SyntheticRequeue,

    /// A failure tied to a specific operator condition.
    #[error(transparent)]
    Condition(#[from] ConditionError),

    /// Several failures from one pass.
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<SyncError>),

    /// A condition type was surfaced that the controller never declared.
    #[error("unknown condition type {condition_type:?}")]
    UnknownConditionType {
        /// The undeclared condition type.
        condition_type: String,
        /// The error that surfaced it.
        #[source]
        source: Box<SyncError>,
    },

    /// Writing operator conditions failed.
    #[error("unable to update operator status: {0}")]
    StatusUpdate(#[source] OperatorClientError),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_aggregate(errors: &[SyncError]) -> String {
    match errors {
        [single] => single.to_string(),
        _ => {
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            format!("[{}]", messages.join(", "))
        }
    }
}

impl SyncError {
    /// Combines errors into one, flattening nested aggregates.
    ///
    /// Returns `None` for an empty input and the error itself for a single one.
    pub fn aggregate(errors: impl IntoIterator<Item = SyncError>) -> Option<SyncError> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                SyncError::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(SyncError::Aggregate(flat)),
        }
    }

    /// Shorthand for an opaque error with the given message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        SyncError::Other(anyhow::Error::msg(message))
    }

    /// Returns true for [`SyncError::SyntheticRequeue`].
    pub fn is_synthetic_requeue(&self) -> bool {
        matches!(self, SyncError::SyntheticRequeue)
    }

    /// Returns the typed condition errors carried by this error, looking
    /// through aggregates.
    pub fn condition_errors(&self) -> Vec<&ConditionError> {
        match self {
            SyncError::Condition(err) => vec![err],
            SyncError::Aggregate(errors) => {
                errors.iter().flat_map(SyncError::condition_errors).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// A failure that should surface as a specific operator condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConditionError {
    kind: ConditionKind,
    condition_type: String,
    reason: String,
    message: String,
}

impl ConditionError {
    fn new(
        kind: ConditionKind,
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            condition_type: condition_type.into(),
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Sets the Degraded-style `condition_type` to `True`.
    pub fn degraded(
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ConditionKind::Degraded, condition_type, reason, message)
    }

    /// Sets the Available-style `condition_type` to `False`.
    pub fn unavailable(
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ConditionKind::Available, condition_type, reason, message)
    }

    /// Sets the Upgradeable-style `condition_type` to `False`.
    pub fn not_upgradeable(
        condition_type: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ConditionKind::Upgradeable, condition_type, reason, message)
    }

    /// The condition family this error reports on.
    pub fn kind(&self) -> ConditionKind {
        self.kind
    }

    /// The condition type this error surfaces as.
    pub fn condition_type(&self) -> &str {
        &self.condition_type
    }

    /// Machine-readable reason for the condition.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Human-readable detail for the condition.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for errors built with [`ConditionError::degraded`].
    pub fn is_degraded_condition_error(&self) -> bool {
        self.kind == ConditionKind::Degraded
    }

    /// True for errors built with [`ConditionError::unavailable`].
    pub fn is_available_condition_error(&self) -> bool {
        self.kind == ConditionKind::Available
    }

    /// True for errors built with [`ConditionError::not_upgradeable`].
    pub fn is_upgradeable_condition_error(&self) -> bool {
        self.kind == ConditionKind::Upgradeable
    }

    /// The status this error puts its condition into.
    pub fn status(&self) -> ConditionStatus {
        self.kind.failing_status()
    }

    /// Builds the operator condition this error surfaces as.
    pub fn to_condition(&self) -> OperatorCondition {
        OperatorCondition::new(
            self.condition_type.clone(),
            self.status(),
            self.reason.clone(),
            self.message.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_flattens_and_collapses() {
        assert!(SyncError::aggregate(Vec::new()).is_none());

        let single = SyncError::aggregate(vec![SyncError::msg("only")]).unwrap();
        assert!(matches!(single, SyncError::Other(_)));
        assert_eq!(single.to_string(), "only");

        let nested = SyncError::aggregate(vec![
            SyncError::msg("a"),
            SyncError::Aggregate(vec![SyncError::msg("b"), SyncError::msg("c")]),
        ])
        .unwrap();
        match &nested {
            SyncError::Aggregate(errors) => assert_eq!(errors.len(), 3),
            other => panic!("expected aggregate, got {other:?}"),
        }
        assert_eq!(nested.to_string(), "[a, b, c]");
    }

    #[test]
    fn test_condition_errors_are_found_through_aggregates() {
        let err = SyncError::aggregate(vec![
            ConditionError::degraded("FirstOperatorDegraded", "Broken", "first").into(),
            SyncError::msg("plain"),
            ConditionError::unavailable("NotAvailable", "Down", "second").into(),
        ])
        .unwrap();

        let conditions = err.condition_errors();
        assert_eq!(conditions.len(), 2);
        assert!(conditions[0].is_degraded_condition_error());
        assert!(conditions[1].is_available_condition_error());
    }

    #[test]
    fn test_condition_error_polarity() {
        let degraded = ConditionError::degraded("OperatorDegraded", "Broken", "boom");
        assert_eq!(degraded.status(), ConditionStatus::True);
        assert_eq!(degraded.to_string(), "boom");

        let unavailable = ConditionError::unavailable("OperatorAvailable", "Down", "down");
        assert_eq!(unavailable.status(), ConditionStatus::False);

        let blocked = ConditionError::not_upgradeable("OperatorUpgradeable", "Pinned", "pinned");
        assert!(blocked.is_upgradeable_condition_error());
        assert_eq!(blocked.to_condition().status, ConditionStatus::False);
    }

    #[test]
    fn test_synthetic_requeue() {
        assert!(SyncError::SyntheticRequeue.is_synthetic_requeue());
        assert!(!SyncError::msg("real").is_synthetic_requeue());
    }
}
