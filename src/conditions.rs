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

//! Operator status conditions and the mapping from sync errors onto them.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::SyncError;

/// Reason set on conditions that are in their healthy state.
pub const REASON_AS_EXPECTED: &str = "AsExpected";

/// Reason set on the default Degraded condition when a sync pass fails.
pub const REASON_SYNC_ERROR: &str = "SyncError";

/// Suffix of Degraded-style condition types.
pub const DEGRADED_SUFFIX: &str = "Degraded";

/// Suffix of Available-style condition types.
pub const AVAILABLE_SUFFIX: &str = "Available";

/// Suffix of Upgradeable-style condition types.
pub const UPGRADEABLE_SUFFIX: &str = "Upgradeable";

/// Status of an operator condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// Not determined yet.
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// The family a condition type belongs to, which fixes its polarity.
///
/// Degraded conditions are healthy when `False`. Every other family is
/// healthy when `True`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    /// `*Degraded`: something is failing.
    Degraded,
    /// `*Available`: the operand is serving.
    Available,
    /// `*Upgradeable`: an upgrade is safe.
    Upgradeable,
    /// Any other type; treated as healthy when `True`.
    Other,
}

impl ConditionKind {
    /// Classifies a condition type by its suffix, e.g. `OperatorDegraded`.
    pub fn from_condition_type(condition_type: &str) -> Self {
        if condition_type.ends_with(DEGRADED_SUFFIX) {
            ConditionKind::Degraded
        } else if condition_type.ends_with(AVAILABLE_SUFFIX) {
            ConditionKind::Available
        } else if condition_type.ends_with(UPGRADEABLE_SUFFIX) {
            ConditionKind::Upgradeable
        } else {
            ConditionKind::Other
        }
    }

    /// Status of a condition of this kind when nothing is wrong.
    pub fn healthy_status(self) -> ConditionStatus {
        match self {
            ConditionKind::Degraded => ConditionStatus::False,
            _ => ConditionStatus::True,
        }
    }

    /// Status of a condition of this kind when it reports a problem.
    pub fn failing_status(self) -> ConditionStatus {
        match self {
            ConditionKind::Degraded => ConditionStatus::True,
            _ => ConditionStatus::False,
        }
    }
}

/// One named health signal on an operator's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    /// Condition type, e.g. `OperatorDegraded`.
    #[serde(rename = "type")]
    pub type_: String,

    /// Current status.
    pub status: ConditionStatus,

    /// Machine-readable reason, e.g. `AsExpected`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// When `status` last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl OperatorCondition {
    /// Creates a condition without a transition time; one is assigned when it is applied.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    /// The healthy default for `condition_type`.
    pub fn as_expected(condition_type: impl Into<String>) -> Self {
        let condition_type = condition_type.into();
        let status = ConditionKind::from_condition_type(&condition_type).healthy_status();
        Self::new(condition_type, status, REASON_AS_EXPECTED, "")
    }
}

/// Observed status of an operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStatus {
    /// Conditions in the order they were first set.
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,
}

/// Returns the condition of the given type, if present.
pub fn find_operator_condition<'a>(
    conditions: &'a [OperatorCondition],
    condition_type: &str,
) -> Option<&'a OperatorCondition> {
    conditions.iter().find(|c| c.type_ == condition_type)
}

/// Sets `new` in `conditions`, replacing any condition of the same type.
///
/// The transition time only moves when the status changes.
pub fn set_operator_condition(conditions: &mut Vec<OperatorCondition>, mut new: OperatorCondition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) if existing.status == new.status => {
            existing.reason = new.reason;
            existing.message = new.message;
        }
        Some(existing) => {
            new.last_transition_time = Some(Utc::now());
            *existing = new;
        }
        None => {
            if new.last_transition_time.is_none() {
                new.last_transition_time = Some(Utc::now());
            }
            conditions.push(new);
        }
    }
}

/// Errors returned by an [`OperatorClient`].
#[derive(Debug, Error)]
pub enum OperatorClientError {
    /// The operator resource does not exist.
    #[error("operator resource {0} not found")]
    NotFound(String),

    /// The update lost a resource version race and ran out of retries.
    #[error("conflict updating operator status: {0}")]
    Conflict(String),

    /// Any other client failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Access to the status of the operator resource a controller reports on.
///
/// Implementations are expected to retry resource version conflicts on
/// their own.
#[async_trait]
pub trait OperatorClient: Send + Sync {
    /// Returns the current operator status.
    async fn get_operator_status(&self) -> Result<OperatorStatus, OperatorClientError>;

    /// Applies all `conditions` in one status update and returns the new status.
    async fn apply_operator_conditions(
        &self,
        conditions: Vec<OperatorCondition>,
    ) -> Result<OperatorStatus, OperatorClientError>;
}

/// Returns the `<name>Degraded` condition type a controller reports on.
pub fn degraded_condition_type(controller_name: &str) -> String {
    format!("{controller_name}{DEGRADED_SUFFIX}")
}

/// Builds the Degraded condition reflecting one sync result.
///
/// Returns `None` for a synthetic requeue, which is not a failure.
pub fn sync_degraded_condition(
    condition_type: &str,
    result: &Result<(), SyncError>,
) -> Option<OperatorCondition> {
    match result {
        Ok(()) => Some(OperatorCondition::new(
            condition_type,
            ConditionStatus::False,
            REASON_AS_EXPECTED,
            "",
        )),
        Err(err) if err.is_synthetic_requeue() => None,
        Err(err) => Some(OperatorCondition::new(
            condition_type,
            ConditionStatus::True,
            REASON_SYNC_ERROR,
            err.to_string(),
        )),
    }
}

fn merge_condition(surfaced: &mut Vec<OperatorCondition>, condition: OperatorCondition) {
    match surfaced.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            existing.message = format!("{}\n{}", existing.message, condition.message);
        }
        None => surfaced.push(condition),
    }
}

fn collect_conditions(err: &SyncError, default_type: &str, surfaced: &mut Vec<OperatorCondition>) {
    match err {
        SyncError::SyntheticRequeue => {}
        SyncError::Condition(condition) => merge_condition(surfaced, condition.to_condition()),
        SyncError::Aggregate(errors) => {
            for err in errors {
                collect_conditions(err, default_type, surfaced);
            }
        }
        other => merge_condition(
            surfaced,
            OperatorCondition::new(
                default_type,
                ConditionStatus::True,
                REASON_SYNC_ERROR,
                other.to_string(),
            ),
        ),
    }
}

/// Translates the result of a sync pass into operator conditions and applies them.
///
/// Untyped failures set `<controller_name>Degraded` to `True`/`SyncError`;
/// typed [`ConditionError`](crate::errors::ConditionError)s set their own
/// condition. Every type in `known_condition_types` that the error does not
/// mention is reset to its healthy default with reason `AsExpected`.
///
/// A surfaced condition type missing from `known_condition_types` yields
/// [`SyncError::UnknownConditionType`] and nothing is applied. Otherwise the
/// sync result is handed back unchanged unless the status update fails.
pub async fn handle_error_conditions(
    client: &dyn OperatorClient,
    controller_name: &str,
    known_condition_types: &[&str],
    result: Result<(), SyncError>,
) -> Result<(), SyncError> {
    let mut updates = Vec::new();
    let result = match result {
        Ok(()) => Ok(()),
        Err(err) => {
            collect_conditions(&err, &degraded_condition_type(controller_name), &mut updates);
            if let Some(unknown) = updates
                .iter()
                .find(|c| !known_condition_types.contains(&c.type_.as_str()))
            {
                return Err(SyncError::UnknownConditionType {
                    condition_type: unknown.type_.clone(),
                    source: Box::new(err),
                });
            }
            Err(err)
        }
    };

    for condition_type in known_condition_types {
        if find_operator_condition(&updates, condition_type).is_none() {
            updates.push(OperatorCondition::as_expected(*condition_type));
        }
    }

    client
        .apply_operator_conditions(updates)
        .await
        .map_err(SyncError::StatusUpdate)?;

    result
}
