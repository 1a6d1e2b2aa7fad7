//! A hand-rolled status condition, shared by `Sandbox`, `SandboxClaim`, and
//! `SandboxWarmPool` statuses.
//!
//! `k8s-openapi` 0.21 has no generic `metav1.Condition` type usable as a
//! CRD status field here, so this mirrors the upstream shape directly
//! (type/status/reason/message/lastTransitionTime/observedGeneration), the
//! way `examples/other_examples/.../h2o-kubernetes__operator-src-deployment-crd.rs.rs`
//! rolls its own `Condition`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(b: bool) -> Self {
        if b { ConditionStatus::True } else { ConditionStatus::False }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Build a `Ready` condition, preserving `last_transition_time` from
    /// `previous` when the status hasn't flipped (k8s convention: the
    /// timestamp only moves when `status` itself changes).
    pub fn ready(
        status: bool,
        reason: &str,
        message: String,
        observed_generation: Option<i64>,
        previous: Option<&Condition>,
        now: DateTime<Utc>,
    ) -> Condition {
        let status = ConditionStatus::from_bool(status);
        let last_transition_time = match previous {
            Some(p) if p.type_ == READY && p.status == status => p.last_transition_time,
            _ => Some(now),
        };
        Condition {
            type_: READY.to_string(),
            status,
            reason: Some(reason.to_string()),
            message: Some(message),
            last_transition_time,
            observed_generation,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
        conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Sort conditions by `type` for a stable, order-independent semantic diff.
pub fn sorted(mut conditions: Vec<Condition>) -> Vec<Condition> {
    conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
    conditions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn ready_true_builds_true_status() {
        let c = Condition::ready(true, "DependenciesReady", "ok".into(), Some(3), None, t(100));
        assert!(c.is_true());
        assert_eq!(c.reason.as_deref(), Some("DependenciesReady"));
        assert_eq!(c.observed_generation, Some(3));
        assert_eq!(c.last_transition_time, Some(t(100)));
    }

    #[test]
    fn transition_time_preserved_when_status_unchanged() {
        let first = Condition::ready(false, "DependenciesNotReady", "a".into(), None, None, t(1));
        let second = Condition::ready(
            false,
            "DependenciesNotReady",
            "b".into(),
            None,
            Some(&first),
            t(2),
        );
        assert_eq!(second.last_transition_time, Some(t(1)));
        assert_eq!(second.message.as_deref(), Some("b"));
    }

    #[test]
    fn transition_time_updates_when_status_flips() {
        let first = Condition::ready(false, "DependenciesNotReady", "a".into(), None, None, t(1));
        let second = Condition::ready(true, "DependenciesReady", "b".into(), None, Some(&first), t(2));
        assert_eq!(second.last_transition_time, Some(t(2)));
    }

    #[test]
    fn find_locates_by_type() {
        let conditions = vec![Condition::ready(true, "R", "m".into(), None, None, t(0))];
        assert!(Condition::find(&conditions, READY).is_some());
        assert!(Condition::find(&conditions, "Other").is_none());
    }

    #[test]
    fn sorted_orders_by_type() {
        let a = Condition {
            type_: "Zeta".into(),
            status: ConditionStatus::True,
            reason: None,
            message: None,
            last_transition_time: None,
            observed_generation: None,
        };
        let b = Condition {
            type_: "Alpha".into(),
            ..a.clone()
        };
        let sorted = sorted(vec![a, b]);
        assert_eq!(sorted[0].type_, "Alpha");
        assert_eq!(sorted[1].type_, "Zeta");
    }
}
