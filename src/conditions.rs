// Status conditions of a MachineFleet.
// Writes go through ConditionSet::set so repeated identical failures don't churn the status:
// an unchanged status+reason is a no-op, and lastTransitionTime only moves when the status does.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema)]
pub enum ConditionType {
    /// A pass is in progress
    Reconciling,
    /// The last pass recorded one or more failures
    Degraded,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    /// Machine readable reason code(s), comma separated
    #[serde(default)]
    pub reason: String,
    /// Human readable details
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    #[must_use]
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Condition {
        Condition {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn reconciling(active: bool) -> Condition {
        let status = if active {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        Condition::new(ConditionType::Reconciling, status, "", "")
    }

    pub fn healthy() -> Condition {
        Condition::new(ConditionType::Degraded, ConditionStatus::False, "", "")
    }

    pub fn degraded(reason: &str, message: &str) -> Condition {
        Condition::new(ConditionType::Degraded, ConditionStatus::True, reason, message)
    }
}

/// Ordered conditions, at most one per type. Most recently changed conditions sit at the end.
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, Default, JsonSchema)]
#[serde(transparent)]
pub struct ConditionSet(Vec<Condition>);

impl ConditionSet {
    pub fn get(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    pub fn set(&mut self, mut condition: Condition) {
        if let Some(current) = self.get(condition.condition_type) {
            if current.status == condition.status {
                if current.reason == condition.reason {
                    return;
                }
                condition.last_transition_time = current.last_transition_time;
            }
        }
        self.remove(condition.condition_type);
        self.0.push(condition);
    }

    pub fn remove(&mut self, condition_type: ConditionType) {
        self.0.retain(|c| c.condition_type != condition_type);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Condition>> for ConditionSet {
    fn from(conditions: Vec<Condition>) -> Self {
        let mut set = ConditionSet::default();
        for c in conditions {
            set.remove(c.condition_type);
            set.0.push(c);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn cond(t: ConditionType, s: ConditionStatus, reason: &str, message: &str, secs: i64) -> Condition {
        Condition {
            condition_type: t,
            status: s,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: at(secs),
        }
    }

    fn existing() -> ConditionSet {
        ConditionSet::from(vec![
            cond(ConditionType::Degraded, ConditionStatus::True, "", "", 0),
            cond(ConditionType::Reconciling, ConditionStatus::True, "Reason", "Message", 1),
        ])
    }

    #[test]
    fn get_missing_condition() {
        let set = ConditionSet::from(vec![cond(ConditionType::Degraded, ConditionStatus::True, "", "", 0)]);
        assert!(set.get(ConditionType::Reconciling).is_none());
        assert_eq!(set.get(ConditionType::Degraded).unwrap().status, ConditionStatus::True);
    }

    #[test]
    fn set_new_condition_appends() {
        let mut set = ConditionSet::from(vec![cond(ConditionType::Degraded, ConditionStatus::True, "", "", 0)]);
        let incoming = cond(ConditionType::Reconciling, ConditionStatus::True, "Reason", "Message", 1);
        set.set(incoming.clone());
        assert_eq!(set, existing());
        assert_eq!(set.iter().last(), Some(&incoming));
    }

    #[test]
    fn set_same_status_and_reason_is_noop() {
        let mut set = existing();
        set.set(cond(ConditionType::Reconciling, ConditionStatus::True, "Reason", "New Message", 2));
        assert_eq!(set, existing());
    }

    #[test]
    fn set_new_reason_keeps_transition_time() {
        let mut set = existing();
        set.set(cond(ConditionType::Reconciling, ConditionStatus::True, "New Reason", "New Message", 2));
        let c = set.get(ConditionType::Reconciling).unwrap();
        assert_eq!(c.reason, "New Reason");
        assert_eq!(c.message, "New Message");
        assert_eq!(c.last_transition_time, at(1));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn set_new_status_takes_incoming_time() {
        let mut set = existing();
        let incoming = cond(ConditionType::Reconciling, ConditionStatus::False, "New Reason", "New Message", 2);
        set.set(incoming.clone());
        assert_eq!(set.get(ConditionType::Reconciling), Some(&incoming));
    }

    #[test]
    fn changed_condition_moves_to_tail() {
        let mut set = existing();
        set.set(cond(ConditionType::Degraded, ConditionStatus::False, "", "", 3));
        let order: Vec<_> = set.iter().map(|c| c.condition_type).collect();
        assert_eq!(order, vec![ConditionType::Reconciling, ConditionType::Degraded]);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut set = existing();
        set.remove(ConditionType::Reconciling);
        assert_eq!(set.len(), 1);
        assert!(set.get(ConditionType::Reconciling).is_none());
        set.remove(ConditionType::Reconciling);
        assert_eq!(set.len(), 1);
        assert!(set.get(ConditionType::Degraded).is_some());
    }

    #[test]
    fn serializes_as_kubernetes_conditions() {
        let set = ConditionSet::from(vec![cond(ConditionType::Degraded, ConditionStatus::False, "", "", 0)]);
        let v = serde_json::to_value(&set).unwrap();
        assert_eq!(v[0]["type"], "Degraded");
        assert_eq!(v[0]["status"], "False");
        assert_eq!(v[0]["lastTransitionTime"], "1970-01-01T00:00:00Z");
    }
}
