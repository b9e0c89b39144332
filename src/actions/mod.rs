//! Routing actions applied to completed assignments.
//!
//! Actions are pure planners: they turn assignment events or upstream
//! records into accept/reject decisions and new tasks, and the pipeline
//! executes the resulting plans against the platform.

pub mod aggregate;
pub mod forward;
pub mod separate;
pub mod verify;

pub use aggregate::Aggregate;
pub use forward::{Forward, PoolTarget, ResolvedDestination, RoutePlan};
pub use separate::SeparateBboxes;
pub use verify::VerifyPolygon;

use crate::platform::types::Assignment;
use serde_json::Value;
use std::collections::BTreeMap;

/// Status transition observed on an assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Submitted,
    Accepted,
    Rejected,
}

/// An assignment together with the transition that surfaced it.
#[derive(Debug, Clone)]
pub struct AssignmentEvent {
    pub event_type: EventType,
    pub assignment: Assignment,
}

/// A unit of routed work produced by aggregation or verification: the
/// original inputs, the label that selects the route and a worker-facing
/// message used when the route accepts or rejects the source assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkRecord {
    pub input_values: BTreeMap<String, Value>,
    pub label: Value,
    pub message: String,
}

/// Stringify an output value the way routing tables key on it.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_key_normalization() {
        assert_eq!(value_key(&json!(true)), "true");
        assert_eq!(value_key(&json!("correct")), "correct");
        assert_eq!(value_key(&json!(3)), "3");
    }
}
