//! Aggregating overlapping answers when a pool closes.
//!
//! Votes are collected from submitted and accepted assignments that have
//! not been seen before, grouped per task item and reduced with the
//! configured method. The winning label and its configured message are
//! handed to a forward action as work records.

use crate::actions::{value_key, WorkRecord};
use crate::config::{AggregateConfig, AggregationMethod};
use crate::platform::types::{Assignment, AssignmentStatus};
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// One worker's answer for one task item.
#[derive(Debug, Clone)]
pub struct Vote {
    /// Stringified value of the item-identifying input variable.
    pub item: String,
    pub inputs: BTreeMap<String, Value>,
    pub label: Value,
    /// Submitting worker; skill-weighted methods would read this.
    #[allow(dead_code)]
    pub worker: String,
    pub assignment_id: String,
}

/// The aggregate action.
#[derive(Debug)]
pub struct Aggregate {
    pub name: String,
    pub source: String,
    pub forward: Option<String>,
    method: AggregationMethod,
    item_variable: String,
    label_variable: String,
    messages: BTreeMap<String, String>,
    seen_assignments: HashSet<String>,
    /// Set after the first successful aggregation run.
    pub complete: bool,
}

impl Aggregate {
    /// Validate the configuration; unsupported methods fail here, before
    /// any pool is touched.
    pub fn new(config: AggregateConfig) -> Result<Self> {
        if !config.method.is_supported() {
            bail!(
                "Aggregate action {} is configured with the method '{}', which needs an \
                 external statistical aggregation library and is not available; use \
                 'majority_vote'",
                config.name,
                config.method.as_str()
            );
        }

        Ok(Self {
            name: config.name,
            source: config.source,
            forward: config.forward,
            method: config.method,
            item_variable: config.data.input,
            label_variable: config.data.output,
            messages: config.messages,
            seen_assignments: HashSet::new(),
            complete: false,
        })
    }

    /// Extract votes from assignments not processed before. Only submitted
    /// and accepted work counts.
    pub fn collect(&mut self, assignments: &[Assignment]) -> Vec<Vote> {
        let mut votes = Vec::new();

        for assignment in assignments {
            if !matches!(
                assignment.status,
                AssignmentStatus::Submitted | AssignmentStatus::Accepted
            ) {
                continue;
            }
            if !self.seen_assignments.insert(assignment.id.clone()) {
                continue;
            }

            for (task, solution) in assignment.pairs() {
                let Some(item) = task.input_values.get(&self.item_variable) else {
                    debug!(
                        "Assignment {} is missing the input '{}'; skipping",
                        assignment.id, self.item_variable
                    );
                    continue;
                };
                let Some(label) = solution.output_values.get(&self.label_variable) else {
                    debug!(
                        "Assignment {} is missing the output '{}'; skipping",
                        assignment.id, self.label_variable
                    );
                    continue;
                };

                votes.push(Vote {
                    item: value_key(item),
                    inputs: task.input_values.clone(),
                    label: label.clone(),
                    worker: assignment.user_id.clone(),
                    assignment_id: assignment.id.clone(),
                });
            }
        }

        votes
    }

    /// Reduce votes to one record per item.
    pub fn aggregate(&self, votes: &[Vote]) -> Vec<WorkRecord> {
        match self.method {
            AggregationMethod::MajorityVote => self.majority_vote(votes),
            // Rejected in `new`.
            _ => unreachable!("unsupported aggregation method"),
        }
    }

    /// Plain majority vote; ties break towards the lexicographically
    /// smallest label key so reruns stay deterministic.
    fn majority_vote(&self, votes: &[Vote]) -> Vec<WorkRecord> {
        let mut items: BTreeMap<&str, Vec<&Vote>> = BTreeMap::new();
        for vote in votes {
            items.entry(&vote.item).or_default().push(vote);
        }

        let mut records = Vec::with_capacity(items.len());
        for item_votes in items.values() {
            let mut counts: HashMap<String, usize> = HashMap::new();
            let mut label_values: HashMap<String, &Value> = HashMap::new();

            for vote in item_votes {
                let key = value_key(&vote.label);
                *counts.entry(key.clone()).or_default() += 1;
                label_values.entry(key).or_insert(&vote.label);
            }

            let winner = counts
                .into_iter()
                .max_by(|(key_a, count_a), (key_b, count_b)| {
                    count_a.cmp(count_b).then(key_b.cmp(key_a))
                })
                .map(|(key, _)| key)
                .expect("an item group always holds at least one vote");

            let first = item_votes[0];
            let mut input_values = first.inputs.clone();
            input_values
                .entry("assignment_id".to_string())
                .or_insert_with(|| Value::String(first.assignment_id.clone()));

            records.push(WorkRecord {
                input_values,
                label: (*label_values[&winner]).clone(),
                message: self
                    .messages
                    .get(&winner)
                    .cloned()
                    .unwrap_or_else(|| "No reason was provided.".to_string()),
            });
        }

        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::types::{Solution, Task};
    use serde_json::json;

    fn aggregate_config(method: &str) -> AggregateConfig {
        serde_yaml::from_str(&format!(
            r#"
name: aggregate_detect
source: detect
method: {method}
forward: forward_detect
data:
  input: url
  output: result
messages:
  false: "The majority judged the image to contain no text."
"#
        ))
        .unwrap()
    }

    fn assignment(id: &str, worker: &str, url: &str, result: Value) -> Assignment {
        let mut task = Task::new("pool-1", BTreeMap::new());
        task.input_values.insert("url".to_string(), json!(url));

        let mut solution = Solution::default();
        solution.output_values.insert("result".to_string(), result);

        Assignment {
            id: id.to_string(),
            task_suite_id: None,
            pool_id: "pool-1".to_string(),
            user_id: worker.to_string(),
            status: AssignmentStatus::Submitted,
            tasks: vec![task],
            solutions: vec![solution],
        }
    }

    #[test]
    fn test_unsupported_method_rejected() {
        let err = Aggregate::new(aggregate_config("glad")).unwrap_err();
        assert!(err.to_string().contains("glad"));

        assert!(Aggregate::new(aggregate_config("majority_vote")).is_ok());
    }

    #[test]
    fn test_collect_skips_seen_assignments() {
        let mut aggregate = Aggregate::new(aggregate_config("majority_vote")).unwrap();

        let batch = vec![assignment("a1", "w1", "https://example.com/a.png", json!(true))];
        assert_eq!(aggregate.collect(&batch).len(), 1);
        assert_eq!(aggregate.collect(&batch).len(), 0);
    }

    #[test]
    fn test_collect_ignores_rejected_work() {
        let mut aggregate = Aggregate::new(aggregate_config("majority_vote")).unwrap();

        let mut rejected = assignment("a1", "w1", "https://example.com/a.png", json!(true));
        rejected.status = AssignmentStatus::Rejected;

        assert!(aggregate.collect(&[rejected]).is_empty());
    }

    #[test]
    fn test_majority_vote_per_item() {
        let mut aggregate = Aggregate::new(aggregate_config("majority_vote")).unwrap();

        let votes = aggregate.collect(&[
            assignment("a1", "w1", "https://example.com/a.png", json!(true)),
            assignment("a2", "w2", "https://example.com/a.png", json!(true)),
            assignment("a3", "w3", "https://example.com/a.png", json!(false)),
            assignment("a4", "w1", "https://example.com/b.png", json!(false)),
        ]);

        let records = aggregate.aggregate(&votes);
        assert_eq!(records.len(), 2);

        let a = records
            .iter()
            .find(|r| r.input_values["url"] == json!("https://example.com/a.png"))
            .unwrap();
        assert_eq!(a.label, json!(true));
        assert_eq!(a.message, "No reason was provided.");

        let b = records
            .iter()
            .find(|r| r.input_values["url"] == json!("https://example.com/b.png"))
            .unwrap();
        assert_eq!(b.label, json!(false));
        assert!(b.message.contains("no text"));
    }

    #[test]
    fn test_majority_vote_tie_is_deterministic() {
        let mut aggregate = Aggregate::new(aggregate_config("majority_vote")).unwrap();

        let votes = aggregate.collect(&[
            assignment("a1", "w1", "https://example.com/a.png", json!(true)),
            assignment("a2", "w2", "https://example.com/a.png", json!(false)),
        ]);

        let records = aggregate.aggregate(&votes);
        // "false" sorts before "true".
        assert_eq!(records[0].label, json!(false));
    }

    #[test]
    fn test_record_carries_assignment_id() {
        let mut aggregate = Aggregate::new(aggregate_config("majority_vote")).unwrap();

        let votes =
            aggregate.collect(&[assignment("a9", "w1", "https://example.com/a.png", json!(true))]);
        let records = aggregate.aggregate(&votes);
        assert_eq!(records[0].input_values["assignment_id"], json!("a9"));
    }
}
