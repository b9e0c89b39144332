//! Forwarding completed work to other pools based on output values.
//!
//! A forward action maps each possible output value to a destination: a
//! target pool, another action, the `accept`/`reject` keywords, a list
//! combining acceptance with a forward, or null to drop the output.

use crate::actions::{value_key, AssignmentEvent, WorkRecord};
use crate::config::{ForwardConfig, RouteValue};
use crate::platform::types::Task;
use anyhow::{bail, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Destination parsed from one `on_result` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Accept,
    Reject,
    Ignore,
    Forward(String),
    AcceptAndForward(String),
    RejectAndForward(String),
}

impl Route {
    /// Name of the task or action this route forwards to, if any.
    pub fn forward_target(&self) -> Option<&str> {
        match self {
            Route::Forward(name)
            | Route::AcceptAndForward(name)
            | Route::RejectAndForward(name) => Some(name),
            _ => None,
        }
    }

    fn accepts(&self) -> bool {
        matches!(self, Route::Accept | Route::AcceptAndForward(_))
    }

    fn rejects(&self) -> bool {
        matches!(self, Route::Reject | Route::RejectAndForward(_))
    }
}

/// A pool a route can create tasks in, resolved after provisioning.
#[derive(Debug, Clone)]
pub struct PoolTarget {
    pub name: String,
    pub pool_id: String,
    pub blocklist: Vec<String>,
}

/// Where a forwarded output ultimately lands.
#[derive(Debug, Clone)]
pub enum ResolvedDestination {
    Pool(PoolTarget),
    /// Index of a chained action in the pipeline.
    Action(usize),
}

/// An accept or reject decision for one source assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub assignment_id: String,
    pub public_comment: String,
}

/// Everything one routing pass decided; executed by the pipeline.
#[derive(Debug, Default)]
pub struct RoutePlan {
    pub accepts: Vec<Acceptance>,
    pub rejects: Vec<Acceptance>,
    pub new_tasks: Vec<Task>,
    /// Records handed on to chained actions, by action index.
    pub chained: Vec<(usize, WorkRecord)>,
    pub ignored: usize,
}

impl RoutePlan {
    pub fn is_empty(&self) -> bool {
        self.accepts.is_empty()
            && self.rejects.is_empty()
            && self.new_tasks.is_empty()
            && self.chained.is_empty()
    }
}

/// The forward action.
#[derive(Debug, Clone)]
pub struct Forward {
    pub name: String,
    /// Output variable the routes key on.
    data: String,
    routes: BTreeMap<String, Route>,
    messages: BTreeMap<String, String>,
}

impl Forward {
    /// Parse and validate a forward configuration. Outputs that accept or
    /// reject work must come with worker-facing messages.
    pub fn new(config: ForwardConfig) -> Result<Self> {
        let mut routes = BTreeMap::new();

        for (output, value) in &config.on_result {
            let route = parse_route(&config.name, output, value)?;
            routes.insert(output.clone(), route);
        }

        let missing: Vec<&String> = routes
            .iter()
            .filter(|(_, route)| route.accepts() || route.rejects())
            .map(|(output, _)| output)
            .filter(|output| !config.messages.contains_key(*output))
            .collect();

        if !missing.is_empty() {
            bail!(
                "Forward action {} accepts or rejects the outputs {} but defines no \
                 messages for them; add them under the top-level key 'messages'",
                config.name,
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Ok(Self {
            name: config.name,
            data: config.data,
            routes,
            messages: config.messages,
        })
    }

    /// Names of every task or action the routes forward to.
    pub fn forward_target_names(&self) -> Vec<&str> {
        self.routes
            .values()
            .filter_map(Route::forward_target)
            .collect()
    }

    /// Route a batch of assignment events. Every task/solution pair of each
    /// assignment is routed by its output value.
    pub fn plan_for_events(
        &self,
        events: &[AssignmentEvent],
        targets: &HashMap<String, ResolvedDestination>,
    ) -> RoutePlan {
        let mut plan = RoutePlan::default();

        for event in events {
            for (task, solution) in event.assignment.pairs() {
                let Some(output) = solution.output_values.get(&self.data) else {
                    warn!(
                        "Assignment {} has no output '{}'; not forwarding",
                        event.assignment.id, self.data
                    );
                    continue;
                };

                let mut input_values = task.input_values.clone();
                input_values
                    .entry("assignment_id".to_string())
                    .or_insert_with(|| Value::String(event.assignment.id.clone()));

                let record = WorkRecord {
                    input_values,
                    label: output.clone(),
                    message: self.messages.get(&value_key(output)).cloned().unwrap_or_default(),
                };

                self.route_record(record, targets, &mut plan);
            }
        }

        plan
    }

    /// Route records produced by an aggregate or verification action.
    pub fn plan_for_records(
        &self,
        records: &[WorkRecord],
        targets: &HashMap<String, ResolvedDestination>,
    ) -> RoutePlan {
        let mut plan = RoutePlan::default();
        for record in records {
            self.route_record(record.clone(), targets, &mut plan);
        }
        plan
    }

    fn route_record(
        &self,
        record: WorkRecord,
        targets: &HashMap<String, ResolvedDestination>,
        plan: &mut RoutePlan,
    ) {
        let key = value_key(&record.label);

        let Some(route) = self.routes.get(&key) else {
            debug!("No route configured in {} for output '{}'", self.name, key);
            plan.ignored += 1;
            return;
        };

        if route.accepts() || route.rejects() {
            let comment = if record.message.is_empty() {
                self.messages.get(&key).cloned().unwrap_or_default()
            } else {
                record.message.clone()
            };

            match record
                .input_values
                .get("assignment_id")
                .and_then(Value::as_str)
            {
                Some(assignment_id) => {
                    let acceptance = Acceptance {
                        assignment_id: assignment_id.to_string(),
                        public_comment: comment,
                    };
                    if route.accepts() {
                        plan.accepts.push(acceptance);
                    } else {
                        plan.rejects.push(acceptance);
                    }
                }
                None => warn!(
                    "Output '{}' should {} the source assignment, but the incoming \
                     data carries no assignment_id",
                    key,
                    if route.accepts() { "accept" } else { "reject" },
                ),
            }
        }

        match route {
            Route::Ignore => {
                debug!("Received an output '{}' configured to be dropped", key);
                plan.ignored += 1;
            }
            Route::Forward(name)
            | Route::AcceptAndForward(name)
            | Route::RejectAndForward(name) => match targets.get(name) {
                Some(ResolvedDestination::Pool(target)) => {
                    let mut input_values = record.input_values;
                    input_values.remove("assignment_id");
                    let mut task = Task::new(&target.pool_id, input_values);
                    task.unavailable_for = target.blocklist.clone();
                    plan.new_tasks.push(task);
                }
                Some(ResolvedDestination::Action(index)) => {
                    plan.chained.push((*index, record));
                }
                None => warn!(
                    "Forward action {} has no resolved destination named {}",
                    self.name, name
                ),
            },
            Route::Accept | Route::Reject => {}
        }
    }
}

fn parse_route(action: &str, output: &str, value: &Option<RouteValue>) -> Result<Route> {
    match value {
        None => Ok(Route::Ignore),
        Some(RouteValue::One(dest)) => Ok(match dest.as_str() {
            "accept" => Route::Accept,
            "reject" => Route::Reject,
            name => Route::Forward(name.to_string()),
        }),
        Some(RouteValue::Many(dests)) => {
            let accepts = dests.iter().any(|d| d == "accept");
            let rejects = dests.iter().any(|d| d == "reject");
            let forward: Vec<&String> = dests
                .iter()
                .filter(|d| *d != "accept" && *d != "reject")
                .collect();

            if accepts && rejects {
                bail!(
                    "Forward action {} cannot both accept and reject the output '{}'",
                    action,
                    output
                );
            }
            if forward.len() != 1 {
                bail!(
                    "Forward action {} must pair 'accept' or 'reject' with exactly one \
                     destination for the output '{}'",
                    action,
                    output
                );
            }

            let name = forward[0].clone();
            Ok(if accepts {
                Route::AcceptAndForward(name)
            } else if rejects {
                Route::RejectAndForward(name)
            } else {
                Route::Forward(name)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::types::{Assignment, AssignmentStatus, Solution};
    use crate::actions::EventType;
    use serde_json::json;

    fn forward_config(yaml: &str) -> ForwardConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn make_forward() -> Forward {
        Forward::new(forward_config(
            r#"
name: forward_detect
data: result
on_result:
  true: outline
  false: reject
  maybe:
messages:
  false: "The image was judged not to contain text."
"#,
        ))
        .unwrap()
    }

    fn targets() -> HashMap<String, ResolvedDestination> {
        let mut map = HashMap::new();
        map.insert(
            "outline".to_string(),
            ResolvedDestination::Pool(PoolTarget {
                name: "outline".to_string(),
                pool_id: "pool-2".to_string(),
                blocklist: vec!["banned-1".to_string()],
            }),
        );
        map
    }

    fn event(result: Value) -> AssignmentEvent {
        let mut task = Task::new("pool-1", BTreeMap::new());
        task.input_values
            .insert("url".to_string(), json!("https://example.com/a.png"));

        let mut solution = Solution::default();
        solution.output_values.insert("result".to_string(), result);

        AssignmentEvent {
            event_type: EventType::Submitted,
            assignment: Assignment {
                id: "assignment-1".to_string(),
                task_suite_id: None,
                pool_id: "pool-1".to_string(),
                user_id: "worker-1".to_string(),
                status: AssignmentStatus::Submitted,
                tasks: vec![task],
                solutions: vec![solution],
            },
        }
    }

    #[test]
    fn test_missing_messages_rejected() {
        let err = Forward::new(forward_config(
            r#"
name: forward_verify
data: verdict
on_result:
  correct: accept
  incorrect: reject
"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("messages"));
    }

    #[test]
    fn test_forward_event_creates_task_in_target_pool() {
        let forward = make_forward();
        let plan = forward.plan_for_events(&[event(json!(true))], &targets());

        assert_eq!(plan.new_tasks.len(), 1);
        assert_eq!(plan.new_tasks[0].pool_id, "pool-2");
        assert_eq!(plan.new_tasks[0].unavailable_for, vec!["banned-1"]);
        assert!(plan.new_tasks[0].input_values.get("assignment_id").is_none());
        assert!(plan.accepts.is_empty());
        assert!(plan.rejects.is_empty());
    }

    #[test]
    fn test_reject_route_uses_configured_message() {
        let forward = make_forward();
        let plan = forward.plan_for_events(&[event(json!(false))], &targets());

        assert_eq!(plan.rejects.len(), 1);
        assert_eq!(plan.rejects[0].assignment_id, "assignment-1");
        assert!(plan.rejects[0]
            .public_comment
            .contains("judged not to contain text"));
        assert!(plan.new_tasks.is_empty());
    }

    #[test]
    fn test_null_route_ignores_output() {
        let forward = make_forward();
        let plan = forward.plan_for_events(&[event(json!("maybe"))], &targets());

        assert!(plan.is_empty());
        assert_eq!(plan.ignored, 1);
    }

    #[test]
    fn test_multi_action_route() {
        let forward = Forward::new(forward_config(
            r#"
name: forward_verify
data: verdict
on_result:
  incorrect: [reject, fix]
messages:
  incorrect: "The outlines were judged incorrect."
"#,
        ))
        .unwrap();

        let mut targets = HashMap::new();
        targets.insert(
            "fix".to_string(),
            ResolvedDestination::Pool(PoolTarget {
                name: "fix".to_string(),
                pool_id: "pool-9".to_string(),
                blocklist: Vec::new(),
            }),
        );

        let record = WorkRecord {
            input_values: BTreeMap::from([
                ("assignment_id".to_string(), json!("assignment-7")),
                ("url".to_string(), json!("https://example.com/b.png")),
            ]),
            label: json!("incorrect"),
            message: "The outlines were judged incorrect.".to_string(),
        };

        let plan = forward.plan_for_records(&[record], &targets);
        assert_eq!(plan.rejects.len(), 1);
        assert_eq!(plan.new_tasks.len(), 1);
        assert_eq!(plan.new_tasks[0].pool_id, "pool-9");
    }

    #[test]
    fn test_chained_action_destination() {
        let forward = Forward::new(forward_config(
            r#"
name: forward_bool
data: result
on_result:
  true: separate
"#,
        ))
        .unwrap();

        let mut targets = HashMap::new();
        targets.insert("separate".to_string(), ResolvedDestination::Action(2));

        let plan = forward.plan_for_events(&[event(json!(true))], &targets);
        assert_eq!(plan.chained.len(), 1);
        assert_eq!(plan.chained[0].0, 2);
        assert!(plan.new_tasks.is_empty());
    }

    #[test]
    fn test_conflicting_multi_action_rejected() {
        let err = Forward::new(forward_config(
            r#"
name: bad
data: verdict
on_result:
  x: [accept, reject, pool]
messages:
  x: "msg"
"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("cannot both accept and reject"));
    }
}
