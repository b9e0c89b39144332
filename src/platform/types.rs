//! Wire types for the platform REST API.
//!
//! These structs mirror the JSON documents the platform exchanges for
//! projects, pools, trainings, tasks, assignments, skills and analytics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Field types accepted by a task specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Url,
    Json,
    String,
    Boolean,
}

/// One input or output field of a task specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(kind: FieldKind) -> Self {
        Self { kind, required: true }
    }

    pub fn optional(kind: FieldKind) -> Self {
        Self { kind, required: false }
    }
}

impl From<crate::config::DataType> for FieldKind {
    fn from(value: crate::config::DataType) -> Self {
        match value {
            crate::config::DataType::Url => FieldKind::Url,
            crate::config::DataType::Json => FieldKind::Json,
            crate::config::DataType::Str => FieldKind::String,
            crate::config::DataType::Bool => FieldKind::Boolean,
        }
    }
}

/// Task interface and data specification attached to a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub input_spec: BTreeMap<String, FieldSpec>,
    pub output_spec: BTreeMap<String, FieldSpec>,
    pub view_spec: Value,
}

/// A remote project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub public_name: String,
    pub public_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_comment: Option<String>,
    pub task_spec: TaskSpec,
}

/// Pool lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    Open,
    Closed,
    Archived,
    Locked,
}

/// Why a pool was last closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Manual,
    Expired,
    Completed,
    NotEnoughBalance,
    AssignmentsLimitExceeded,
    Blocked,
}

/// Default settings applied to tasks uploaded to a pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolDefaults {
    pub default_overlap_for_new_task_suites: u32,
    pub default_overlap_for_new_tasks: u32,
}

impl From<crate::config::PoolDefaultsConfig> for PoolDefaults {
    fn from(value: crate::config::PoolDefaultsConfig) -> Self {
        Self {
            default_overlap_for_new_task_suites: value.default_overlap_for_new_task_suites,
            default_overlap_for_new_tasks: value.default_overlap_for_new_tasks,
        }
    }
}

/// Real/golden/training task counts per task suite.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MixerSpec {
    pub real_tasks_count: u32,
    pub golden_tasks_count: u32,
    pub training_tasks_count: u32,
}

impl From<crate::config::MixerConfig> for MixerSpec {
    fn from(value: crate::config::MixerConfig) -> Self {
        Self {
            real_tasks_count: value.real_tasks_count,
            golden_tasks_count: value.golden_tasks_count,
            training_tasks_count: value.training_tasks_count,
        }
    }
}

/// Speed/quality balance restricting pool access to the best workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeedQualityBalance {
    TopPercentageByQuality { percent: u32 },
    BestConcurrentUsersByQuality { count: u32 },
}

/// A remote pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub project_id: String,
    pub private_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_comment: Option<String>,
    pub may_contain_adult_content: bool,
    pub will_expire: DateTime<Utc>,
    pub reward_per_assignment: f64,
    pub assignment_max_duration_seconds: u32,
    #[serde(default)]
    pub auto_accept_solutions: bool,
    pub defaults: PoolDefaults,
    pub mixer_config: MixerSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub quality_control: QualityControl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_quality_balance: Option<SpeedQualityBalance>,
    /// Minimum skill earned in the linked training pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_requirement: Option<TrainingRequirementSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PoolStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_close_reason: Option<CloseReason>,

    /// Passthrough fields from the configuration's pool setup.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Pool {
    pub fn is_open(&self) -> bool {
        self.status == Some(PoolStatus::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.status, Some(PoolStatus::Closed) | Some(PoolStatus::Archived))
    }
}

/// Links a pool to its training pool and the passing skill threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRequirementSpec {
    pub training_pool_id: String,
    pub training_passing_skill_value: u32,
}

/// A remote training pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Training {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub project_id: String,
    pub private_name: String,
    pub may_contain_adult_content: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_tasks_in_task_suite_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle_tasks_in_task_suite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PoolStatus>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A known solution attached to a golden or training task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownSolution {
    pub output_values: BTreeMap<String, Value>,
}

/// A unit of work uploaded to a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub pool_id: String,
    pub input_values: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_solutions: Option<Vec<KnownSolution>>,
    /// Hint shown in trainings when the worker answers incorrectly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_on_unknown_solution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infinite_overlap: Option<bool>,
    /// Workers who must not receive this task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable_for: Vec<String>,
}

impl Task {
    pub fn new(pool_id: impl Into<String>, input_values: BTreeMap<String, Value>) -> Self {
        Self {
            id: None,
            pool_id: pool_id.into(),
            input_values,
            known_solutions: None,
            message_on_unknown_solution: None,
            overlap: None,
            infinite_overlap: None,
            unavailable_for: Vec::new(),
        }
    }
}

/// Assignment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    Active,
    Submitted,
    Accepted,
    Rejected,
    Skipped,
    Expired,
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssignmentStatus::Active => "ACTIVE",
            AssignmentStatus::Submitted => "SUBMITTED",
            AssignmentStatus::Accepted => "ACCEPTED",
            AssignmentStatus::Rejected => "REJECTED",
            AssignmentStatus::Skipped => "SKIPPED",
            AssignmentStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// A worker's answers for one task in a suite.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Solution {
    pub output_values: BTreeMap<String, Value>,
}

/// One worker's completed task suite: tasks and solutions pair up by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    #[serde(default)]
    pub task_suite_id: Option<String>,
    pub pool_id: String,
    pub user_id: String,
    pub status: AssignmentStatus,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub solutions: Vec<Solution>,
}

impl Assignment {
    /// Iterate over paired (task, solution) tuples of the suite.
    pub fn pairs(&self) -> impl Iterator<Item = (&Task, &Solution)> {
        self.tasks.iter().zip(self.solutions.iter())
    }
}

/// The requester account behind the credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requester {
    pub id: String,
    pub balance: f64,
}

/// A skill granted to workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_requester_description: Option<BTreeMap<String, String>>,
}

/// A long-running server-side operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Fail,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::Fail)
    }
}

/// One analytics request against a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsRequest {
    pub name: String,
    pub subject: String,
    pub subject_id: String,
}

impl AnalyticsRequest {
    pub fn pool(name: &str, pool_id: &str) -> Self {
        Self {
            name: name.to_string(),
            subject: "POOL".to_string(),
            subject_id: pool_id.to_string(),
        }
    }

    pub fn unique_workers_count(pool_id: &str) -> Self {
        Self::pool("unique_workers_count", pool_id)
    }

    pub fn submitted_assignments_count(pool_id: &str) -> Self {
        Self::pool("submitted_assignments_count", pool_id)
    }
}

/// A worker filter tree combined from and/or branches and leaf expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    And { and: Vec<Filter> },
    Or { or: Vec<Filter> },
    Expr(FilterExpr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    pub category: FilterCategory,
    pub key: String,
    pub operator: CompareOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterCategory {
    Profile,
    Computed,
    Skill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompareOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl Filter {
    fn profile(key: &str, operator: CompareOperator, value: Value) -> Self {
        Filter::Expr(FilterExpr {
            category: FilterCategory::Profile,
            key: key.to_string(),
            operator,
            value,
        })
    }

    fn computed(key: &str, operator: CompareOperator, value: Value) -> Self {
        Filter::Expr(FilterExpr {
            category: FilterCategory::Computed,
            key: key.to_string(),
            operator,
            value,
        })
    }

    pub fn language(code: &str) -> Self {
        Self::profile("languages", CompareOperator::In, json!(code.to_uppercase()))
    }

    pub fn client_type(value: &str) -> Self {
        Self::computed("client_type", CompareOperator::Eq, json!(value.to_uppercase()))
    }

    pub fn education(level: &str) -> Self {
        Self::profile("education", CompareOperator::Eq, json!(level.to_uppercase()))
    }

    pub fn skill_at_least(skill_id: &str, value: i64) -> Self {
        Filter::Expr(FilterExpr {
            category: FilterCategory::Skill,
            key: skill_id.to_string(),
            operator: CompareOperator::Gte,
            value: json!(value),
        })
    }

    pub fn gender(value: &str) -> Self {
        Self::profile("gender", CompareOperator::Eq, json!(value.to_uppercase()))
    }

    pub fn adult_allowed(value: bool) -> Self {
        Self::profile("adult_allowed", CompareOperator::Eq, json!(value))
    }

    pub fn country(code: &str) -> Self {
        Self::profile("country", CompareOperator::Eq, json!(code.to_uppercase()))
    }

    pub fn city(id: i64) -> Self {
        Self::computed("city", CompareOperator::Eq, json!(id))
    }

    pub fn born_before(timestamp: i64) -> Self {
        Self::profile("date_of_birth", CompareOperator::Lte, json!(timestamp))
    }

    pub fn born_after(timestamp: i64) -> Self {
        Self::profile("date_of_birth", CompareOperator::Gte, json!(timestamp))
    }

    pub fn user_agent_type(value: &str) -> Self {
        Self::computed("user_agent_type", CompareOperator::Eq, json!(value.to_uppercase()))
    }

    /// Combine alternatives into an or-branch; a single filter stays flat.
    pub fn any(mut filters: Vec<Filter>) -> Self {
        if filters.len() == 1 {
            filters.remove(0)
        } else {
            Filter::Or { or: filters }
        }
    }

    /// Conjoin `new` with an existing filter tree, if any.
    pub fn merge(existing: Option<Filter>, new: Filter) -> Filter {
        match existing {
            None => new,
            Some(Filter::And { mut and }) => {
                and.push(new);
                Filter::And { and }
            }
            Some(other) => Filter::And { and: vec![other, new] },
        }
    }
}

/// Quality-control rules attached to a pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityControl {
    #[serde(default)]
    pub configs: Vec<QualityRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha_frequency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRule {
    pub collector_config: CollectorConfig,
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(rename = "type")]
    pub kind: CollectorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectorKind {
    AssignmentSubmitTime,
    SkippedInRowAssignments,
    UsersAssessment,
    Captcha,
    GoldenSet,
    AssignmentsAssessment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub conditions: Vec<RuleCondition>,
    pub action: RuleAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub key: String,
    pub operator: CompareOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: RuleActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleActionKind {
    RestrictionV2,
    RejectAllAssignments,
    ApproveAllAssignments,
    SetSkill,
    SetSkillFromOutputField,
    ChangeOverlap,
}

impl RuleAction {
    /// Ban the worker from the project for a duration.
    pub fn restriction(duration: u32, duration_unit: &str, private_comment: &str) -> Self {
        Self {
            kind: RuleActionKind::RestrictionV2,
            parameters: Some(json!({
                "scope": "PROJECT",
                "duration": duration,
                "duration_unit": duration_unit.to_uppercase(),
                "private_comment": private_comment,
            })),
        }
    }

    pub fn reject_all(public_comment: &str) -> Self {
        Self {
            kind: RuleActionKind::RejectAllAssignments,
            parameters: Some(json!({ "public_comment": public_comment })),
        }
    }

    pub fn approve_all() -> Self {
        Self {
            kind: RuleActionKind::ApproveAllAssignments,
            parameters: None,
        }
    }

    pub fn set_skill(skill_id: &str, skill_value: u32) -> Self {
        Self {
            kind: RuleActionKind::SetSkill,
            parameters: Some(json!({ "skill_id": skill_id, "skill_value": skill_value })),
        }
    }

    pub fn set_skill_from_output_field(skill_id: &str, from_field: &str) -> Self {
        Self {
            kind: RuleActionKind::SetSkillFromOutputField,
            parameters: Some(json!({ "skill_id": skill_id, "from_field": from_field })),
        }
    }

    pub fn change_overlap(delta: u32, open_pool: bool) -> Self {
        Self {
            kind: RuleActionKind::ChangeOverlap,
            parameters: Some(json!({ "delta": delta, "open_pool": open_pool })),
        }
    }
}

impl QualityControl {
    /// Attach one collector with a single condition set and action.
    pub fn add_rule(
        &mut self,
        collector: CollectorConfig,
        conditions: Vec<RuleCondition>,
        action: RuleAction,
    ) {
        self.configs.push(QualityRule {
            collector_config: collector,
            rules: vec![RuleSpec { conditions, action }],
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_merge_flattens_and() {
        let merged = Filter::merge(None, Filter::language("en"));
        assert!(matches!(merged, Filter::Expr(_)));

        let merged = Filter::merge(Some(merged), Filter::client_type("browser"));
        let merged = Filter::merge(Some(merged), Filter::adult_allowed(false));
        match merged {
            Filter::And { and } => assert_eq!(and.len(), 3),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn test_filter_any_single_stays_flat() {
        let single = Filter::any(vec![Filter::country("fi")]);
        assert!(matches!(single, Filter::Expr(_)));

        let multi = Filter::any(vec![Filter::country("fi"), Filter::country("se")]);
        assert!(matches!(multi, Filter::Or { .. }));
    }

    #[test]
    fn test_filter_serialization_shape() {
        let filter = Filter::merge(
            Some(Filter::language("en")),
            Filter::skill_at_least("12345", 80),
        );
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["and"][0]["category"], "profile");
        assert_eq!(value["and"][0]["operator"], "IN");
        assert_eq!(value["and"][1]["category"], "skill");
        assert_eq!(value["and"][1]["key"], "12345");
        assert_eq!(value["and"][1]["operator"], "GTE");
    }

    #[test]
    fn test_quality_rule_serialization_shape() {
        let mut qc = QualityControl::default();
        qc.add_rule(
            CollectorConfig {
                kind: CollectorKind::GoldenSet,
                parameters: Some(json!({ "history_size": 5 })),
            },
            vec![RuleCondition {
                key: "golden_set_incorrect_answers_rate".to_string(),
                operator: CompareOperator::Gt,
                value: json!(30),
            }],
            RuleAction::restriction(7, "days", "Fails control tasks too often"),
        );

        let value = serde_json::to_value(&qc).unwrap();
        assert_eq!(value["configs"][0]["collector_config"]["type"], "GOLDEN_SET");
        assert_eq!(
            value["configs"][0]["rules"][0]["action"]["type"],
            "RESTRICTION_V2"
        );
        assert_eq!(
            value["configs"][0]["rules"][0]["action"]["parameters"]["duration_unit"],
            "DAYS"
        );
    }

    #[test]
    fn test_assignment_pairs() {
        let assignment = Assignment {
            id: "a1".to_string(),
            task_suite_id: None,
            pool_id: "p1".to_string(),
            user_id: "w1".to_string(),
            status: AssignmentStatus::Submitted,
            tasks: vec![
                Task::new("p1", BTreeMap::new()),
                Task::new("p1", BTreeMap::new()),
            ],
            solutions: vec![Solution::default(), Solution::default()],
        };
        assert_eq!(assignment.pairs().count(), 2);
    }

    #[test]
    fn test_speed_quality_balance_serialization() {
        let value =
            serde_json::to_value(SpeedQualityBalance::TopPercentageByQuality { percent: 80 })
                .unwrap();
        assert_eq!(value["type"], "TOP_PERCENTAGE_BY_QUALITY");
        assert_eq!(value["percent"], 80);
    }

    #[test]
    fn test_assignment_status_roundtrip() {
        let status: AssignmentStatus = serde_json::from_str("\"SUBMITTED\"").unwrap();
        assert_eq!(status, AssignmentStatus::Submitted);
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"SUBMITTED\"");
    }
}
