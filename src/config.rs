//! Configuration file handling.
//!
//! This module defines the YAML schemas for pipelines, tasks and actions,
//! plus the JSON credentials file consumed at startup. Paths referenced by
//! a pipeline file are resolved relative to that file.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level pipeline description: an ordered sequence of tasks and actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Human-readable pipeline name.
    pub name: String,

    /// Crowdsourcing tasks, in provisioning order.
    pub tasks: Vec<TaskEntry>,

    /// Routing actions wired between the tasks.
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
}

/// One task in the pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub kind: TaskKind,
    pub config: PathBuf,
}

/// One action in the pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    pub kind: ActionKind,
    pub config: PathBuf,
}

/// Supported task interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ImageClassification,
    ImageSegmentation,
    SegmentationClassification,
    TextClassification,
    TextAnnotation,
}

impl TaskKind {
    /// Verification interfaces receive the source solution's outputs and
    /// assignment id as task input when work is routed to them.
    pub fn is_verification(self) -> bool {
        matches!(self, TaskKind::SegmentationClassification)
    }
}

/// Supported action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Forward,
    Aggregate,
    SeparateBboxes,
    VerifyPolygon,
}

/// Task configuration loaded from a per-task YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique name of the task within the pipeline.
    pub name: String,

    /// Input/output variables and the optional input data file.
    pub data: DataConfig,

    /// User interface settings for the task kind.
    pub interface: InterfaceConfig,

    /// Remote project to load or create.
    pub project: ProjectConfig,

    /// Main pool settings.
    pub pool: PoolConfig,

    /// Optional training pool settings.
    #[serde(default)]
    pub training: Option<TrainingConfig>,

    /// Optional quality-control rules applied to the pool.
    #[serde(default)]
    pub quality_control: Option<QualityControlConfig>,

    /// Optional routing configuration for completed assignments.
    #[serde(default)]
    pub actions: Option<TaskActionsConfig>,
}

/// Input/output declaration for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Optional TSV file with input data (header row required).
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Input variable names mapped to their data types.
    pub input: BTreeMap<String, DataType>,

    /// Output variable names mapped to their data types.
    pub output: BTreeMap<String, DataType>,
}

/// Data types understood by the platform's task specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "url")]
    Url,
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "str")]
    Str,
    #[serde(rename = "bool")]
    Bool,
}

/// Interface settings shared across task kinds; kind-specific keys are
/// validated when the interface is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Prompt text shown to the worker.
    pub prompt: String,

    /// Output value to display label mapping for choice interfaces.
    #[serde(default, deserialize_with = "de_string_key_map")]
    pub labels: BTreeMap<String, String>,

    /// Annotation tools for segmentation interfaces
    /// (`rectangle`, `polygon`, `point`).
    #[serde(default)]
    pub tools: Option<Vec<String>>,

    /// Label for an optional "nothing to annotate" checkbox.
    #[serde(default)]
    pub checkbox: Option<String>,

    /// Labels for the read-only annotation layer of verification interfaces.
    #[serde(default)]
    pub segmentation: Option<SegmentationInterfaceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationInterfaceConfig {
    #[serde(default, deserialize_with = "de_string_key_map")]
    pub labels: BTreeMap<String, String>,
}

/// Project settings: load an existing project by id or create a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub setup: Option<ProjectSetup>,

    /// Path to an HTML file with public task instructions.
    #[serde(default)]
    pub instructions: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSetup {
    pub public_name: String,
    pub public_description: String,
}

/// Main pool settings: load by id or create from `setup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub setup: Option<PoolSetup>,

    #[serde(default)]
    pub defaults: Option<PoolDefaultsConfig>,

    #[serde(default)]
    pub mixer: Option<MixerConfig>,

    /// Estimated seconds a worker spends on one task suite; used by the
    /// fair-wage check against `reward_per_assignment`.
    #[serde(default)]
    pub estimated_time_per_suite: Option<u32>,

    /// Linking settings for a configured training pool.
    #[serde(default)]
    pub training: Option<TrainingRequirement>,

    /// Worker filters restricting who may enter the pool.
    #[serde(default)]
    pub filter: Option<FilterConfig>,

    /// Skill granted or required by this pool.
    #[serde(default)]
    pub skill: Option<SkillConfig>,

    /// Exam settings; an exam pool holds golden tasks only.
    #[serde(default)]
    pub exam: Option<ExamConfig>,

    /// TSV file with a `user_id` column of workers to exclude.
    #[serde(default)]
    pub blocklist: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSetup {
    pub private_name: String,
    pub reward_per_assignment: f64,
    pub assignment_max_duration_seconds: u32,
    #[serde(default)]
    pub auto_accept_solutions: bool,

    /// Additional pool fields passed through to the platform unchanged.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolDefaultsConfig {
    pub default_overlap_for_new_task_suites: u32,
    pub default_overlap_for_new_tasks: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MixerConfig {
    pub real_tasks_count: u32,
    pub golden_tasks_count: u32,
    pub training_tasks_count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrainingRequirement {
    pub training_passing_skill_value: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExamConfig {
    /// Number of recent golden answers considered when assigning the skill.
    pub history_size: u32,
    /// Minimum answers before the skill is assigned.
    pub min_answers: u32,
    /// Close the pool once this many unique workers have submitted.
    pub max_performers: u32,
}

/// Worker filters. Multiple entries are conjoined; values within one entry
/// are alternatives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub client_type: Option<Vec<String>>,
    #[serde(default)]
    pub education: Option<Vec<String>>,
    /// Skill requirements as `{skill_id: minimum_value}` entries.
    #[serde(default)]
    pub skill: Option<Vec<SkillFilterEntry>>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub adult_allowed: Option<bool>,
    #[serde(default)]
    pub country: Option<Vec<String>>,
    #[serde(default)]
    pub city: Option<Vec<i64>>,
    /// UNIX timestamps bounding the worker's date of birth.
    #[serde(default)]
    pub date_of_birth: Option<DateOfBirthFilter>,
    #[serde(default)]
    pub user_agent_type: Option<Vec<String>>,
}

/// A single-entry mapping from skill id to minimum value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillFilterEntry(
    #[serde(deserialize_with = "de_string_key_map")] pub BTreeMap<String, i64>,
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateOfBirthFilter {
    #[serde(default)]
    pub before: Option<i64>,
    #[serde(default)]
    pub after: Option<i64>,
}

/// Training pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub setup: Option<TrainingSetup>,
    #[serde(default)]
    pub data: Option<TrainingDataConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSetup {
    pub private_name: String,
    #[serde(default)]
    pub training_tasks_in_task_suite_count: Option<u32>,
    #[serde(default)]
    pub shuffle_tasks_in_task_suite: Option<bool>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Training data: a TSV with inputs, known outputs and a `hint` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingDataConfig {
    pub file: PathBuf,
    pub input: BTreeMap<String, DataType>,
    pub output: BTreeMap<String, DataType>,
}

/// Quality-control rules translated into platform payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityControlConfig {
    #[serde(default)]
    pub speed_quality_balance: Option<SpeedQualityBalanceConfig>,
    #[serde(default)]
    pub fast_responses: Option<FastResponsesRule>,
    #[serde(default)]
    pub skipped_assignments: Option<SkippedAssignmentsRule>,
    /// Reopen work taken from banned workers by raising overlap.
    #[serde(default)]
    pub redo_banned: Option<bool>,
    #[serde(default)]
    pub captcha: Option<CaptchaRule>,
    #[serde(default)]
    pub golden_set: Option<GoldenSetRules>,
}

/// Exactly one of the two variants must be set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpeedQualityBalanceConfig {
    #[serde(default)]
    pub top_percentage_by_quality: Option<u32>,
    #[serde(default)]
    pub best_concurrent_users_by_quality: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastResponsesRule {
    pub history_size: u32,
    pub count: u32,
    /// Submissions faster than this many seconds count as fast.
    pub threshold: u32,
    pub ban_duration: u32,
    pub ban_units: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedAssignmentsRule {
    pub count: u32,
    pub ban_duration: u32,
    pub ban_units: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaRule {
    pub frequency: String,
    pub success_rate: u32,
    pub ban_duration: u32,
    pub ban_units: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoldenSetRules {
    pub history_size: u32,
    #[serde(default)]
    pub ban_rules: Option<GoldenSetBanRules>,
    #[serde(default)]
    pub reject_rules: Option<GoldenSetRejectRules>,
    #[serde(default)]
    pub approve_rules: Option<GoldenSetApproveRules>,
    #[serde(default)]
    pub skill_rules: Option<GoldenSetSkillRules>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenSetBanRules {
    pub incorrect_threshold: u32,
    pub ban_duration: u32,
    pub ban_units: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenSetRejectRules {
    pub incorrect_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenSetApproveRules {
    pub correct_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenSetSkillRules {
    pub correct_threshold: u32,
    pub skill_id: String,
    pub skill_value: u32,
}

/// Routing configuration under a task's `actions` key. Values are names of
/// other tasks or actions in the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskActionsConfig {
    /// Handler for completed results; dispatched on submission or
    /// acceptance depending on the pool's `auto_accept_solutions`.
    #[serde(default)]
    pub on_result: Option<String>,
    /// Aggregate action fired when the pool closes.
    #[serde(default)]
    pub on_closed: Option<String>,
    #[serde(default)]
    pub on_submitted: Option<String>,
    #[serde(default)]
    pub on_accepted: Option<String>,
    /// Naming the task itself re-adds rejected work to its own pool.
    #[serde(default)]
    pub on_rejected: Option<String>,
    /// Action that seeds this pool's input at pipeline start.
    #[serde(default)]
    pub data_source: Option<String>,
}

/// Forward action configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    pub name: String,

    /// Output variable whose value selects the route.
    pub data: String,

    /// Task this action receives work from (informational; wiring is done
    /// from the source task's `actions` key).
    #[serde(default)]
    pub source: Option<String>,

    /// Output value to destination mapping. A destination is a task or
    /// action name, `accept`, `reject`, a list combining both, or null to
    /// ignore the output.
    #[serde(deserialize_with = "de_string_key_map")]
    pub on_result: BTreeMap<String, Option<RouteValue>>,

    /// Worker-facing comments for accepted/rejected outputs.
    #[serde(default, deserialize_with = "de_string_key_map")]
    pub messages: BTreeMap<String, String>,
}

/// A single route destination or a multi-action list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteValue {
    One(String),
    Many(Vec<String>),
}

/// Aggregate action configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    pub name: String,

    /// Task whose assignments are aggregated when its pool closes.
    pub source: String,

    pub method: AggregationMethod,

    /// Forward action that receives the aggregated records.
    #[serde(default)]
    pub forward: Option<String>,

    pub data: AggregateDataConfig,

    /// Label to worker-facing message mapping attached to records.
    #[serde(default, deserialize_with = "de_string_key_map")]
    pub messages: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateDataConfig {
    /// Input variable identifying the aggregated item.
    pub input: String,
    /// Output variable holding the label to aggregate.
    pub output: String,
}

/// Named aggregation methods. Only the counting-based method runs natively;
/// model-based methods are rejected during pipeline validation because the
/// statistical library they delegate to has no Rust counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    MajorityVote,
    DawidSkene,
    GoldMajorityVote,
    Mmsr,
    Wawa,
    ZeroBasedSkill,
    Glad,
}

impl AggregationMethod {
    pub fn is_supported(self) -> bool {
        matches!(self, AggregationMethod::MajorityVote)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AggregationMethod::MajorityVote => "majority_vote",
            AggregationMethod::DawidSkene => "dawid_skene",
            AggregationMethod::GoldMajorityVote => "gold_majority_vote",
            AggregationMethod::Mmsr => "mmsr",
            AggregationMethod::Wawa => "wawa",
            AggregationMethod::ZeroBasedSkill => "zero_based_skill",
            AggregationMethod::Glad => "glad",
        }
    }
}

/// SeparateBBoxes action configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparateBboxesConfig {
    pub name: String,

    /// Task whose pool receives the expanded tasks.
    pub target: String,

    pub data: SeparateBboxesDataConfig,

    /// Label stamped onto every produced bounding box.
    #[serde(default)]
    pub add_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparateBboxesDataConfig {
    /// TSV file read when the action seeds a pool at pipeline start.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Variable holding the image URL.
    pub image: String,
    /// Variable holding the bounding-box array.
    pub bboxes: String,
}

/// VerifyPolygon action configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPolygonConfig {
    pub name: String,

    /// Task whose submissions are verified.
    pub source: String,

    /// Forward action that receives the verdict records.
    #[serde(default)]
    pub forward: Option<String>,

    /// Output variable holding the annotated shapes.
    pub data: String,

    /// Optional label criteria: a bare label must be present, a
    /// `{label: count}` entry must match exactly.
    #[serde(default)]
    pub labels: Option<Vec<LabelCriterion>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelCriterion {
    Name(String),
    Counts(#[serde(deserialize_with = "de_string_key_map")] BTreeMap<String, usize>),
}

/// A fully parsed action configuration.
#[derive(Debug, Clone)]
pub enum ActionConfig {
    Forward(ForwardConfig),
    Aggregate(AggregateConfig),
    SeparateBboxes(SeparateBboxesConfig),
    VerifyPolygon(VerifyPolygonConfig),
}

impl ActionConfig {
    pub fn name(&self) -> &str {
        match self {
            ActionConfig::Forward(c) => &c.name,
            ActionConfig::Aggregate(c) => &c.name,
            ActionConfig::SeparateBboxes(c) => &c.name,
            ActionConfig::VerifyPolygon(c) => &c.name,
        }
    }
}

/// A pipeline with every referenced configuration file loaded.
#[derive(Debug, Clone)]
pub struct LoadedPipeline {
    pub name: String,
    pub tasks: Vec<(TaskKind, TaskConfig)>,
    pub actions: Vec<ActionConfig>,
    /// Directory of the pipeline file; data paths resolve against it.
    pub base_dir: PathBuf,
}

impl LoadedPipeline {
    /// Load a pipeline file and every task/action configuration it names.
    pub fn load(path: &Path) -> Result<Self> {
        let spec: PipelineSpec = load_yaml(path)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut tasks = Vec::with_capacity(spec.tasks.len());
        for entry in &spec.tasks {
            let config: TaskConfig = load_yaml(&base_dir.join(&entry.config))?;
            tasks.push((entry.kind, config));
        }

        let mut actions = Vec::with_capacity(spec.actions.len());
        for entry in &spec.actions {
            let path = base_dir.join(&entry.config);
            let action = match entry.kind {
                ActionKind::Forward => ActionConfig::Forward(load_yaml(&path)?),
                ActionKind::Aggregate => ActionConfig::Aggregate(load_yaml(&path)?),
                ActionKind::SeparateBboxes => ActionConfig::SeparateBboxes(load_yaml(&path)?),
                ActionKind::VerifyPolygon => ActionConfig::VerifyPolygon(load_yaml(&path)?),
            };
            actions.push(action);
        }

        Ok(Self {
            name: spec.name,
            tasks,
            actions,
            base_dir,
        })
    }

}

/// Credentials file (JSON) consumed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// OAuth token for the platform API.
    pub token: String,

    /// Which endpoint the token is valid for.
    #[serde(default)]
    pub mode: PlatformMode,

    /// Production API base URL.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Sandbox API base URL; falls back to `api_url` when unset.
    #[serde(default)]
    pub sandbox_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformMode {
    #[default]
    Production,
    Sandbox,
}

impl Credentials {
    /// Load credentials from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file: {}", path.display()))?;

        let creds: Credentials = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse credentials file: {}", path.display()))?;

        if creds.token.trim().is_empty() {
            bail!("Credentials file {} has an empty token", path.display());
        }

        Ok(creds)
    }

    /// The API base URL selected by `mode`.
    pub fn base_url(&self) -> Result<&str> {
        let url = match self.mode {
            PlatformMode::Production => self.api_url.as_deref(),
            PlatformMode::Sandbox => self.sandbox_url.as_deref().or(self.api_url.as_deref()),
        };

        url.ok_or_else(|| {
            anyhow::anyhow!("Credentials are missing an API URL for mode {:?}", self.mode)
        })
    }
}

/// Parse a YAML file into a typed configuration.
pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Deserialize a YAML mapping whose keys may be booleans or numbers into a
/// string-keyed map. YAML spells `true:` as a boolean key, but routing and
/// label tables compare keys against stringified output values.
fn de_string_key_map<'de, D, V>(deserializer: D) -> Result<BTreeMap<String, V>, D::Error>
where
    D: Deserializer<'de>,
    V: serde::de::DeserializeOwned,
{
    use serde::de::Error;

    let value = serde_yaml::Value::deserialize(deserializer)?;
    let mapping = match value {
        serde_yaml::Value::Mapping(m) => m,
        serde_yaml::Value::Null => return Ok(BTreeMap::new()),
        _ => return Err(D::Error::custom("expected a mapping")),
    };

    let mut map = BTreeMap::new();
    for (key, val) in mapping {
        let key = yaml_key_to_string(&key).map_err(D::Error::custom)?;
        let val = serde_yaml::from_value(val).map_err(D::Error::custom)?;
        map.insert(key, val);
    }

    Ok(map)
}

fn yaml_key_to_string(key: &serde_yaml::Value) -> Result<String, String> {
    match key {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(format!("unsupported mapping key: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK_YAML: &str = r#"
name: detect
data:
  file: data/detect.tsv
  input:
    url: url
  output:
    result: bool
interface:
  prompt: "Does the image contain text?"
  labels:
    true: "Yes"
    false: "No"
project:
  setup:
    public_name: "Detect text"
    public_description: "Look at the image and decide whether it contains text."
  instructions: instructions/detect.html
pool:
  estimated_time_per_suite: 30
  setup:
    private_name: "Text detection"
    reward_per_assignment: 0.15
    assignment_max_duration_seconds: 600
    auto_accept_solutions: true
  defaults:
    default_overlap_for_new_task_suites: 3
    default_overlap_for_new_tasks: 3
  mixer:
    real_tasks_count: 4
    golden_tasks_count: 1
    training_tasks_count: 0
  filter:
    languages: [en, fi]
    client_type: [browser]
quality_control:
  fast_responses:
    history_size: 5
    count: 3
    threshold: 10
    ban_duration: 1
    ban_units: days
actions:
  on_result: forward_detect
  on_closed: aggregate_detect
"#;

    #[test]
    fn test_parse_task_config() {
        let config: TaskConfig = serde_yaml::from_str(TASK_YAML).unwrap();
        assert_eq!(config.name, "detect");
        assert_eq!(config.data.input.get("url"), Some(&DataType::Url));
        assert_eq!(config.data.output.get("result"), Some(&DataType::Bool));
        assert_eq!(config.interface.labels.get("true"), Some(&"Yes".to_string()));
        assert_eq!(config.pool.estimated_time_per_suite, Some(30));

        let setup = config.pool.setup.as_ref().unwrap();
        assert!(setup.auto_accept_solutions);
        assert_eq!(setup.reward_per_assignment, 0.15);

        let actions = config.actions.as_ref().unwrap();
        assert_eq!(actions.on_result.as_deref(), Some("forward_detect"));
        assert_eq!(actions.on_closed.as_deref(), Some("aggregate_detect"));
    }

    #[test]
    fn test_boolean_keys_become_strings() {
        let yaml = r#"
name: forward_detect
data: result
on_result:
  true: outline
  false: reject
messages:
  false: "The image was judged not to contain any text."
"#;
        let config: ForwardConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.on_result.get("true"),
            Some(Some(RouteValue::One(name))) if name == "outline"
        ));
        assert!(config.messages.contains_key("false"));
    }

    #[test]
    fn test_route_value_variants() {
        let yaml = r#"
name: forward_verify
data: verdict
on_result:
  correct: accept
  incorrect: [reject, fix_outlines]
  unsure:
"#;
        let config: ForwardConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.on_result.get("correct"),
            Some(Some(RouteValue::One(v))) if v == "accept"
        ));
        assert!(matches!(
            config.on_result.get("incorrect"),
            Some(Some(RouteValue::Many(v))) if v.len() == 2
        ));
        assert!(matches!(config.on_result.get("unsure"), Some(None)));
    }

    #[test]
    fn test_aggregation_method_support() {
        assert!(AggregationMethod::MajorityVote.is_supported());
        assert!(!AggregationMethod::DawidSkene.is_supported());
        assert!(!AggregationMethod::Glad.is_supported());

        let method: AggregationMethod = serde_yaml::from_str("dawid_skene").unwrap();
        assert_eq!(method, AggregationMethod::DawidSkene);
    }

    #[test]
    fn test_skill_filter_entry() {
        let yaml = r#"
skill:
  - 12345: 80
"#;
        let config: FilterConfig = serde_yaml::from_str(yaml).unwrap();
        let entries = config.skill.unwrap();
        assert_eq!(entries[0].0.get("12345"), Some(&80));
    }

    #[test]
    fn test_credentials_base_url() {
        let creds: Credentials = serde_json::from_str(
            r#"{"token": "abc", "mode": "sandbox",
                "api_url": "https://platform.example.com/api/v1",
                "sandbox_url": "https://sandbox.example.com/api/v1"}"#,
        )
        .unwrap();
        assert_eq!(
            creds.base_url().unwrap(),
            "https://sandbox.example.com/api/v1"
        );

        let creds: Credentials =
            serde_json::from_str(r#"{"token": "abc", "api_url": "https://x.example.com"}"#)
                .unwrap();
        assert_eq!(creds.mode, PlatformMode::Production);
        assert_eq!(creds.base_url().unwrap(), "https://x.example.com");
    }

    #[test]
    fn test_label_criterion_variants() {
        let yaml = r#"
name: verify_poly
source: outline
data: outlines
labels:
  - text
  - figure: 2
"#;
        let config: VerifyPolygonConfig = serde_yaml::from_str(yaml).unwrap();
        let labels = config.labels.unwrap();
        assert!(matches!(&labels[0], LabelCriterion::Name(n) if n == "text"));
        assert!(matches!(
            &labels[1],
            LabelCriterion::Counts(c) if c.get("figure") == Some(&2)
        ));
    }
}
