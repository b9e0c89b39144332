//! Crowdsourcing task provisioning.
//!
//! A [`CrowdsourcingTask`] owns the parsed configuration of one pipeline
//! stage and the remote entities provisioned for it: the project, the main
//! pool, an optional training pool and an optional skill. Provisioning
//! either loads entities by id or creates them from the configured setup.

use crate::actions::{value_key, AssignmentEvent, EventType};
use crate::config::{TaskConfig, TaskKind};
use crate::data::{load_blocklist, load_data};
use crate::platform::types::{
    CollectorConfig, CollectorKind, CompareOperator, Filter, KnownSolution, Pool, PoolDefaults,
    Project, QualityControl, RuleAction, RuleCondition, Skill, SpeedQualityBalance, Task,
    TaskSpec, Training, TrainingRequirementSpec,
};
use crate::platform::PlatformClient;
use crate::task::interface::build_task_spec;
use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Floor for the hourly wage the reward check enforces, in dollars.
pub const FAIR_HOURLY_WAGE: f64 = 12.0;

/// Reward per assignment that pays [`FAIR_HOURLY_WAGE`] given the
/// estimated seconds per task suite.
pub fn suggested_reward(seconds_per_suite: u32) -> f64 {
    let suites_per_hour = 3600.0 / f64::from(seconds_per_suite);
    FAIR_HOURLY_WAGE / suites_per_hour
}

/// Validate the configured reward against the fair-wage floor.
pub fn check_reward(
    seconds_per_suite: u32,
    reward: f64,
    name: &str,
    allow_low_reward: bool,
) -> Result<()> {
    let suggested = suggested_reward(seconds_per_suite);
    if reward >= suggested {
        return Ok(());
    }

    if allow_low_reward {
        warn!(
            "The reward per assignment for {} does not reach an hourly wage of ${}; \
             a fair reward would be at least ${:.3}",
            name, FAIR_HOURLY_WAGE, suggested
        );
        return Ok(());
    }

    bail!(
        "The reward you have set per assignment for {} does not result in a fair wage \
         for the workers. For an hourly wage of ${}, set reward_per_assignment to at \
         least ${:.3}, or pass --allow-low-reward to proceed anyway",
        name,
        FAIR_HOURLY_WAGE,
        suggested
    )
}

/// One crowdsourcing stage of a pipeline.
#[derive(Debug)]
pub struct CrowdsourcingTask {
    /// Short unique identifier for this run, used in private comments.
    pub run_id: String,
    pub name: String,
    pub kind: TaskKind,
    pub config: TaskConfig,
    pub task_spec: TaskSpec,
    pub project: Option<Project>,
    pub training: Option<Training>,
    pub pool: Option<Pool>,
    pub skill: Option<Skill>,
    pub blocklist: Vec<String>,
    pub exam: bool,
    /// Whether input tasks were uploaded; pools without input only open
    /// once another stage forwards work into them.
    pub has_input: bool,
}

impl CrowdsourcingTask {
    /// Parse and locally validate one task stage. No API calls yet.
    pub fn new(kind: TaskKind, config: TaskConfig, base_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string()[..8].to_uppercase();
        let task_spec = build_task_spec(kind, &config)?;

        let blocklist = match &config.pool.blocklist {
            Some(path) => load_blocklist(&resolve(base_dir, path))?,
            None => Vec::new(),
        };

        let exam = config.pool.exam.is_some();
        if exam {
            validate_exam_config(&config)?;
        }

        info!("The unique ID for this object ({}) is {}", config.name, run_id);

        Ok(Self {
            run_id,
            name: config.name.clone(),
            kind,
            config,
            task_spec,
            project: None,
            training: None,
            pool: None,
            skill: None,
            blocklist,
            exam,
            has_input: false,
        })
    }

    /// Provision the remote entities and upload input data.
    pub async fn provision(
        &mut self,
        client: &PlatformClient,
        base_dir: &Path,
        allow_low_reward: bool,
    ) -> Result<()> {
        self.load_project(client, base_dir).await?;
        self.load_training(client, base_dir).await?;
        self.load_pool(client, allow_low_reward).await?;
        self.upload_input(client, base_dir).await?;
        Ok(())
    }

    pub fn pool_id(&self) -> Result<&str> {
        self.pool
            .as_ref()
            .and_then(|p| p.id.as_deref())
            .ok_or_else(|| anyhow::anyhow!("Task {} has no provisioned pool", self.name))
    }

    /// Load an existing project or create a new one with the interface.
    async fn load_project(&mut self, client: &PlatformClient, base_dir: &Path) -> Result<()> {
        if let Some(id) = &self.config.project.id {
            let project = client
                .get_project(id)
                .await
                .with_context(|| format!("Failed to load project with ID {id}; check the project ID"))?;
            info!("Successfully loaded project {} from the platform", id);
            self.project = Some(project);
            return Ok(());
        }

        let setup = self.config.project.setup.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "Task {} defines neither a project id nor a project setup",
                self.name
            )
        })?;

        info!("Creating a new project for task {}", self.name);

        let instructions = match &self.config.project.instructions {
            Some(path) => {
                let path = resolve(base_dir, path);
                Some(std::fs::read_to_string(&path).with_context(|| {
                    format!("Could not load task instructions from {}", path.display())
                })?)
            }
            None => None,
        };

        let project = Project {
            id: None,
            public_name: setup.public_name.clone(),
            public_description: setup.public_description.clone(),
            public_instructions: instructions,
            private_comment: Some(format!("Created by task object with ID {}", self.run_id)),
            task_spec: self.task_spec.clone(),
        };

        let project = client.create_project(&project).await?;
        info!(
            "Successfully created a new project with ID {} on the platform",
            project.id.as_deref().unwrap_or("?")
        );
        self.project = Some(project);
        Ok(())
    }

    /// Load or create the training pool and upload its tasks.
    async fn load_training(&mut self, client: &PlatformClient, base_dir: &Path) -> Result<()> {
        let Some(train_conf) = self.config.training.clone() else {
            return Ok(());
        };

        if let Some(id) = &train_conf.id {
            let training = client
                .get_training(id)
                .await
                .with_context(|| format!("Failed to load training pool with ID {id}"))?;
            info!("Successfully loaded training pool with ID {}", id);
            self.training = Some(training);
            return Ok(());
        }

        let setup = train_conf.setup.as_ref().ok_or_else(|| {
            anyhow::anyhow!(
                "Task {} defines neither a training id nor a training setup",
                self.name
            )
        })?;
        let project_id = self.project_id()?.to_string();

        let training = Training {
            id: None,
            project_id,
            private_name: setup.private_name.clone(),
            may_contain_adult_content: false,
            training_tasks_in_task_suite_count: setup.training_tasks_in_task_suite_count,
            shuffle_tasks_in_task_suite: setup.shuffle_tasks_in_task_suite,
            status: None,
            extra: setup.extra.clone(),
        };

        let training = client.create_training(&training).await?;
        info!("Successfully created a new training pool");

        let data_conf = train_conf.data.as_ref().ok_or_else(|| {
            anyhow::anyhow!("Training for task {} has no data section", self.name)
        })?;

        let mut columns = data_conf.input.clone();
        columns.extend(data_conf.output.clone());

        let rows = load_data(&resolve(base_dir, &data_conf.file), &columns)?;
        let training_id = training
            .id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Platform returned a training without an id"))?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let input_values: BTreeMap<String, Value> = data_conf
                .input
                .keys()
                .filter_map(|k| row.get(k).map(|v| (k.clone(), v.clone())))
                .collect();
            let output_values: BTreeMap<String, Value> = data_conf
                .output
                .keys()
                .filter_map(|k| row.get(k).map(|v| (k.clone(), Value::String(value_key(v)))))
                .collect();

            let hint = row
                .get("hint")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Training data for task {} needs a 'hint' column with messages \
                         shown on wrong answers",
                        self.name
                    )
                })?;

            let mut task = Task::new(training_id, input_values);
            task.known_solutions = Some(vec![KnownSolution { output_values }]);
            task.message_on_unknown_solution = Some(hint);
            task.infinite_overlap = Some(true);
            task.unavailable_for = self.blocklist.clone();
            tasks.push(task);
        }

        client.create_tasks(&tasks, false, false).await?;
        info!(
            "Successfully added {} tasks to training pool {}",
            tasks.len(),
            training_id
        );

        self.training = Some(training);
        Ok(())
    }

    /// Load an existing pool or build and create a new one.
    async fn load_pool(&mut self, client: &PlatformClient, allow_low_reward: bool) -> Result<()> {
        if let Some(id) = &self.config.pool.id {
            let pool = client
                .get_pool(id)
                .await
                .with_context(|| format!("Failed to load pool with ID {id}"))?;
            info!("Successfully loaded main pool with ID {}", id);
            self.pool = Some(pool);
            return Ok(());
        }

        let mut pool = self.build_pool(allow_low_reward)?;

        // Skill setup comes before quality control so exam rules can refer
        // to the skill id.
        if let Some(skill_conf) = self.config.pool.skill.clone() {
            info!("Setting up skill for task {}", self.name);
            let skill = match &skill_conf.id {
                Some(id) => client
                    .get_skill(id)
                    .await
                    .with_context(|| format!("Failed to load skill with ID {id}"))?,
                None => {
                    let (name, language, description) = match (
                        &skill_conf.name,
                        &skill_conf.language,
                        &skill_conf.description,
                    ) {
                        (Some(n), Some(l), Some(d)) => (n, l, d),
                        _ => bail!(
                            "The skill for task {} needs either an id or a name, language \
                             and description",
                            self.name
                        ),
                    };
                    let skill = client.create_skill(name, language, description).await?;
                    info!(
                        "Successfully created skill with ID {}",
                        skill.id.as_deref().unwrap_or("?")
                    );
                    skill
                }
            };
            self.skill = Some(skill);
        }

        if let Some(qc) = self.config.quality_control.clone() {
            info!("Setting up quality control rules for task {}", self.name);
            apply_quality_control(&mut pool, &qc, &self.name)?;
        }

        if let Some(exam) = self.config.pool.exam {
            let skill_id = self
                .skill
                .as_ref()
                .and_then(|s| s.id.as_deref())
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "The pool configuration for {} contains the key 'exam', but no \
                         skill has been defined in the pool configuration",
                        self.name
                    )
                })?;

            pool.quality_control.add_rule(
                CollectorConfig {
                    kind: CollectorKind::GoldenSet,
                    parameters: Some(json!({ "history_size": exam.history_size })),
                },
                vec![RuleCondition {
                    key: "total_answers_count".to_string(),
                    operator: CompareOperator::Gte,
                    value: json!(exam.min_answers),
                }],
                RuleAction::set_skill_from_output_field(skill_id, "correct_answers_rate"),
            );
            info!("Successfully configured exam pool using skill {}", skill_id);
        }

        let pool = client.create_pool(&pool).await?;
        info!(
            "Successfully created a new pool with ID {} on the platform",
            pool.id.as_deref().unwrap_or("?")
        );
        self.pool = Some(pool);
        Ok(())
    }

    /// Assemble the pool payload from the configuration.
    fn build_pool(&self, allow_low_reward: bool) -> Result<Pool> {
        let conf = &self.config.pool;
        let setup = conf.setup.as_ref().ok_or_else(|| {
            anyhow::anyhow!("Task {} defines neither a pool id nor a pool setup", self.name)
        })?;
        let defaults = conf.defaults.ok_or_else(|| {
            anyhow::anyhow!("The pool for task {} has no 'defaults' section", self.name)
        })?;
        let mixer = conf.mixer.ok_or_else(|| {
            anyhow::anyhow!("The pool for task {} has no 'mixer' section", self.name)
        })?;

        match conf.estimated_time_per_suite {
            Some(seconds) => {
                check_reward(seconds, setup.reward_per_assignment, &self.name, allow_low_reward)?
            }
            None if allow_low_reward => warn!(
                "estimated_time_per_suite is not configured in the pool settings for {}; \
                 the fair-wage check cannot run",
                self.name
            ),
            None => bail!(
                "estimated_time_per_suite is not configured in the pool settings for {}. \
                 Add it to verify that reward_per_assignment results in an hourly wage of \
                 at least ${}, or pass --allow-low-reward to skip the check",
                self.name,
                FAIR_HOURLY_WAGE
            ),
        }

        let training_requirement = match (&self.training, conf.training) {
            (Some(training), Some(req)) => Some(TrainingRequirementSpec {
                training_pool_id: training
                    .id
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("Training pool has no id"))?,
                training_passing_skill_value: req.training_passing_skill_value,
            }),
            (Some(_), None) => bail!(
                "Task {} has a training pool but no pool/training section with \
                 training_passing_skill_value",
                self.name
            ),
            _ => None,
        };

        let filter = conf.filter.as_ref().map(build_filter).transpose()?.flatten();
        if filter.is_some() {
            info!("Finished adding filters to the pool for task {}", self.name);
        }

        Ok(Pool {
            id: None,
            project_id: self.project_id()?.to_string(),
            private_name: setup.private_name.clone(),
            private_comment: Some(format!("Created by task object with ID {}", self.run_id)),
            may_contain_adult_content: false,
            will_expire: Utc::now() + Duration::days(365),
            reward_per_assignment: setup.reward_per_assignment,
            assignment_max_duration_seconds: setup.assignment_max_duration_seconds,
            auto_accept_solutions: setup.auto_accept_solutions,
            defaults: PoolDefaults::from(defaults),
            mixer_config: mixer.into(),
            filter,
            quality_control: QualityControl::default(),
            speed_quality_balance: None,
            training_requirement,
            status: None,
            last_close_reason: None,
            extra: setup.extra.clone(),
        })
    }

    /// Upload input tasks from the configured data file, skipping exact
    /// duplicates of what the pool already holds.
    async fn upload_input(&mut self, client: &PlatformClient, base_dir: &Path) -> Result<()> {
        let Some(file) = self.config.data.file.clone() else {
            return Ok(());
        };

        let pool_id = self.pool_id()?.to_string();
        info!("Creating and adding tasks to pool with ID {}", pool_id);

        let mut columns = self.config.data.input.clone();
        if self.exam {
            columns.extend(self.config.data.output.clone());
        }

        let rows = load_data(&resolve(base_dir, &file), &columns)?;
        let mut tasks = Vec::with_capacity(rows.len());

        for row in &rows {
            let input_values: BTreeMap<String, Value> = self
                .config
                .data
                .input
                .keys()
                .filter_map(|k| row.get(k).map(|v| (k.clone(), v.clone())))
                .collect();

            let mut task = Task::new(&pool_id, input_values);
            task.unavailable_for = self.blocklist.clone();

            if self.exam {
                let output_values: BTreeMap<String, Value> = self
                    .config
                    .data
                    .output
                    .keys()
                    .filter_map(|k| row.get(k).map(|v| (k.clone(), Value::String(value_key(v)))))
                    .collect();
                task.known_solutions = Some(vec![KnownSolution { output_values }]);
                task.infinite_overlap = Some(true);
            }

            tasks.push(task);
        }

        let existing = client.get_tasks(&pool_id).await?;
        if !existing.is_empty() && tasks_match(&existing, &tasks) {
            warn!("The tasks to be added already exist in the pool; not adding duplicates");
            self.has_input = true;
            return Ok(());
        }

        client.create_tasks(&tasks, true, false).await?;
        info!("Successfully added {} tasks to pool with ID {}", tasks.len(), pool_id);
        self.has_input = true;
        Ok(())
    }

    /// Route assignment events into this task's own pool: accepted or
    /// submitted work re-materializes as new tasks here. Verification
    /// kinds additionally receive the source solution's outputs and the
    /// assignment id, and never the worker who produced them.
    pub async fn receive_events(
        &self,
        client: &PlatformClient,
        events: &[AssignmentEvent],
    ) -> Result<()> {
        let pool_id = self.pool_id()?;
        let overlap = self
            .config
            .pool
            .defaults
            .map(|d| d.default_overlap_for_new_tasks);

        let mut new_tasks = Vec::new();
        for event in events {
            if !matches!(event.event_type, EventType::Accepted | EventType::Submitted) {
                continue;
            }

            for (task, solution) in event.assignment.pairs() {
                let mut input_values = task.input_values.clone();
                let mut unavailable_for = self.blocklist.clone();

                if self.kind.is_verification() {
                    for (key, value) in &solution.output_values {
                        input_values.insert(key.clone(), value.clone());
                    }
                    input_values.insert(
                        "assignment_id".to_string(),
                        Value::String(event.assignment.id.clone()),
                    );
                    unavailable_for.push(event.assignment.user_id.clone());
                }

                let mut new_task = Task::new(pool_id, input_values);
                new_task.overlap = overlap;
                new_task.unavailable_for = unavailable_for;
                new_tasks.push(new_task);
            }
        }

        if new_tasks.is_empty() {
            return Ok(());
        }

        client.create_tasks(&new_tasks, false, true).await?;
        info!("Creating {} new tasks in pool {}", new_tasks.len(), pool_id);
        Ok(())
    }

    fn project_id(&self) -> Result<&str> {
        self.project
            .as_ref()
            .and_then(|p| p.id.as_deref())
            .ok_or_else(|| anyhow::anyhow!("Task {} has no provisioned project", self.name))
    }
}

fn resolve(base_dir: &Path, path: &Path) -> std::path::PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Exam pools hold golden tasks only and need a bounded worker count.
fn validate_exam_config(config: &TaskConfig) -> Result<()> {
    if config.pool.skill.is_none() {
        bail!(
            "The pool configuration for {} contains the key 'exam', but no skill has \
             been defined in the pool configuration",
            config.name
        );
    }

    if let Some(mixer) = config.pool.mixer {
        if mixer.real_tasks_count != 0 || mixer.training_tasks_count != 0 {
            bail!(
                "The configuration for {} defines an exam pool, but the count for real \
                 or training tasks is greater than 0; exam pools must contain golden \
                 tasks only",
                config.name
            );
        }
    }

    if config.data.file.is_none() {
        bail!(
            "The data configuration for {} does not contain an entry for 'file', which \
             should define a path to a TSV with exam tasks",
            config.name
        );
    }

    Ok(())
}

/// Compare the key and value sets of existing vs. new tasks; equal sets
/// mean the upload would duplicate the pool's content.
fn tasks_match(existing: &[Task], new: &[Task]) -> bool {
    fn keys(tasks: &[Task]) -> BTreeSet<&str> {
        tasks
            .iter()
            .flat_map(|t| t.input_values.keys().map(String::as_str))
            .collect()
    }

    fn values(tasks: &[Task]) -> BTreeSet<String> {
        tasks
            .iter()
            .flat_map(|t| t.input_values.values())
            .map(|v| serde_json::to_string(v).unwrap_or_default())
            .collect()
    }

    keys(existing) == keys(new) && values(existing) == values(new)
}

/// Translate the configured worker filters into a platform filter tree.
fn build_filter(conf: &crate::config::FilterConfig) -> Result<Option<Filter>> {
    let mut filter: Option<Filter> = None;
    let mut add = |new: Filter| filter = Some(Filter::merge(filter.take(), new));

    if let Some(languages) = &conf.languages {
        add(Filter::any(
            languages.iter().map(|l| Filter::language(l)).collect(),
        ));
    }

    if let Some(client_types) = &conf.client_type {
        add(Filter::any(
            client_types.iter().map(|c| Filter::client_type(c)).collect(),
        ));
    }

    if let Some(levels) = &conf.education {
        add(Filter::any(
            levels.iter().map(|e| Filter::education(e)).collect(),
        ));
    }

    if let Some(skills) = &conf.skill {
        for entry in skills {
            for (skill_id, minimum) in &entry.0 {
                add(Filter::skill_at_least(skill_id, *minimum));
            }
        }
    }

    if let Some(gender) = &conf.gender {
        add(Filter::gender(gender));
    }

    if let Some(adult_allowed) = conf.adult_allowed {
        add(Filter::adult_allowed(adult_allowed));
    }

    if let Some(countries) = &conf.country {
        add(Filter::any(
            countries.iter().map(|c| Filter::country(c)).collect(),
        ));
    }

    if let Some(cities) = &conf.city {
        add(Filter::any(cities.iter().map(|c| Filter::city(*c)).collect()));
    }

    if let Some(dob) = conf.date_of_birth {
        if dob.before.is_none() && dob.after.is_none() {
            bail!("A date_of_birth filter needs 'before' and/or 'after'");
        }
        if let Some(before) = dob.before {
            add(Filter::born_before(before));
        }
        if let Some(after) = dob.after {
            add(Filter::born_after(after));
        }
    }

    if let Some(agents) = &conf.user_agent_type {
        add(Filter::any(
            agents.iter().map(|a| Filter::user_agent_type(a)).collect(),
        ));
    }

    Ok(filter)
}

/// Translate the quality-control configuration into pool rules.
fn apply_quality_control(
    pool: &mut Pool,
    qc: &crate::config::QualityControlConfig,
    name: &str,
) -> Result<()> {
    if let Some(balance) = &qc.speed_quality_balance {
        let setting = match (
            balance.top_percentage_by_quality,
            balance.best_concurrent_users_by_quality,
        ) {
            (Some(percent), None) => {
                info!(
                    "Speed/quality setting: only the top {}% of workers will have access \
                     to pool {}",
                    percent, name
                );
                SpeedQualityBalance::TopPercentageByQuality { percent }
            }
            (None, Some(count)) => {
                info!(
                    "Speed/quality setting: only the top {} workers will have access to \
                     pool {}",
                    count, name
                );
                SpeedQualityBalance::BestConcurrentUsersByQuality { count }
            }
            _ => bail!(
                "speed_quality_balance for {} must set exactly one of \
                 top_percentage_by_quality or best_concurrent_users_by_quality",
                name
            ),
        };
        pool.speed_quality_balance = Some(setting);
    }

    if let Some(rule) = &qc.fast_responses {
        pool.quality_control.add_rule(
            CollectorConfig {
                kind: CollectorKind::AssignmentSubmitTime,
                parameters: Some(json!({
                    "history_size": rule.history_size,
                    "fast_submit_threshold_seconds": rule.threshold,
                })),
            },
            vec![RuleCondition {
                key: "fast_submitted_count".to_string(),
                operator: CompareOperator::Gt,
                value: json!(rule.count),
            }],
            RuleAction::restriction(rule.ban_duration, &rule.ban_units, "Fast responses"),
        );
        info!(
            "Added quality control rule: ban for {} {} if response time is less than {} \
             seconds for {} out of {} tasks",
            rule.ban_duration,
            rule.ban_units.to_lowercase(),
            rule.threshold,
            rule.count,
            rule.history_size
        );
    }

    if let Some(rule) = &qc.skipped_assignments {
        pool.quality_control.add_rule(
            CollectorConfig {
                kind: CollectorKind::SkippedInRowAssignments,
                parameters: None,
            },
            vec![RuleCondition {
                key: "skipped_in_row_count".to_string(),
                operator: CompareOperator::Gt,
                value: json!(rule.count),
            }],
            RuleAction::restriction(rule.ban_duration, &rule.ban_units, "Skipped assignments"),
        );
        info!(
            "Added quality control rule: ban for {} {} if the worker skipped {} \
             assignments in a row",
            rule.ban_duration,
            rule.ban_units.to_lowercase(),
            rule.count
        );
    }

    if qc.redo_banned == Some(true) {
        pool.quality_control.add_rule(
            CollectorConfig {
                kind: CollectorKind::UsersAssessment,
                parameters: None,
            },
            vec![RuleCondition {
                key: "pool_access_revoked_reason".to_string(),
                operator: CompareOperator::Eq,
                value: json!("RESTRICTION"),
            }],
            RuleAction::change_overlap(1, true),
        );
    }

    if let Some(rule) = &qc.captcha {
        pool.quality_control.captcha_frequency = Some(rule.frequency.to_uppercase());
        pool.quality_control.add_rule(
            CollectorConfig {
                kind: CollectorKind::Captcha,
                parameters: None,
            },
            vec![RuleCondition {
                key: "success_rate".to_string(),
                operator: CompareOperator::Lt,
                value: json!(rule.success_rate),
            }],
            RuleAction::restriction(rule.ban_duration, &rule.ban_units, "Too many captcha mistakes"),
        );
        info!(
            "Added quality control rule: ban for {} {} if the captcha success rate falls \
             below {}%; captcha frequency is set to {}",
            rule.ban_duration,
            rule.ban_units.to_lowercase(),
            rule.success_rate,
            rule.frequency.to_uppercase()
        );
    }

    if let Some(golden) = &qc.golden_set {
        let collector = || CollectorConfig {
            kind: CollectorKind::GoldenSet,
            parameters: Some(json!({ "history_size": golden.history_size })),
        };

        if let Some(rules) = &golden.ban_rules {
            pool.quality_control.add_rule(
                collector(),
                vec![RuleCondition {
                    key: "golden_set_incorrect_answers_rate".to_string(),
                    operator: CompareOperator::Gt,
                    value: json!(rules.incorrect_threshold),
                }],
                RuleAction::restriction(
                    rules.ban_duration,
                    &rules.ban_units,
                    "Fails control tasks too often",
                ),
            );
            info!(
                "Added quality control rule: ban for {} {} if the worker fails over {}% \
                 of control tasks",
                rules.ban_duration,
                rules.ban_units.to_lowercase(),
                rules.incorrect_threshold
            );
        }

        if let Some(rules) = &golden.reject_rules {
            pool.quality_control.add_rule(
                collector(),
                vec![RuleCondition {
                    key: "golden_set_incorrect_answers_rate".to_string(),
                    operator: CompareOperator::Gt,
                    value: json!(rules.incorrect_threshold),
                }],
                RuleAction::reject_all("Failed too many control tasks"),
            );
            info!(
                "Added quality control rule: reject all of a worker's assignments if they \
                 fail over {}% of control tasks",
                rules.incorrect_threshold
            );
        }

        if let Some(rules) = &golden.approve_rules {
            pool.quality_control.add_rule(
                collector(),
                vec![RuleCondition {
                    key: "golden_set_correct_answers_rate".to_string(),
                    operator: CompareOperator::Gt,
                    value: json!(rules.correct_threshold),
                }],
                RuleAction::approve_all(),
            );
            info!(
                "Added quality control rule: approve all of a worker's assignments if \
                 they complete over {}% of control tasks correctly",
                rules.correct_threshold
            );
        }

        if let Some(rules) = &golden.skill_rules {
            pool.quality_control.add_rule(
                collector(),
                vec![RuleCondition {
                    key: "golden_set_correct_answers_rate".to_string(),
                    operator: CompareOperator::Gt,
                    value: json!(rules.correct_threshold),
                }],
                RuleAction::set_skill(&rules.skill_id, rules.skill_value),
            );
            info!(
                "Added quality control rule: grant skill {} at value {} if the worker \
                 completes over {}% of control tasks correctly",
                rules.skill_id, rules.skill_value, rules.correct_threshold
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QualityControlConfig, TaskConfig};
    use crate::platform::types::RuleActionKind;

    fn task_config(yaml: &str) -> TaskConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn base_classification_yaml() -> &'static str {
        r#"
name: detect
data:
  input:
    url: url
  output:
    result: bool
interface:
  prompt: "Does the image contain text?"
  labels:
    "true": "Yes"
    "false": "No"
project:
  setup:
    public_name: "Detect"
    public_description: "Detect text"
pool:
  estimated_time_per_suite: 30
  setup:
    private_name: "Detect"
    reward_per_assignment: 0.15
    assignment_max_duration_seconds: 600
  defaults:
    default_overlap_for_new_task_suites: 3
    default_overlap_for_new_tasks: 3
  mixer:
    real_tasks_count: 4
    golden_tasks_count: 1
    training_tasks_count: 0
"#
    }

    #[test]
    fn test_suggested_reward() {
        // 30 seconds per suite means 120 suites per hour.
        assert!((suggested_reward(30) - 0.1).abs() < 1e-9);
        assert!((suggested_reward(3600) - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_check_reward_gate() {
        assert!(check_reward(30, 0.1, "detect", false).is_ok());
        assert!(check_reward(30, 0.05, "detect", false).is_err());
        assert!(check_reward(30, 0.05, "detect", true).is_ok());
    }

    #[test]
    fn test_new_builds_interface_and_flags() {
        let config = task_config(base_classification_yaml());
        let task =
            CrowdsourcingTask::new(TaskKind::ImageClassification, config, Path::new(".")).unwrap();

        assert_eq!(task.name, "detect");
        assert!(!task.exam);
        assert_eq!(task.run_id.len(), 8);
        assert!(task.task_spec.input_spec.contains_key("assignment_id"));
    }

    #[test]
    fn test_build_pool_enforces_fair_wage() {
        let mut config = task_config(base_classification_yaml());
        config.pool.setup.as_mut().unwrap().reward_per_assignment = 0.01;

        let mut task =
            CrowdsourcingTask::new(TaskKind::ImageClassification, config, Path::new(".")).unwrap();
        task.project = Some(Project {
            id: Some("project-1".to_string()),
            public_name: "Detect".to_string(),
            public_description: "Detect".to_string(),
            public_instructions: None,
            private_comment: None,
            task_spec: task.task_spec.clone(),
        });

        let err = task.build_pool(false).unwrap_err();
        assert!(err.to_string().contains("fair wage"));

        assert!(task.build_pool(true).is_ok());
    }

    #[test]
    fn test_build_pool_requires_time_estimate() {
        let mut config = task_config(base_classification_yaml());
        config.pool.estimated_time_per_suite = None;

        let mut task =
            CrowdsourcingTask::new(TaskKind::ImageClassification, config, Path::new(".")).unwrap();
        task.project = Some(Project {
            id: Some("project-1".to_string()),
            public_name: "Detect".to_string(),
            public_description: "Detect".to_string(),
            public_instructions: None,
            private_comment: None,
            task_spec: task.task_spec.clone(),
        });

        let err = task.build_pool(false).unwrap_err();
        assert!(err.to_string().contains("estimated_time_per_suite"));
    }

    #[test]
    fn test_exam_config_validation() {
        let yaml = r#"
name: exam
data:
  file: data/exam.tsv
  input:
    url: url
  output:
    result: bool
interface:
  prompt: "Exam"
  labels:
    "true": "Yes"
    "false": "No"
project:
  setup:
    public_name: "Exam"
    public_description: "Exam"
pool:
  estimated_time_per_suite: 30
  setup:
    private_name: "Exam"
    reward_per_assignment: 0.15
    assignment_max_duration_seconds: 600
  defaults:
    default_overlap_for_new_task_suites: 1
    default_overlap_for_new_tasks: 1
  mixer:
    real_tasks_count: 2
    golden_tasks_count: 1
    training_tasks_count: 0
  skill:
    name: "Exam skill"
    language: EN
    description: "Passed the exam"
  exam:
    history_size: 10
    min_answers: 10
    max_performers: 50
"#;
        let config = task_config(yaml);
        let err = CrowdsourcingTask::new(TaskKind::ImageClassification, config, Path::new("."))
            .unwrap_err();
        assert!(err.to_string().contains("golden tasks only"));
    }

    #[test]
    fn test_tasks_match_detects_duplicates() {
        let mut a = Task::new("p1", BTreeMap::new());
        a.input_values.insert("url".to_string(), json!("https://example.com/a.png"));
        let mut b = Task::new("p1", BTreeMap::new());
        b.input_values.insert("url".to_string(), json!("https://example.com/b.png"));

        assert!(tasks_match(&[a.clone(), b.clone()], &[b.clone(), a.clone()]));

        let mut c = Task::new("p1", BTreeMap::new());
        c.input_values.insert("url".to_string(), json!("https://example.com/c.png"));
        assert!(!tasks_match(&[a, b], &[c]));
    }

    #[test]
    fn test_filter_translation() {
        let conf: crate::config::FilterConfig = serde_yaml::from_str(
            r#"
languages: [en, fi]
adult_allowed: false
skill:
  - 12345: 80
"#,
        )
        .unwrap();

        let filter = build_filter(&conf).unwrap().unwrap();
        let value = serde_json::to_value(&filter).unwrap();
        let and = value["and"].as_array().unwrap();
        assert_eq!(and.len(), 3);
        assert!(and[0]["or"].is_array());
    }

    #[test]
    fn test_quality_control_translation() {
        let qc: QualityControlConfig = serde_yaml::from_str(
            r#"
speed_quality_balance:
  top_percentage_by_quality: 80
fast_responses:
  history_size: 5
  count: 3
  threshold: 10
  ban_duration: 2
  ban_units: days
redo_banned: true
golden_set:
  history_size: 10
  ban_rules:
    incorrect_threshold: 40
    ban_duration: 7
    ban_units: days
  approve_rules:
    correct_threshold: 80
"#,
        )
        .unwrap();

        let config = task_config(base_classification_yaml());
        let mut task =
            CrowdsourcingTask::new(TaskKind::ImageClassification, config, Path::new(".")).unwrap();
        task.project = Some(Project {
            id: Some("project-1".to_string()),
            public_name: "Detect".to_string(),
            public_description: "Detect".to_string(),
            public_instructions: None,
            private_comment: None,
            task_spec: task.task_spec.clone(),
        });

        let mut pool = task.build_pool(false).unwrap();
        apply_quality_control(&mut pool, &qc, "detect").unwrap();

        assert!(matches!(
            pool.speed_quality_balance,
            Some(SpeedQualityBalance::TopPercentageByQuality { percent: 80 })
        ));
        assert_eq!(pool.quality_control.configs.len(), 4);

        let kinds: Vec<RuleActionKind> = pool
            .quality_control
            .configs
            .iter()
            .map(|c| c.rules[0].action.kind)
            .collect();
        assert!(kinds.contains(&RuleActionKind::RestrictionV2));
        assert!(kinds.contains(&RuleActionKind::ChangeOverlap));
        assert!(kinds.contains(&RuleActionKind::ApproveAllAssignments));
    }

    #[test]
    fn test_conflicting_speed_quality_balance() {
        let qc: QualityControlConfig = serde_yaml::from_str(
            r#"
speed_quality_balance:
  top_percentage_by_quality: 80
  best_concurrent_users_by_quality: 10
"#,
        )
        .unwrap();

        let config = task_config(base_classification_yaml());
        let mut task =
            CrowdsourcingTask::new(TaskKind::ImageClassification, config, Path::new(".")).unwrap();
        task.project = Some(Project {
            id: Some("project-1".to_string()),
            public_name: "Detect".to_string(),
            public_description: "Detect".to_string(),
            public_instructions: None,
            private_comment: None,
            task_spec: task.task_spec.clone(),
        });

        let mut pool = task.build_pool(false).unwrap();
        assert!(apply_quality_control(&mut pool, &qc, "detect").is_err());
    }
}
