//! Task sequence orchestration.
//!
//! A [`SequencePlan`] is the validated, offline form of a pipeline: tasks
//! and actions constructed from their configurations, with every
//! cross-reference resolved by name. A [`TaskSequence`] runs the plan
//! against the platform: provision, seed, open, then poll until every
//! pool has drained.

pub mod observers;

use crate::actions::{
    Aggregate, AssignmentEvent, EventType, Forward, PoolTarget, ResolvedDestination, RoutePlan,
    SeparateBboxes, VerifyPolygon, WorkRecord,
};
use crate::config::{ActionConfig, LoadedPipeline};
use crate::data::load_data;
use crate::platform::types::{
    AssignmentStatus, CloseReason, CollectorConfig, CollectorKind, CompareOperator, RuleAction,
    RuleCondition,
};
use crate::platform::PlatformClient;
use crate::task::CrowdsourcingTask;
use anyhow::{bail, Context, Result};
use futures::future::try_join_all;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use observers::{AnalyticsObserver, AssignmentsObserver, PoolStatusObserver, PoolTransition};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Safety valve against routing cycles in one drain pass.
const MAX_CHAINED_RECORDS: usize = 10_000;

/// A task or action position in the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRef {
    Task(usize),
    Action(usize),
}

/// A constructed action unit.
#[derive(Debug)]
pub enum ActionUnit {
    Forward(Forward),
    Aggregate(Aggregate),
    Separate(SeparateBboxes),
    Verify(VerifyPolygon),
}

impl ActionUnit {
    pub fn name(&self) -> &str {
        match self {
            ActionUnit::Forward(a) => &a.name,
            ActionUnit::Aggregate(a) => &a.name,
            ActionUnit::Separate(a) => &a.name,
            ActionUnit::Verify(a) => &a.name,
        }
    }

    fn kind_label(&self) -> &'static str {
        match self {
            ActionUnit::Forward(_) => "Forward",
            ActionUnit::Aggregate(_) => "Aggregate",
            ActionUnit::Separate(_) => "SeparateBBoxes",
            ActionUnit::Verify(_) => "VerifyPolygon",
        }
    }
}

/// Runtime knobs for a sequence.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub poll_interval: Duration,
    /// Delay before completion is re-confirmed, so in-flight forwards can
    /// reopen a pool before the run exits.
    pub completion_grace: Duration,
    pub allow_low_reward: bool,
    pub no_exit: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            completion_grace: Duration::from_secs(90),
            allow_low_reward: false,
            no_exit: false,
        }
    }
}

/// The validated offline form of a pipeline.
#[derive(Debug)]
pub struct SequencePlan {
    pub name: String,
    pub tasks: Vec<CrowdsourcingTask>,
    pub actions: Vec<ActionUnit>,
    names: HashMap<String, UnitRef>,
    pub base_dir: PathBuf,
}

impl SequencePlan {
    /// Construct every unit and verify the connections between them.
    pub fn new(pipeline: LoadedPipeline) -> Result<Self> {
        info!("Creating a task sequence for pipeline {}", pipeline.name);

        let base_dir = pipeline.base_dir.clone();
        let mut tasks = Vec::with_capacity(pipeline.tasks.len());
        for (kind, config) in pipeline.tasks {
            tasks.push(CrowdsourcingTask::new(kind, config, &base_dir)?);
        }

        let mut actions = Vec::with_capacity(pipeline.actions.len());
        for config in pipeline.actions {
            let unit = match config {
                ActionConfig::Forward(c) => ActionUnit::Forward(Forward::new(c)?),
                ActionConfig::Aggregate(c) => ActionUnit::Aggregate(Aggregate::new(c)?),
                ActionConfig::SeparateBboxes(c) => ActionUnit::Separate(SeparateBboxes::new(c)),
                ActionConfig::VerifyPolygon(c) => ActionUnit::Verify(VerifyPolygon::new(c)),
            };
            actions.push(unit);
        }

        let mut names = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            if names.insert(task.name.clone(), UnitRef::Task(i)).is_some() {
                bail!("The name {} is used by more than one unit in the pipeline", task.name);
            }
        }
        for (i, action) in actions.iter().enumerate() {
            if names
                .insert(action.name().to_string(), UnitRef::Action(i))
                .is_some()
            {
                bail!(
                    "The name {} is used by more than one unit in the pipeline",
                    action.name()
                );
            }
        }

        let plan = Self {
            name: pipeline.name,
            tasks,
            actions,
            names,
            base_dir,
        };
        plan.verify_connections()?;
        Ok(plan)
    }

    /// Check that every name referenced by a task or action resolves.
    fn verify_connections(&self) -> Result<()> {
        let missing = |unit: &str, key: &str, name: &str| {
            anyhow::anyhow!(
                "Cannot find a unit named {name} in the task sequence; check the name \
                 under the key '{key}' in the configuration for {unit}"
            )
        };

        for task in &self.tasks {
            let Some(actions) = &task.config.actions else { continue };

            for (key, value) in [
                ("on_result", &actions.on_result),
                ("on_submitted", &actions.on_submitted),
                ("on_accepted", &actions.on_accepted),
            ] {
                if let Some(name) = value {
                    if !self.names.contains_key(name) {
                        return Err(missing(&task.name, key, name));
                    }
                }
            }

            if let Some(name) = &actions.on_rejected {
                if name != &task.name && !self.names.contains_key(name) {
                    return Err(missing(&task.name, "on_rejected", name));
                }
            }

            if let Some(name) = &actions.on_closed {
                match self.names.get(name) {
                    Some(UnitRef::Action(i))
                        if matches!(self.actions[*i], ActionUnit::Aggregate(_)) => {}
                    Some(_) => bail!(
                        "The key 'on_closed' for {} must name an aggregate action, but {} \
                         is not one",
                        task.name,
                        name
                    ),
                    None => return Err(missing(&task.name, "on_closed", name)),
                }
            }

            if let Some(name) = &actions.data_source {
                match self.names.get(name) {
                    Some(UnitRef::Action(i))
                        if matches!(self.actions[*i], ActionUnit::Separate(_)) =>
                    {
                        let ActionUnit::Separate(separate) = &self.actions[*i] else {
                            unreachable!()
                        };
                        if separate.input_file().is_none() {
                            bail!(
                                "The action {} seeds the pool for {} but its configuration \
                                 has no data file",
                                name,
                                task.name
                            );
                        }
                    }
                    Some(_) => bail!(
                        "The key 'data_source' for {} must name a separate_bboxes action, \
                         but {} is not one",
                        task.name,
                        name
                    ),
                    None => return Err(missing(&task.name, "data_source", name)),
                }
            }
        }

        for action in &self.actions {
            match action {
                ActionUnit::Forward(forward) => {
                    for name in forward.forward_target_names() {
                        if !self.names.contains_key(name) {
                            return Err(missing(&forward.name, "on_result", name));
                        }
                    }
                }
                ActionUnit::Aggregate(aggregate) => {
                    match self.names.get(&aggregate.source) {
                        Some(UnitRef::Task(_)) => {}
                        _ => return Err(missing(&aggregate.name, "source", &aggregate.source)),
                    }
                    if let Some(forward) = &aggregate.forward {
                        match self.names.get(forward) {
                            Some(UnitRef::Action(i))
                                if matches!(self.actions[*i], ActionUnit::Forward(_)) => {}
                            _ => return Err(missing(&aggregate.name, "forward", forward)),
                        }
                    }
                }
                ActionUnit::Separate(separate) => {
                    match self.names.get(&separate.target) {
                        Some(UnitRef::Task(_)) => {}
                        _ => return Err(missing(&separate.name, "target", &separate.target)),
                    }
                }
                ActionUnit::Verify(verify) => {
                    match self.names.get(&verify.source) {
                        Some(UnitRef::Task(_)) => {}
                        _ => return Err(missing(&verify.name, "source", &verify.source)),
                    }
                    if let Some(forward) = &verify.forward {
                        match self.names.get(forward) {
                            Some(UnitRef::Action(i))
                                if matches!(self.actions[*i], ActionUnit::Forward(_)) => {}
                            _ => return Err(missing(&verify.name, "forward", forward)),
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Print a table of every pool and action in the sequence.
    pub fn print_pool_table(&self) {
        let mut rows: Vec<[String; 6]> = Vec::new();

        for task in &self.tasks {
            if let Some(training_conf) = task.config.training.as_ref().and_then(|t| t.data.as_ref())
            {
                let inputs = format_io(&training_conf.input);
                let outputs = format_io(&training_conf.output);
                rows.push([
                    task.name.clone(),
                    inputs,
                    outputs,
                    task.training
                        .as_ref()
                        .and_then(|t| t.id.clone())
                        .unwrap_or_else(|| "--".to_string()),
                    task.project
                        .as_ref()
                        .and_then(|p| p.id.clone())
                        .unwrap_or_else(|| "--".to_string()),
                    "Training".to_string(),
                ]);
            }

            rows.push([
                task.name.clone(),
                format_io(&task.config.data.input),
                format_io(&task.config.data.output),
                task.pool
                    .as_ref()
                    .and_then(|p| p.id.clone())
                    .unwrap_or_else(|| "--".to_string()),
                task.project
                    .as_ref()
                    .and_then(|p| p.id.clone())
                    .unwrap_or_else(|| "--".to_string()),
                if task.exam { "Exam" } else { "Pool" }.to_string(),
            ]);
        }

        for action in &self.actions {
            rows.push([
                action.name().to_string(),
                "--".to_string(),
                "--".to_string(),
                "--".to_string(),
                "--".to_string(),
                action.kind_label().to_string(),
            ]);
        }

        let header = ["Name", "Input", "Output", "Pool ID", "Project ID", "Type"];
        let mut widths = header.map(str::len);
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.len());
            }
        }

        let print_row = |cells: &[String; 6]| {
            let line = cells
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{:width$}", c, width = widths[i]))
                .collect::<Vec<_>>()
                .join("   ");
            println!("  {}", line);
        };

        println!();
        print_row(&header.map(String::from));
        println!("  {}", widths.map(|w| "-".repeat(w)).join("   "));
        for row in &rows {
            print_row(row);
        }
        println!();
    }
}

fn format_io(columns: &std::collections::BTreeMap<String, crate::config::DataType>) -> String {
    columns
        .iter()
        .map(|(name, ty)| format!("{} ({})", name, format!("{:?}", ty).to_lowercase()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Per-run routing context derived from the provisioned plan.
struct RunContext {
    resolved: HashMap<String, ResolvedDestination>,
    /// Event handlers per task index.
    triggers: HashMap<usize, Vec<(EventType, UnitRef)>>,
    /// Aggregate action per task index, fired on pool closure.
    on_closed: HashMap<usize, usize>,
}

/// A sequence of crowdsourcing tasks running against the platform.
pub struct TaskSequence {
    plan: SequencePlan,
    client: PlatformClient,
    options: RunOptions,
}

impl TaskSequence {
    pub fn new(plan: SequencePlan, client: PlatformClient, options: RunOptions) -> Self {
        Self {
            plan,
            client,
            options,
        }
    }

    /// Provision everything, open the pools and poll until the sequence
    /// completes.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting the task sequence {}", self.plan.name);

        self.provision().await?;
        self.plan.print_pool_table();

        let ctx = self.build_context()?;
        self.apply_self_rejection_rules().await?;
        self.seed_data_sources(&ctx).await?;
        self.open_pools().await?;

        self.poll_loop(&ctx).await?;

        info!("Successfully completed the task sequence");
        if self.options.no_exit {
            info!("Leaving pools in place (--no-exit)");
        }
        Ok(())
    }

    async fn provision(&mut self) -> Result<()> {
        let client = &self.client;
        for task in &mut self.plan.tasks {
            task.provision(client, &self.plan.base_dir, self.options.allow_low_reward)
                .await
                .with_context(|| format!("Failed to provision task {}", task.name))?;
        }
        Ok(())
    }

    /// Resolve every unit name to a pool target or an action index and
    /// compute the event-trigger table.
    fn build_context(&self) -> Result<RunContext> {
        let mut resolved = HashMap::new();
        for (name, unit) in &self.plan.names {
            let destination = match unit {
                UnitRef::Task(i) => {
                    let task = &self.plan.tasks[*i];
                    ResolvedDestination::Pool(PoolTarget {
                        name: task.name.clone(),
                        pool_id: task.pool_id()?.to_string(),
                        blocklist: task.blocklist.clone(),
                    })
                }
                UnitRef::Action(i) => ResolvedDestination::Action(*i),
            };
            resolved.insert(name.clone(), destination);
        }

        let mut triggers: HashMap<usize, Vec<(EventType, UnitRef)>> = HashMap::new();
        let mut on_closed = HashMap::new();

        for (i, task) in self.plan.tasks.iter().enumerate() {
            let Some(actions) = &task.config.actions else { continue };
            let entry = triggers.entry(i).or_default();

            if let Some(name) = &actions.on_submitted {
                entry.push((EventType::Submitted, self.plan.names[name]));
                info!("Setting up a connection from {} to {} on submission", task.name, name);
            }
            if let Some(name) = &actions.on_accepted {
                entry.push((EventType::Accepted, self.plan.names[name]));
                info!("Setting up a connection from {} to {} on acceptance", task.name, name);
            }
            if let Some(name) = &actions.on_rejected {
                if name != &task.name {
                    entry.push((EventType::Rejected, self.plan.names[name]));
                    info!("Setting up a connection from {} to {} on rejection", task.name, name);
                }
            }

            if let Some(name) = &actions.on_closed {
                let UnitRef::Action(idx) = self.plan.names[name] else {
                    unreachable!("verified during planning");
                };
                on_closed.insert(i, idx);
                info!("Results from {} will be aggregated with {}", task.name, name);
            } else if let Some(name) = &actions.on_result {
                // Completed results surface as accepted events when the
                // pool auto-accepts, as submitted events otherwise.
                let auto_accept = task
                    .pool
                    .as_ref()
                    .map(|p| p.auto_accept_solutions)
                    .unwrap_or(false);
                let event_type = if auto_accept {
                    EventType::Accepted
                } else {
                    EventType::Submitted
                };
                entry.push((event_type, self.plan.names[name]));
                info!(
                    "Tasks from {} will be forwarded with {} on result according to \
                     configuration",
                    task.name, name
                );
            }
        }

        Ok(RunContext {
            resolved,
            triggers,
            on_closed,
        })
    }

    /// Pools that route rejected work back to themselves get an
    /// overlap-raising rule so the work returns to the queue.
    async fn apply_self_rejection_rules(&mut self) -> Result<()> {
        let client = &self.client;

        for task in &mut self.plan.tasks {
            let routes_to_self = task
                .config
                .actions
                .as_ref()
                .and_then(|a| a.on_rejected.as_ref())
                .is_some_and(|name| name == &task.name);
            if !routes_to_self {
                continue;
            }

            let pool = task
                .pool
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("Task {} has no provisioned pool", task.name))?;
            pool.quality_control.add_rule(
                CollectorConfig {
                    kind: CollectorKind::AssignmentsAssessment,
                    parameters: None,
                },
                vec![RuleCondition {
                    key: "assessment_event".to_string(),
                    operator: CompareOperator::Eq,
                    value: json!("REJECT"),
                }],
                RuleAction::change_overlap(1, true),
            );

            let pool_id = pool
                .id
                .clone()
                .ok_or_else(|| anyhow::anyhow!("Pool for task {} has no id", task.name))?;
            *pool = client.update_pool(&pool_id, pool).await?;

            info!("Rejected tasks from pool {} will be re-added to the pool", task.name);
        }

        Ok(())
    }

    /// Fire actions configured as a pool's `data_source` before opening.
    async fn seed_data_sources(&mut self, ctx: &RunContext) -> Result<()> {
        let mut seeded = Vec::new();

        for task in &self.plan.tasks {
            let Some(source) = task
                .config
                .actions
                .as_ref()
                .and_then(|a| a.data_source.clone())
            else {
                continue;
            };

            let UnitRef::Action(idx) = self.plan.names[&source] else {
                unreachable!("verified during planning");
            };
            let ActionUnit::Separate(separate) = &self.plan.actions[idx] else {
                unreachable!("verified during planning");
            };

            let file = separate
                .input_file()
                .expect("verified during planning")
                .clone();
            let path = if file.is_absolute() {
                file
            } else {
                self.plan.base_dir.join(file)
            };

            let rows = load_data(&path, &separate.file_columns())?;
            let target = pool_target(&ctx.resolved, &separate.target)?;

            info!(
                "Creating new tasks in pool {} with action {}",
                separate.target, separate.name
            );

            let mut tasks = Vec::new();
            for row in &rows {
                tasks.extend(separate.tasks_from_row(row, &target)?);
            }
            self.client.create_tasks(&tasks, true, true).await?;
            seeded.push(separate.target.clone());
        }

        for name in seeded {
            let UnitRef::Task(idx) = self.plan.names[&name] else {
                unreachable!("separate targets are tasks");
            };
            self.plan.tasks[idx].has_input = true;
        }

        Ok(())
    }

    /// Open every pool that already holds tasks, and every training.
    async fn open_pools(&self) -> Result<()> {
        for task in &self.plan.tasks {
            if task.has_input {
                self.client.open_pool(task.pool_id()?).await?;
            }
            if let Some(training_id) = task.training.as_ref().and_then(|t| t.id.as_deref()) {
                self.client.open_training(training_id).await?;
            }
        }
        Ok(())
    }

    async fn poll_loop(&mut self, ctx: &RunContext) -> Result<()> {
        let task_count = self.plan.tasks.len();

        let mut assignment_observers: Vec<AssignmentsObserver> = Vec::with_capacity(task_count);
        let mut status_observers: Vec<PoolStatusObserver> = Vec::with_capacity(task_count);
        let mut analytics_observers: Vec<Option<AnalyticsObserver>> =
            Vec::with_capacity(task_count);

        for task in &self.plan.tasks {
            let pool_id = task.pool_id()?;
            assignment_observers.push(AssignmentsObserver::new(pool_id));
            status_observers.push(PoolStatusObserver::new(pool_id));

            let analytics = match (task.exam, task.config.pool.exam) {
                (true, Some(exam)) => {
                    let project_id = task
                        .project
                        .as_ref()
                        .and_then(|p| p.id.clone())
                        .unwrap_or_default();
                    Some(AnalyticsObserver::new(pool_id, project_id, exam.max_performers))
                }
                _ => None,
            };
            analytics_observers.push(analytics);

            info!("Registered observers for task {} ({})", task.name, pool_id);
        }

        let progress = MultiProgress::new();
        let style = ProgressStyle::with_template("{spinner:.green} {msg}")
            .expect("static progress template");
        let bars: Vec<ProgressBar> = self
            .plan
            .tasks
            .iter()
            .map(|task| {
                let bar = progress.add(ProgressBar::new_spinner());
                bar.set_style(style.clone());
                bar.set_message(format!("{}: waiting", task.name));
                bar
            })
            .collect();

        let mut queue: Vec<(usize, WorkRecord)> = Vec::new();
        let mut events_seen = vec![0usize; task_count];

        loop {
            // Assignment events; exam pools create no follow-up work.
            for i in 0..task_count {
                if self.plan.tasks[i].exam {
                    continue;
                }

                let events = assignment_observers[i].poll(&self.client).await?;
                if events.is_empty() {
                    continue;
                }
                events_seen[i] += events.len();

                if let Some(handlers) = ctx.triggers.get(&i) {
                    for (event_type, unit) in handlers {
                        let batch: Vec<AssignmentEvent> = events
                            .iter()
                            .filter(|e| e.event_type == *event_type)
                            .cloned()
                            .collect();
                        if !batch.is_empty() {
                            self.dispatch(*unit, &batch, ctx, &mut queue).await?;
                        }
                    }
                }
            }

            self.drain_queue(ctx, &mut queue).await?;

            // Pool status transitions and completion bookkeeping.
            let mut all_done = true;
            for i in 0..task_count {
                let (pool, transition) = status_observers[i].poll(&self.client).await?;

                if transition == Some(PoolTransition::Closed) {
                    if let Some(aggregate_idx) = ctx.on_closed.get(&i).copied() {
                        let pool_id = self.plan.tasks[i].pool_id()?.to_string();
                        self.run_aggregate(aggregate_idx, &pool_id, ctx, &mut queue)
                            .await?;
                    }
                }

                if let Some(reason) = pool.last_close_reason {
                    if !matches!(reason, CloseReason::Completed | CloseReason::Manual) {
                        warn!(
                            "Pool {} closed with reason {:?}",
                            self.plan.tasks[i].name, reason
                        );
                    }
                }

                let done = !pool.is_open();
                if !done {
                    all_done = false;
                }

                bars[i].set_message(format!(
                    "{}: {} · {} assignment events",
                    self.plan.tasks[i].name,
                    pool.status
                        .map(|s| format!("{:?}", s).to_lowercase())
                        .unwrap_or_else(|| "unknown".to_string()),
                    events_seen[i],
                ));
                bars[i].tick();
            }

            // Exam pools close themselves once enough workers submitted.
            for observer in analytics_observers.iter_mut().flatten() {
                observer.poll(&self.client).await?;
            }

            let aggregates_done = self
                .plan
                .actions
                .iter()
                .all(|a| !matches!(a, ActionUnit::Aggregate(agg) if !agg.complete));

            if all_done && aggregates_done && queue.is_empty() {
                info!(
                    "All pools look complete; re-checking in {:?}",
                    self.options.completion_grace
                );
                tokio::time::sleep(self.options.completion_grace).await;

                if self.recheck_completion().await? {
                    break;
                }
                debug!("A pool reopened during the grace period; continuing");
            }

            tokio::time::sleep(self.options.poll_interval).await;
        }

        self.close_trainings().await?;

        for (i, bar) in bars.iter().enumerate() {
            bar.finish_with_message(format!("{}: complete", self.plan.tasks[i].name));
        }

        Ok(())
    }

    /// Deliver an event batch to a task pool or an action.
    async fn dispatch(
        &self,
        unit: UnitRef,
        events: &[AssignmentEvent],
        ctx: &RunContext,
        queue: &mut Vec<(usize, WorkRecord)>,
    ) -> Result<()> {
        match unit {
            UnitRef::Task(idx) => self.plan.tasks[idx].receive_events(&self.client, events).await,
            UnitRef::Action(idx) => match &self.plan.actions[idx] {
                ActionUnit::Forward(forward) => {
                    let plan = forward.plan_for_events(events, &ctx.resolved);
                    self.execute_plan(&forward.name, plan, queue).await
                }
                ActionUnit::Verify(verify) => {
                    let records = verify.verdicts(events);
                    match &verify.forward {
                        Some(name) => self.feed_forward(name, &records, ctx, queue).await,
                        None => Ok(()),
                    }
                }
                ActionUnit::Separate(separate) => {
                    let target = pool_target(&ctx.resolved, &separate.target)?;
                    info!(
                        "Creating new tasks in pool {} with action {}",
                        separate.target, separate.name
                    );
                    let tasks = separate.tasks_from_events(events, &target)?;
                    self.client.create_tasks(&tasks, true, true).await?;
                    Ok(())
                }
                ActionUnit::Aggregate(aggregate) => {
                    warn!(
                        "Aggregate action {} runs on pool closure and cannot consume \
                         assignment events",
                        aggregate.name
                    );
                    Ok(())
                }
            },
        }
    }

    /// Feed records into a forward action by name.
    async fn feed_forward(
        &self,
        name: &str,
        records: &[WorkRecord],
        ctx: &RunContext,
        queue: &mut Vec<(usize, WorkRecord)>,
    ) -> Result<()> {
        let Some(UnitRef::Action(idx)) = self.plan.names.get(name).copied() else {
            bail!("No forward action named {name} in the sequence");
        };
        let ActionUnit::Forward(forward) = &self.plan.actions[idx] else {
            bail!("Unit {name} is not a forward action");
        };

        let plan = forward.plan_for_records(records, &ctx.resolved);
        self.execute_plan(&forward.name, plan, queue).await
    }

    /// Execute one routing plan against the platform.
    async fn execute_plan(
        &self,
        action_name: &str,
        plan: RoutePlan,
        queue: &mut Vec<(usize, WorkRecord)>,
    ) -> Result<()> {
        if plan.is_empty() {
            if plan.ignored > 0 {
                debug!("{} dropped {} outputs with no route", action_name, plan.ignored);
            }
            return Ok(());
        }

        for acceptance in &plan.accepts {
            self.client
                .accept_assignment(&acceptance.assignment_id, &acceptance.public_comment)
                .await?;
            info!("Accepted assignment {}", acceptance.assignment_id);
        }

        for acceptance in &plan.rejects {
            self.client
                .reject_assignment(&acceptance.assignment_id, &acceptance.public_comment)
                .await?;
            info!("Rejected assignment {}", acceptance.assignment_id);
        }

        if !plan.new_tasks.is_empty() {
            self.client.create_tasks(&plan.new_tasks, true, true).await?;
            info!(
                "Successfully forwarded {} {} with {}",
                plan.new_tasks.len(),
                if plan.new_tasks.len() > 1 { "tasks" } else { "task" },
                action_name,
            );
        }

        queue.extend(plan.chained);
        Ok(())
    }

    /// Hand queued records to their chained actions until the queue dries.
    async fn drain_queue(
        &self,
        ctx: &RunContext,
        queue: &mut Vec<(usize, WorkRecord)>,
    ) -> Result<()> {
        let mut processed = 0;

        while let Some((idx, record)) = queue.pop() {
            processed += 1;
            if processed > MAX_CHAINED_RECORDS {
                bail!("Routing records between actions does not terminate; check the pipeline for cycles");
            }

            match &self.plan.actions[idx] {
                ActionUnit::Separate(separate) => {
                    let target = pool_target(&ctx.resolved, &separate.target)?;
                    info!(
                        "Creating new tasks in pool {} with action {}",
                        separate.target, separate.name
                    );
                    let tasks = separate.tasks_from_record(&record, &target)?;
                    self.client.create_tasks(&tasks, true, true).await?;
                }
                ActionUnit::Forward(forward) => {
                    let plan =
                        forward.plan_for_records(std::slice::from_ref(&record), &ctx.resolved);
                    self.execute_plan(&forward.name, plan, queue).await?;
                }
                other => warn!(
                    "Action {} cannot consume forwarded records; dropping one",
                    other.name()
                ),
            }
        }

        Ok(())
    }

    /// Aggregate a closed pool and feed the results onward.
    async fn run_aggregate(
        &mut self,
        aggregate_idx: usize,
        pool_id: &str,
        ctx: &RunContext,
        queue: &mut Vec<(usize, WorkRecord)>,
    ) -> Result<()> {
        let assignments = self
            .client
            .get_assignments(
                pool_id,
                &[AssignmentStatus::Submitted, AssignmentStatus::Accepted],
            )
            .await?;

        let (records, forward, name) = {
            let ActionUnit::Aggregate(aggregate) = &mut self.plan.actions[aggregate_idx] else {
                bail!("Unit at index {aggregate_idx} is not an aggregate action");
            };

            let votes = aggregate.collect(&assignments);
            let records = if votes.is_empty() {
                Vec::new()
            } else {
                aggregate.aggregate(&votes)
            };
            aggregate.complete = true;
            (records, aggregate.forward.clone(), aggregate.name.clone())
        };

        info!(
            "Finished aggregating {} submitted assignments with {}",
            records.len(),
            name
        );

        if records.is_empty() {
            return Ok(());
        }

        match forward {
            Some(forward_name) => self.feed_forward(&forward_name, &records, ctx, queue).await,
            None => Ok(()),
        }
    }

    /// After the grace period, confirm every pool is still not open.
    async fn recheck_completion(&self) -> Result<bool> {
        let fetches = self
            .plan
            .tasks
            .iter()
            .map(|task| Ok(self.client.get_pool(task.pool_id()?)))
            .collect::<Result<Vec<_>>>()?;

        let pools = try_join_all(fetches).await?;
        Ok(pools.iter().all(|pool| !pool.is_open()))
    }

    /// Close any trainings left open once the sequence is done.
    async fn close_trainings(&self) -> Result<()> {
        for task in &self.plan.tasks {
            let Some(training_id) = task.training.as_ref().and_then(|t| t.id.as_deref()) else {
                continue;
            };
            let training = self.client.get_training(training_id).await?;
            if training.status == Some(crate::platform::types::PoolStatus::Open) {
                self.client.close_training(training_id).await?;
                info!("Closed training pool with ID {}", training_id);
            }
        }
        Ok(())
    }
}

fn pool_target(
    resolved: &HashMap<String, ResolvedDestination>,
    name: &str,
) -> Result<PoolTarget> {
    match resolved.get(name) {
        Some(ResolvedDestination::Pool(target)) => Ok(target.clone()),
        Some(ResolvedDestination::Action(_)) => {
            bail!("Unit {name} is an action, but a pool target was expected")
        }
        None => bail!("No unit named {name} in the sequence"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionConfig, LoadedPipeline, TaskConfig, TaskKind};

    fn task_yaml(name: &str, actions: &str) -> TaskConfig {
        serde_yaml::from_str(&format!(
            r#"
name: {name}
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
    public_name: "P"
    public_description: "P"
pool:
  estimated_time_per_suite: 30
  setup:
    private_name: "P"
    reward_per_assignment: 0.15
    assignment_max_duration_seconds: 600
  defaults:
    default_overlap_for_new_task_suites: 1
    default_overlap_for_new_tasks: 1
  mixer:
    real_tasks_count: 1
    golden_tasks_count: 0
    training_tasks_count: 0
{actions}
"#
        ))
        .unwrap()
    }

    fn forward_action(name: &str, target: &str) -> ActionConfig {
        ActionConfig::Forward(
            serde_yaml::from_str(&format!(
                r#"
name: {name}
data: result
on_result:
  "true": {target}
  "false":
"#
            ))
            .unwrap(),
        )
    }

    fn pipeline(tasks: Vec<TaskConfig>, actions: Vec<ActionConfig>) -> LoadedPipeline {
        LoadedPipeline {
            name: "test".to_string(),
            tasks: tasks
                .into_iter()
                .map(|t| (TaskKind::ImageClassification, t))
                .collect(),
            actions,
            base_dir: PathBuf::from("."),
        }
    }

    #[test]
    fn test_plan_resolves_connections() {
        let plan = SequencePlan::new(pipeline(
            vec![
                task_yaml("detect", "actions:\n  on_result: forward_detect"),
                task_yaml("outline", ""),
            ],
            vec![forward_action("forward_detect", "outline")],
        ))
        .unwrap();

        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.names["detect"], UnitRef::Task(0));
        assert_eq!(plan.names["forward_detect"], UnitRef::Action(0));
    }

    #[test]
    fn test_plan_rejects_dangling_handler() {
        let err = SequencePlan::new(pipeline(
            vec![task_yaml("detect", "actions:\n  on_result: nonexistent")],
            vec![],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_plan_rejects_dangling_forward_target() {
        let err = SequencePlan::new(pipeline(
            vec![task_yaml("detect", "actions:\n  on_result: forward_detect")],
            vec![forward_action("forward_detect", "outline")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("outline"));
    }

    #[test]
    fn test_plan_rejects_duplicate_names() {
        let err = SequencePlan::new(pipeline(
            vec![task_yaml("detect", ""), task_yaml("detect", "")],
            vec![],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("more than one unit"));
    }

    #[test]
    fn test_plan_allows_self_rejection_route() {
        let plan = SequencePlan::new(pipeline(
            vec![task_yaml("detect", "actions:\n  on_rejected: detect")],
            vec![],
        ))
        .unwrap();
        assert_eq!(plan.tasks.len(), 1);
    }

    #[test]
    fn test_on_closed_must_be_aggregate() {
        let err = SequencePlan::new(pipeline(
            vec![
                task_yaml("detect", "actions:\n  on_closed: forward_detect"),
                task_yaml("outline", ""),
            ],
            vec![forward_action("forward_detect", "outline")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("aggregate"));
    }

    #[test]
    fn test_aggregate_source_must_be_task() {
        let aggregate: ActionConfig = ActionConfig::Aggregate(
            serde_yaml::from_str(
                r#"
name: aggregate_detect
source: missing
method: majority_vote
data:
  input: url
  output: result
"#,
            )
            .unwrap(),
        );

        let err = SequencePlan::new(pipeline(vec![task_yaml("detect", "")], vec![aggregate]))
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
