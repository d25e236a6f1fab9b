//! Minimal flow graph the agenda executes: start, task, wait state, timer,
//! join and end activities connected by sequence flows.

mod behavior;
pub mod commands;

pub use behavior::{ActivityBehavior, BehaviorRegistry, FailBehavior, LogBehavior};
pub use commands::{
    DeployCmd, GetExecutionCmd, ListDefinitionsCmd, ListExecutionsCmd, StartProcessCmd,
    TriggerExecutionCmd,
};

use crate::context::CommandContext;
use agenda_core::{new_id, EngineError, EngineResult};
use agenda_persistence::{Entity, Table};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub const EXECUTIONS: Table<Execution> = Table::new("executions");
pub const PROCESS_DEFINITIONS: Table<ProcessDefinition> = Table::new("process_definitions");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    Start,
    /// Automatic activity; runs the named behavior, if any, and moves on
    Task {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        behavior: Option<String>,
    },
    /// Stops until the execution is triggered
    Wait,
    /// Stops until a timer job fires
    Timer { duration_secs: i64 },
    /// Waits for one execution per incoming flow, then continues with one
    Join,
    End,
}

fn default_exclusive() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(flatten)]
    pub kind: ActivityKind,
    #[serde(default)]
    pub outgoing: Vec<String>,
    /// Enter this activity from a job instead of the current transaction
    #[serde(default)]
    pub async_before: bool,
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
}

impl Activity {
    pub fn new(id: impl Into<String>, kind: ActivityKind) -> Self {
        Self {
            id: id.into(),
            kind,
            outgoing: Vec::new(),
            async_before: false,
            exclusive: true,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, ActivityKind::Start)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, ActivityKind::Task { behavior: None })
    }

    pub fn service(id: impl Into<String>, behavior: impl Into<String>) -> Self {
        Self::new(
            id,
            ActivityKind::Task {
                behavior: Some(behavior.into()),
            },
        )
    }

    pub fn wait(id: impl Into<String>) -> Self {
        Self::new(id, ActivityKind::Wait)
    }

    pub fn timer(id: impl Into<String>, duration_secs: i64) -> Self {
        Self::new(id, ActivityKind::Timer { duration_secs })
    }

    pub fn join(id: impl Into<String>) -> Self {
        Self::new(id, ActivityKind::Join)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, ActivityKind::End)
    }

    /// Add a sequence flow to `target`
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.outgoing.push(target.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.async_before = true;
        self
    }

    pub fn non_exclusive(mut self) -> Self {
        self.exclusive = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// `key:version`, assigned on deployment
    #[serde(default)]
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub activities: Vec<Activity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl Entity for ProcessDefinition {
    fn id(&self) -> &str {
        &self.id
    }
}

impl ProcessDefinition {
    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.activities.iter().find(|a| a.id == id)
    }

    pub fn initial_activity(&self) -> EngineResult<&Activity> {
        self.activities
            .iter()
            .find(|a| a.kind == ActivityKind::Start)
            .ok_or_else(|| {
                EngineError::Validation(format!("process '{}' has no start activity", self.key))
            })
    }

    /// Ids of the activities with a flow into `id`
    pub fn incoming(&self, id: &str) -> Vec<&str> {
        self.activities
            .iter()
            .filter(|a| a.outgoing.iter().any(|target| target == id))
            .map(|a| a.id.as_str())
            .collect()
    }

    pub fn validate(&self) -> EngineResult<()> {
        let fail = |message: String| -> EngineResult<()> { Err(EngineError::Validation(message)) };
        if self.key.trim().is_empty() {
            return fail("process key must not be empty".to_string());
        }
        if self.key.contains(':') {
            return fail(format!("process key '{}' must not contain ':'", self.key));
        }

        let mut ids = HashSet::new();
        for activity in &self.activities {
            if !ids.insert(activity.id.as_str()) {
                return fail(format!("duplicate activity id '{}'", activity.id));
            }
        }

        let starts = self
            .activities
            .iter()
            .filter(|a| a.kind == ActivityKind::Start)
            .count();
        if starts != 1 {
            return fail(format!(
                "process '{}' needs exactly one start activity, found {}",
                self.key, starts
            ));
        }

        for activity in &self.activities {
            for target in &activity.outgoing {
                if !ids.contains(target.as_str()) {
                    return fail(format!(
                        "flow from '{}' points to unknown activity '{}'",
                        activity.id, target
                    ));
                }
            }
            match &activity.kind {
                ActivityKind::End if !activity.outgoing.is_empty() => {
                    return fail(format!("end activity '{}' has outgoing flows", activity.id));
                }
                ActivityKind::Start if !self.incoming(&activity.id).is_empty() => {
                    return fail(format!("start activity '{}' has incoming flows", activity.id));
                }
                ActivityKind::Timer { duration_secs } if *duration_secs < 0 => {
                    return fail(format!("timer '{}' has a negative duration", activity.id));
                }
                ActivityKind::Join if self.incoming(&activity.id).is_empty() => {
                    return fail(format!("join '{}' has no incoming flows", activity.id));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Fluent construction of a [`ProcessDefinition`] prior to deployment.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    definition: ProcessDefinition,
}

impl ProcessBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            definition: ProcessDefinition {
                id: String::new(),
                key: key.into(),
                version: 0,
                name: None,
                activities: Vec::new(),
                deployed_at: None,
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.definition.name = Some(name.into());
        self
    }

    pub fn activity(mut self, activity: Activity) -> Self {
        self.definition.activities.push(activity);
        self
    }

    pub fn build(self) -> ProcessDefinition {
        self.definition
    }
}

/// A path of control through a process instance. The process instance itself
/// is the root execution: it holds the variables and never sits in an
/// activity; its children carry the actual tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub process_instance_id: String,
    pub process_definition_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub activity_id: Option<String>,
    pub active: bool,
    pub ended: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Entity for Execution {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Execution {
    pub fn new_process_instance(
        definition: &ProcessDefinition,
        variables: BTreeMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = new_id();
        Self {
            process_instance_id: id.clone(),
            id,
            process_definition_id: definition.id.clone(),
            parent_id: None,
            activity_id: None,
            active: true,
            ended: false,
            variables,
            started_at: now,
            ended_at: None,
        }
    }

    /// New concurrent token of the same process instance, positioned at `activity_id`
    pub fn child_of(parent: &Execution, activity_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            process_instance_id: parent.process_instance_id.clone(),
            process_definition_id: parent.process_definition_id.clone(),
            parent_id: Some(parent.process_instance_id.clone()),
            activity_id: Some(activity_id.to_string()),
            active: true,
            ended: false,
            variables: BTreeMap::new(),
            started_at: now,
            ended_at: None,
        }
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }
}

pub fn find_execution(ctx: &mut CommandContext, id: &str) -> EngineResult<Execution> {
    ctx.tx()
        .find(EXECUTIONS, id)?
        .ok_or_else(|| EngineError::NotFound(format!("execution {}", id)))
}

pub fn find_definition(ctx: &mut CommandContext, id: &str) -> EngineResult<ProcessDefinition> {
    ctx.tx()
        .find(PROCESS_DEFINITIONS, id)?
        .ok_or_else(|| EngineError::NotFound(format!("process definition {}", id)))
}

pub fn latest_definition(
    ctx: &mut CommandContext,
    key: &str,
) -> EngineResult<Option<ProcessDefinition>> {
    let definitions = ctx.tx().query(PROCESS_DEFINITIONS, |d| d.key == key)?;
    Ok(definitions.into_iter().max_by_key(|d| d.version))
}

/// The activity an execution currently sits in
pub fn current_activity<'d>(
    definition: &'d ProcessDefinition,
    execution: &Execution,
) -> EngineResult<&'d Activity> {
    let activity_id = execution.activity_id.as_deref().ok_or_else(|| {
        EngineError::IllegalState(format!("execution {} is not in an activity", execution.id))
    })?;
    definition.activity(activity_id).ok_or_else(|| {
        EngineError::IllegalState(format!(
            "activity '{}' not found in {}",
            activity_id, definition.id
        ))
    })
}

/// Executions of an instance that still carry a token
pub fn active_children(
    ctx: &mut CommandContext,
    process_instance_id: &str,
) -> EngineResult<Vec<Execution>> {
    ctx.tx().query(EXECUTIONS, |e| {
        e.process_instance_id == process_instance_id && !e.is_process_instance() && !e.ended
    })
}

/// Set a variable on the process instance an execution belongs to
pub fn set_variable(
    ctx: &mut CommandContext,
    execution: &Execution,
    name: &str,
    value: serde_json::Value,
) -> EngineResult<()> {
    let mut instance = find_execution(ctx, &execution.process_instance_id)?;
    instance.variables.insert(name.to_string(), value);
    ctx.tx().update(EXECUTIONS, &instance)
}
