//! TOML work plans: the agents to hire and the tasks to submit

use ai_agent_common::{NewTask, TaskId};
use ai_agent_coordinator::DependencyGraph;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub agents: Vec<PlanAgent>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanAgent {
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub role: Option<String>,
    /// Shell command run by the worker backend
    #[serde(default)]
    pub command: Option<String>,
}

impl PlanTask {
    pub fn to_new_task(&self) -> NewTask {
        let mut task = NewTask::new(&self.description)
            .with_id(self.id.as_str())
            .depends_on(self.depends_on.iter().map(String::as_str))
            .with_priority(self.priority)
            .with_files(self.files.iter().cloned());
        task.role = self.role.clone();
        task.payload = self.command.clone();
        task
    }
}

impl Plan {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid plan {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let plan: Plan = toml::from_str(content).context("Failed to parse plan")?;
        plan.validate()?;
        Ok(plan)
    }

    /// Reject duplicate names, dangling dependencies and cycles
    pub fn validate(&self) -> Result<()> {
        let mut agents = HashSet::new();
        for agent in &self.agents {
            if !agents.insert(agent.name.as_str()) {
                bail!("agent '{}' is listed twice", agent.name);
            }
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                bail!("task '{}' is listed twice", task.id);
            }
        }

        let mut graph = DependencyGraph::new();
        for task in &self.tasks {
            let id = TaskId::from(task.id.as_str());
            graph.ensure_node(&id);
            for dep in &task.depends_on {
                if !ids.contains(dep.as_str()) {
                    bail!("task '{}' depends on unknown task '{}'", task.id, dep);
                }
                let dep = TaskId::from(dep.as_str());
                if graph.would_cycle(&id, &dep) {
                    bail!("dependency {} -> {} closes a cycle", task.id, dep);
                }
                graph.add_edge(&id, &dep);
            }
        }

        if !self.agents.is_empty() {
            for task in &self.tasks {
                let Some(role) = task.role.as_deref() else {
                    continue;
                };
                if !self.agents.iter().any(|a| a.role == role) {
                    bail!("no agent has role '{}' needed by task '{}'", role, task.id);
                }
            }
        }
        Ok(())
    }

    pub fn new_tasks(&self) -> Vec<NewTask> {
        self.tasks.iter().map(PlanTask::to_new_task).collect()
    }
}
