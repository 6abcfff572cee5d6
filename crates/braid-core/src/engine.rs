//! The engine: wiring for store, gateway, event bus, workspace manager,
//! and configuration, plus the strand/goal/task CRUD the request surface
//! dispatches to.
//!
//! Mutations follow the store discipline from the concurrency model:
//! load snapshot, mutate, save, release the lock, then perform external
//! (gateway/git) calls, then optionally reload-modify-save. No suspension
//! point is ever held while the store lock is held.

use std::collections::VecDeque;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use braid_store::{
    AutonomyMode, CascadeMode, Clock, Goal, GoalStatus, Store, Strand, SystemClock, Task,
    TaskStatus, WorkspaceMeta, WorktreeMeta,
};

use crate::classify::{Classifier, KeywordClassifier};
use crate::config::EngineConfig;
use crate::events::{Event, EventBus};
use crate::gateway::Gateway;
use crate::workspace::WorkspaceManager;

/// Ring-buffer cap for per-session plan logs.
pub(crate) const PLAN_LOG_CAP: usize = 200;

/// The orchestration engine. One per process.
pub struct Engine {
    pub(crate) store: Arc<Store>,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) classifier: Arc<dyn Classifier>,
    pub(crate) events: EventBus,
    pub(crate) workspace: Option<WorkspaceManager>,
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    /// Per-session plan-log ring buffers, keyed by session key.
    pub(crate) plan_logs: Mutex<HashMap<String, VecDeque<String>>>,
    pub(crate) shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Arc<Store>, gateway: Arc<dyn Gateway>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventBus::new(Some(store.data_dir()), Arc::clone(&clock));
        let workspace = config
            .workspaces_dir
            .as_ref()
            .map(|dir| WorkspaceManager::new(dir.clone()));
        Self {
            store,
            gateway,
            classifier: Arc::new(KeywordClassifier),
            events,
            workspace,
            config,
            clock,
            plan_logs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.events = EventBus::new(Some(self.store.data_dir()), Arc::clone(&clock));
        self.clock = clock;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workspace(&self) -> Option<&WorkspaceManager> {
        self.workspace.as_ref()
    }

    /// Signal background timers (delayed kickoffs) to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // -------------------------------------------------------------------
    // Strand CRUD
    // -------------------------------------------------------------------

    /// Create a strand, provisioning its git workspace when the engine has
    /// a workspaces directory.
    pub async fn create_strand(&self, params: NewStrand) -> Result<Strand> {
        let id = self.store.new_id("strand");
        let clock = Arc::clone(&self.clock);

        let strand = {
            let params = params.clone();
            let id = id.clone();
            self.store
                .update(move |data| {
                    let mut strand = Strand::new(id, params.name, clock.as_ref());
                    strand.description = params.description.unwrap_or_default();
                    strand.color = params.color;
                    strand.keywords = params.keywords;
                    strand.topic_ids = params.topic_ids;
                    if let Some(mode) = params.cascade_mode {
                        strand.cascade_mode = mode;
                    }
                    if let Some(mode) = params.autonomy_mode {
                        strand.autonomy_mode = mode;
                    }
                    data.strands.push(strand.clone());
                    Ok(strand)
                })
                .await?
        };

        // Git work happens outside the store lock.
        if let Some(manager) = self.workspace.clone() {
            let name = strand.name.clone();
            let strand_id = strand.id.clone();
            let repo_url = params.repo_url.clone();
            let created = tokio::task::spawn_blocking(move || {
                manager.create_strand_workspace(&strand_id, &name, repo_url.as_deref())
            })
            .await
            .context("workspace task panicked")?;

            match created {
                Ok(ws) => {
                    let path = ws.path.to_string_lossy().to_string();
                    let repo_url = params.repo_url.clone();
                    let clock = Arc::clone(&self.clock);
                    let id = strand.id.clone();
                    return self
                        .store
                        .update(move |data| {
                            let strand = data
                                .strand_mut(&id)
                                .context("strand vanished during workspace creation")?;
                            strand.workspace = Some(WorkspaceMeta { path, repo_url });
                            strand.touch(clock.as_ref());
                            Ok(strand.clone())
                        })
                        .await;
                }
                Err(e) => {
                    tracing::warn!(strand_id = %strand.id, error = %e, "workspace creation failed");
                }
            }
        }

        Ok(strand)
    }

    pub async fn update_strand(&self, strand_id: &str, patch: StrandPatch) -> Result<Strand> {
        let clock = Arc::clone(&self.clock);
        let strand_id = strand_id.to_owned();
        self.store
            .update(move |data| {
                let strand = data
                    .strand_mut(&strand_id)
                    .with_context(|| format!("strand {strand_id} not found"))?;
                if let Some(name) = patch.name {
                    strand.name = name;
                }
                if let Some(description) = patch.description {
                    strand.description = description;
                }
                if let Some(color) = patch.color {
                    strand.color = Some(color);
                }
                if let Some(keywords) = patch.keywords {
                    strand.keywords = keywords;
                }
                if let Some(mode) = patch.cascade_mode {
                    strand.cascade_mode = mode;
                }
                if let Some(mode) = patch.autonomy_mode {
                    strand.autonomy_mode = mode;
                }
                strand.touch(clock.as_ref());
                Ok(strand.clone())
            })
            .await
    }

    /// Delete a strand: kill its sessions, cascade-delete its goals, and
    /// remove its workspace directory.
    pub async fn delete_strand(self: &Arc<Self>, strand_id: &str) -> Result<Vec<String>> {
        let killed = self.kill_for_strand(strand_id).await?;

        let strand_id_owned = strand_id.to_owned();
        let workspace_path = self
            .store
            .update(move |data| {
                let Some(pos) = data.strands.iter().position(|s| s.id == strand_id_owned) else {
                    bail!("strand {strand_id_owned} not found");
                };
                let strand = data.strands.remove(pos);
                data.goals
                    .retain(|g| g.strand_id.as_deref() != Some(strand_id_owned.as_str()));
                let remaining: std::collections::HashSet<String> =
                    data.goals.iter().map(|g| g.id.clone()).collect();
                data.session_index
                    .retain(|_, r| remaining.contains(&r.goal_id));
                data.session_strand_index
                    .retain(|_, sid| *sid != strand_id_owned);
                Ok(strand.workspace.map(|ws| ws.path))
            })
            .await?;

        if let (Some(manager), Some(path)) = (self.workspace.clone(), workspace_path) {
            let result = tokio::task::spawn_blocking(move || {
                manager.remove_strand_workspace(std::path::Path::new(&path))
            })
            .await
            .context("workspace task panicked")?;
            if let Err(e) = result {
                tracing::warn!(strand_id = %strand_id, error = %e, "workspace removal failed");
            }
        }

        Ok(killed)
    }

    // -------------------------------------------------------------------
    // Goal CRUD
    // -------------------------------------------------------------------

    /// Create a goal. When the owning strand has a workspace, a worktree
    /// on a fresh `goal/...` branch is provisioned for it.
    pub async fn create_goal(&self, params: NewGoal) -> Result<Goal> {
        let id = self.store.new_id("goal");
        let clock = Arc::clone(&self.clock);

        let goal = {
            let id = id.clone();
            let params = params.clone();
            self.store
                .update(move |data| {
                    if let Some(strand_id) = &params.strand_id {
                        if data.strand(strand_id).is_none() {
                            bail!("strand {strand_id} not found");
                        }
                        for dep in &params.depends_on {
                            match data.goal(dep) {
                                Some(g) if g.strand_id.as_deref() == Some(strand_id) => {}
                                Some(_) => bail!("dependency {dep} is in a different strand"),
                                None => bail!("dependency {dep} not found"),
                            }
                        }
                    } else if !params.depends_on.is_empty() {
                        bail!("goal dependencies require a strand");
                    }

                    let mut goal = Goal::new(id, params.title, clock.as_ref());
                    goal.description = params.description.unwrap_or_default();
                    goal.strand_id = params.strand_id;
                    goal.phase = params.phase;
                    goal.depends_on = params.depends_on;
                    if let Some(mode) = params.cascade_mode {
                        goal.cascade_mode = mode;
                    }
                    goal.autonomy_mode = params.autonomy_mode;
                    if let Some(max) = params.max_retries {
                        goal.max_retries = max;
                    }
                    data.goals.push(goal.clone());
                    Ok(goal)
                })
                .await?
        };

        self.provision_goal_worktree(&goal.id).await;
        let data = self.store.snapshot().await;
        Ok(data.goal(&goal.id).cloned().unwrap_or(goal))
    }

    /// Create the worktree for a goal if its strand has a workspace.
    /// Best-effort: failures are logged, the goal stays worktree-less.
    pub(crate) async fn provision_goal_worktree(&self, goal_id: &str) {
        let Some(manager) = self.workspace.clone() else {
            return;
        };
        let data = self.store.snapshot().await;
        let Some(goal) = data.goal(goal_id) else {
            return;
        };
        if goal.worktree.is_some() {
            return;
        }
        let Some(ws_path) = goal
            .strand_id
            .as_ref()
            .and_then(|sid| data.strand(sid))
            .and_then(|s| s.workspace.as_ref())
            .map(|ws| ws.path.clone())
        else {
            return;
        };

        let goal_id_owned = goal_id.to_owned();
        let title = goal.title.clone();
        let created = tokio::task::spawn_blocking(move || {
            manager.create_goal_worktree(
                std::path::Path::new(&ws_path),
                &goal_id_owned,
                Some(&title),
            )
        })
        .await;

        match created {
            Ok(Ok(wt)) => {
                let clock = Arc::clone(&self.clock);
                let goal_id_owned = goal_id.to_owned();
                let result = self
                    .store
                    .update(move |data| {
                        let goal = data
                            .goal_mut(&goal_id_owned)
                            .context("goal vanished during worktree creation")?;
                        goal.worktree = Some(WorktreeMeta {
                            path: wt.path.to_string_lossy().to_string(),
                            branch: wt.branch,
                        });
                        goal.touch(clock.as_ref());
                        Ok(())
                    })
                    .await;
                if let Err(e) = result {
                    tracing::warn!(goal_id = %goal_id, error = %e, "failed to record worktree");
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(goal_id = %goal_id, error = %e, "worktree creation failed");
            }
            Err(e) => {
                tracing::warn!(goal_id = %goal_id, error = %e, "worktree task panicked");
            }
        }
    }

    pub async fn update_goal(&self, goal_id: &str, patch: GoalPatch) -> Result<Goal> {
        let clock = Arc::clone(&self.clock);
        let goal_id = goal_id.to_owned();
        self.store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id)
                    .with_context(|| format!("goal {goal_id} not found"))?;
                if let Some(title) = patch.title {
                    goal.title = title;
                }
                if let Some(description) = patch.description {
                    goal.description = description;
                }
                if let Some(status) = patch.status {
                    if status == GoalStatus::Done {
                        for task in &mut goal.tasks {
                            if !matches!(task.status, TaskStatus::Done | TaskStatus::Failed) {
                                task.set_status(TaskStatus::Failed, clock.as_ref());
                            }
                        }
                    }
                    goal.set_status(status, clock.as_ref());
                }
                if let Some(mode) = patch.autonomy_mode {
                    goal.autonomy_mode = Some(mode);
                }
                if let Some(max) = patch.max_retries {
                    goal.max_retries = max;
                }
                goal.touch(clock.as_ref());
                Ok(goal.clone())
            })
            .await
    }

    /// Delete a goal: kill its sessions, remove its worktree, drop it.
    pub async fn delete_goal(self: &Arc<Self>, goal_id: &str) -> Result<Vec<String>> {
        let killed = self.kill_for_goal(goal_id).await?;
        let goal_id_owned = goal_id.to_owned();
        let worktree = self
            .store
            .update(move |data| {
                let Some(pos) = data.goals.iter().position(|g| g.id == goal_id_owned) else {
                    bail!("goal {goal_id_owned} not found");
                };
                let goal = data.goals.remove(pos);
                data.session_index.retain(|_, r| r.goal_id != goal_id_owned);
                Ok(goal
                    .worktree
                    .map(|wt| (goal.strand_id, wt.path)))
            })
            .await?;

        self.remove_worktree_dir(worktree).await;
        self.events.broadcast(Event::GoalDeleted {
            goal_id: goal_id.to_owned(),
        });
        Ok(killed)
    }

    /// Close a goal: kill sessions, remove the worktree (the branch stays),
    /// and mark it done.
    pub async fn close_goal(self: &Arc<Self>, goal_id: &str) -> Result<Vec<String>> {
        let killed = self.kill_for_goal(goal_id).await?;
        let clock = Arc::clone(&self.clock);
        let goal_id_owned = goal_id.to_owned();
        let worktree = self
            .store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?;
                // Settle still-open tasks so the done-goal invariant holds.
                for task in &mut goal.tasks {
                    if !matches!(task.status, TaskStatus::Done | TaskStatus::Failed) {
                        task.set_status(TaskStatus::Failed, clock.as_ref());
                    }
                }
                goal.set_status(GoalStatus::Done, clock.as_ref());
                goal.closed_at_ms = Some(clock.now_ms());
                let worktree = goal.worktree.take();
                Ok(worktree.map(|wt| (goal.strand_id.clone(), wt.path)))
            })
            .await?;

        self.remove_worktree_dir(worktree).await;
        self.events.broadcast(Event::GoalClosed {
            goal_id: goal_id.to_owned(),
        });
        Ok(killed)
    }

    async fn remove_worktree_dir(&self, worktree: Option<(Option<String>, String)>) {
        let Some((strand_id, wt_path)) = worktree else {
            return;
        };
        let Some(manager) = self.workspace.clone() else {
            return;
        };
        let data = self.store.snapshot().await;
        let ws_path = strand_id
            .as_ref()
            .and_then(|sid| data.strand(sid))
            .and_then(|s| s.workspace.as_ref())
            .map(|ws| ws.path.clone());
        let Some(ws_path) = ws_path else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || {
            manager.remove_goal_worktree(
                std::path::Path::new(&ws_path),
                std::path::Path::new(&wt_path),
            )
        })
        .await;
        if let Ok(Err(e)) = result {
            tracing::warn!(error = %e, "worktree removal failed");
        }
    }

    /// Attach an externally-created session to a goal.
    pub async fn attach_session(&self, goal_id: &str, session_key: &str) -> Result<()> {
        let clock = Arc::clone(&self.clock);
        let goal_id = goal_id.to_owned();
        let session_key = session_key.to_owned();
        self.store
            .update(move |data| {
                if data.session_strand_index.contains_key(&session_key) {
                    bail!("session {session_key} is already strand-bound");
                }
                let goal = data
                    .goal_mut(&goal_id)
                    .with_context(|| format!("goal {goal_id} not found"))?;
                if !goal.sessions.contains(&session_key) {
                    goal.sessions.push(session_key.clone());
                }
                goal.touch(clock.as_ref());
                data.session_index.insert(
                    session_key,
                    braid_store::SessionRef {
                        goal_id: goal_id.clone(),
                    },
                );
                Ok(())
            })
            .await
    }

    // -------------------------------------------------------------------
    // Task CRUD
    // -------------------------------------------------------------------

    pub async fn add_task(&self, goal_id: &str, spec: NewTask) -> Result<Task> {
        let id = self.store.new_id("task");
        let clock = Arc::clone(&self.clock);
        let goal_id = goal_id.to_owned();
        self.store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id)
                    .with_context(|| format!("goal {goal_id} not found"))?;
                for dep in &spec.depends_on {
                    if goal.task(dep).is_none() {
                        bail!("task dependency {dep} is not a sibling in goal {goal_id}");
                    }
                }
                let mut task = Task::new(id, spec.text, clock.as_ref());
                task.description = spec.description.unwrap_or_default();
                if let Some(agent) = spec.agent {
                    task.assigned_agent = agent;
                }
                task.model = spec.model;
                task.priority = spec.priority;
                task.depends_on = spec.depends_on;
                task.estimated_time = spec.estimated_time;
                goal.tasks.push(task.clone());
                // A fresh task reopens a finished goal.
                if goal.status == GoalStatus::Done {
                    goal.set_status(GoalStatus::Active, clock.as_ref());
                }
                goal.touch(clock.as_ref());
                Ok(task)
            })
            .await
    }

    pub async fn update_task(&self, goal_id: &str, task_id: &str, patch: TaskPatch) -> Result<Task> {
        let clock = Arc::clone(&self.clock);
        let goal_id = goal_id.to_owned();
        let task_id = task_id.to_owned();
        self.store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id)
                    .with_context(|| format!("goal {goal_id} not found"))?;
                let task = goal
                    .task_mut(&task_id)
                    .with_context(|| format!("task {task_id} not found in goal {goal_id}"))?;
                if let Some(text) = patch.text {
                    task.text = text;
                }
                if let Some(description) = patch.description {
                    task.description = description;
                }
                let mut reactivated = false;
                if let Some(status) = patch.status {
                    task.set_status(status, clock.as_ref());
                    reactivated = !matches!(status, TaskStatus::Done | TaskStatus::Failed);
                }
                if let Some(summary) = patch.summary {
                    task.summary = Some(summary);
                }
                if let Some(agent) = patch.agent {
                    task.assigned_agent = agent;
                }
                if let Some(priority) = patch.priority {
                    task.priority = Some(priority);
                }
                task.touch(clock.as_ref());
                let task = task.clone();
                // Reopening a task reopens a finished goal.
                if reactivated && goal.status == GoalStatus::Done {
                    goal.set_status(GoalStatus::Active, clock.as_ref());
                }
                goal.touch(clock.as_ref());
                Ok(task)
            })
            .await
    }

    /// Delete a task. The task's session (if any) is aborted best-effort:
    /// deleting a task does not by itself destroy the session, but the
    /// lifecycle manager issues an abort.
    pub async fn delete_task(&self, goal_id: &str, task_id: &str) -> Result<()> {
        let clock = Arc::clone(&self.clock);
        let goal_id_owned = goal_id.to_owned();
        let task_id_owned = task_id.to_owned();
        let session_key = self
            .store
            .update(move |data| {
                let goal = data
                    .goal_mut(&goal_id_owned)
                    .with_context(|| format!("goal {goal_id_owned} not found"))?;
                let Some(pos) = goal.tasks.iter().position(|t| t.id == task_id_owned) else {
                    bail!("task {task_id_owned} not found in goal {goal_id_owned}");
                };
                let task = goal.tasks.remove(pos);
                for t in &mut goal.tasks {
                    t.depends_on.retain(|d| *d != task_id_owned);
                }
                goal.touch(clock.as_ref());
                if let Some(key) = &task.session_key {
                    goal.sessions.retain(|s| s != key);
                    data.session_index.remove(key);
                }
                Ok(task.session_key)
            })
            .await?;

        if let Some(key) = session_key {
            if let Err(e) = self.gateway.chat_abort(&key).await {
                tracing::warn!(session_key = %key, error = %e, "abort after task delete failed");
            }
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------
// Parameter structs
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct NewStrand {
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub keywords: Vec<String>,
    pub topic_ids: Vec<String>,
    pub repo_url: Option<String>,
    pub cascade_mode: Option<CascadeMode>,
    pub autonomy_mode: Option<AutonomyMode>,
}

#[derive(Debug, Clone, Default)]
pub struct StrandPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub cascade_mode: Option<CascadeMode>,
    pub autonomy_mode: Option<AutonomyMode>,
}

#[derive(Debug, Clone, Default)]
pub struct NewGoal {
    pub title: String,
    pub description: Option<String>,
    pub strand_id: Option<String>,
    pub phase: Option<u32>,
    pub depends_on: Vec<String>,
    pub cascade_mode: Option<CascadeMode>,
    pub autonomy_mode: Option<AutonomyMode>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct GoalPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<GoalStatus>,
    pub autonomy_mode: Option<AutonomyMode>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub text: String,
    pub description: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub priority: Option<String>,
    pub depends_on: Vec<String>,
    pub estimated_time: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub text: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub summary: Option<String>,
    pub agent: Option<String>,
    pub priority: Option<String>,
}
