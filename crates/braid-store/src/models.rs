//! The persisted document model: strands, goals, tasks, and indices.
//!
//! Field names serialize in camelCase because the on-disk document (and the
//! payloads the request surface returns) use that convention. Sibling
//! references (`dependsOn`, the session indices) are by id, never by
//! pointer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Default cap on PM chat history length (oldest-first trim).
pub const DEFAULT_MAX_HISTORY: usize = 100;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Waiting,
    Done,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "waiting" => Ok(Self::Waiting),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError::new("task status", other)),
        }
    }
}

/// Overall status of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Done,
    Failed,
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for GoalStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(StatusParseError::new("goal status", other)),
        }
    }
}

/// Where a goal sits in its PM cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeState {
    AwaitingPlan,
    TasksCreated,
    PlanReady,
    ResponseSaved,
    PlanParseFailed,
    PlanFetchFailed,
}

impl fmt::Display for CascadeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingPlan => "awaiting_plan",
            Self::TasksCreated => "tasks_created",
            Self::PlanReady => "plan_ready",
            Self::ResponseSaved => "response_saved",
            Self::PlanParseFailed => "plan_parse_failed",
            Self::PlanFetchFailed => "plan_fetch_failed",
        };
        f.write_str(s)
    }
}

impl FromStr for CascadeState {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_plan" => Ok(Self::AwaitingPlan),
            "tasks_created" => Ok(Self::TasksCreated),
            "plan_ready" => Ok(Self::PlanReady),
            "response_saved" => Ok(Self::ResponseSaved),
            "plan_parse_failed" => Ok(Self::PlanParseFailed),
            "plan_fetch_failed" => Ok(Self::PlanFetchFailed),
            other => Err(StatusParseError::new("cascade state", other)),
        }
    }
}

/// Whether a PM cascade stops at a plan or goes all the way to tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CascadeMode {
    Plan,
    #[default]
    Full,
}

impl fmt::Display for CascadeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Full => "full",
        };
        f.write_str(s)
    }
}

impl FromStr for CascadeMode {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "full" => Ok(Self::Full),
            other => Err(StatusParseError::new("cascade mode", other)),
        }
    }
}

/// How aggressively an agent executes without user approval.
///
/// Resolved per task from task -> goal -> strand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    #[default]
    Plan,
    Full,
}

impl fmt::Display for AutonomyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Full => "full",
        };
        f.write_str(s)
    }
}

impl FromStr for AutonomyMode {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "full" => Ok(Self::Full),
            other => Err(StatusParseError::new("autonomy mode", other)),
        }
    }
}

/// Outcome of the goal-branch merge into the main branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    Conflict,
    Error,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Merged => "merged",
            Self::Conflict => "conflict",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for MergeStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merged" => Ok(Self::Merged),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(StatusParseError::new("merge status", other)),
        }
    }
}

/// Outcome of pushing the goal branch to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Pushed,
    Failed,
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pushed => "pushed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status of a single step in a task's streamed plan log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    #[default]
    Pending,
    Active,
    Done,
    Error,
}

impl fmt::Display for PlanStepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStepStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(StatusParseError::new("plan step status", other)),
        }
    }
}

/// Error returned when parsing an invalid status string.
#[derive(Debug, Clone)]
pub struct StatusParseError {
    kind: &'static str,
    value: String,
}

impl StatusParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------
// Value objects
// ---------------------------------------------------------------------------

/// One turn of a PM conversation kept on a strand or goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Where a strand's git workspace lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMeta {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
}

/// A goal's isolated working copy on its own branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeMeta {
    pub path: String,
    pub branch: String,
}

/// One step of a task's streamed plan log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub text: String,
    #[serde(default)]
    pub status: PlanStepStatus,
}

/// Streaming plan-log state attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Value of a `sessionIndex` entry: the goal a worker session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub goal_id: String,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A strand -- a top-level project grouping. Owns its goals and its git
/// workspace directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strand {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topic_ids: Vec<String>,
    #[serde(default)]
    pub autonomy_mode: AutonomyMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm_strand_session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pm_chat_history: Vec<ChatMessage>,
    /// Goal ids still awaiting a PM response in a strand-wide cascade.
    /// `None` when no cascade is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade_pending_goals: Option<Vec<String>>,
    #[serde(default)]
    pub cascade_mode: CascadeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm_plan_content: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Strand {
    pub fn new(id: String, name: impl Into<String>, clock: &dyn Clock) -> Self {
        let now = clock.now_ms();
        Self {
            id,
            name: name.into(),
            description: String::new(),
            color: None,
            keywords: Vec::new(),
            topic_ids: Vec::new(),
            autonomy_mode: AutonomyMode::default(),
            workspace: None,
            pm_strand_session_key: None,
            pm_chat_history: Vec::new(),
            cascade_pending_goals: None,
            cascade_mode: CascadeMode::default(),
            pm_plan_content: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn touch(&mut self, clock: &dyn Clock) {
        self.updated_at_ms = clock.now_ms();
    }

    /// Append a chat turn, trimming oldest-first at `max_history`.
    pub fn push_history(&mut self, message: ChatMessage, max_history: usize) {
        push_trimmed(&mut self.pm_chat_history, message, max_history);
    }
}

/// A goal -- one deliverable inside a strand. Owns its tasks and its git
/// worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: GoalStatus,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strand_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pm_session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pm_chat_history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade_state: Option<CascadeState>,
    #[serde(default)]
    pub cascade_mode: CascadeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomy_mode: Option<AutonomyMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_status: Option<PushStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_status: Option<MergeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at_ms: Option<i64>,
}

fn default_max_retries() -> u32 {
    1
}

impl Goal {
    pub fn new(id: String, title: impl Into<String>, clock: &dyn Clock) -> Self {
        let now = clock.now_ms();
        Self {
            id,
            title: title.into(),
            description: String::new(),
            status: GoalStatus::Active,
            completed: false,
            strand_id: None,
            phase: None,
            depends_on: Vec::new(),
            worktree: None,
            sessions: Vec::new(),
            tasks: Vec::new(),
            pm_session_key: None,
            pm_chat_history: Vec::new(),
            cascade_state: None,
            cascade_mode: CascadeMode::default(),
            autonomy_mode: None,
            push_status: None,
            merge_status: None,
            merge_error: None,
            merged_at_ms: None,
            pr_url: None,
            pr_number: None,
            max_retries: default_max_retries(),
            created_at_ms: now,
            updated_at_ms: now,
            closed_at_ms: None,
        }
    }

    pub fn touch(&mut self, clock: &dyn Clock) {
        self.updated_at_ms = clock.now_ms();
    }

    /// Set the overall status, keeping the `completed` mirror in sync.
    pub fn set_status(&mut self, status: GoalStatus, clock: &dyn Clock) {
        self.status = status;
        self.completed = status == GoalStatus::Done;
        self.touch(clock);
    }

    pub fn push_history(&mut self, message: ChatMessage, max_history: usize) {
        push_trimmed(&mut self.pm_chat_history, message, max_history);
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Ids of tasks with status `done`.
    pub fn done_task_ids(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.clone())
            .collect()
    }

    /// True when the goal has tasks and every one is `done`.
    pub fn all_tasks_done(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == TaskStatus::Done)
    }

    /// The numeric suffix of the goal id (`goal_17` -> `17`).
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// A task -- one worker assignment inside a goal. Owned by one session at a
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default = "default_agent")]
    pub assigned_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomy_mode: Option<AutonomyMode>,
    #[serde(default)]
    pub plan: TaskPlan,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

fn default_agent() -> String {
    "main".into()
}

impl Task {
    pub fn new(id: String, text: impl Into<String>, clock: &dyn Clock) -> Self {
        let now = clock.now_ms();
        Self {
            id,
            text: text.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            done: false,
            priority: None,
            session_key: None,
            assigned_agent: default_agent(),
            model: None,
            depends_on: Vec::new(),
            summary: None,
            estimated_time: None,
            retry_count: 0,
            last_error: None,
            autonomy_mode: None,
            plan: TaskPlan::default(),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn touch(&mut self, clock: &dyn Clock) {
        self.updated_at_ms = clock.now_ms();
    }

    /// Set the status, keeping the `done` mirror in sync.
    pub fn set_status(&mut self, status: TaskStatus, clock: &dyn Clock) {
        self.status = status;
        self.done = status == TaskStatus::Done;
        self.touch(clock);
    }

    /// The numeric suffix of the task id (`task_42` -> `42`).
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// The numeric suffix of a prefixed id (`goal_7` -> `7`). Falls back to the
/// whole id when there is no underscore.
pub fn short_id(id: &str) -> &str {
    id.rsplit_once('_').map(|(_, n)| n).unwrap_or(id)
}

fn push_trimmed(history: &mut Vec<ChatMessage>, message: ChatMessage, max_history: usize) {
    history.push(message);
    if history.len() > max_history {
        let excess = history.len() - max_history;
        history.drain(..excess);
    }
}

// ---------------------------------------------------------------------------
// Document root
// ---------------------------------------------------------------------------

/// The whole persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    #[serde(default)]
    pub strands: Vec<Strand>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    /// Worker/task sessions: sessionKey -> owning goal.
    #[serde(default)]
    pub session_index: BTreeMap<String, SessionRef>,
    /// Strand-scoped (PM/orchestrator) sessions: sessionKey -> strand id.
    #[serde(default)]
    pub session_strand_index: BTreeMap<String, String>,
    /// Store-level role overrides: role name -> agent id.
    #[serde(default)]
    pub agent_roles: BTreeMap<String, String>,
}

impl Data {
    pub fn strand(&self, id: &str) -> Option<&Strand> {
        self.strands.iter().find(|s| s.id == id)
    }

    pub fn strand_mut(&mut self, id: &str) -> Option<&mut Strand> {
        self.strands.iter_mut().find(|s| s.id == id)
    }

    pub fn goal(&self, id: &str) -> Option<&Goal> {
        self.goals.iter().find(|g| g.id == id)
    }

    pub fn goal_mut(&mut self, id: &str) -> Option<&mut Goal> {
        self.goals.iter_mut().find(|g| g.id == id)
    }

    pub fn goals_for_strand(&self, strand_id: &str) -> Vec<&Goal> {
        self.goals
            .iter()
            .filter(|g| g.strand_id.as_deref() == Some(strand_id))
            .collect()
    }

    /// Find the goal and task owning a worker session key.
    pub fn task_for_session(&self, session_key: &str) -> Option<(&Goal, &Task)> {
        let goal_id = &self.session_index.get(session_key)?.goal_id;
        let goal = self.goal(goal_id)?;
        let task = goal
            .tasks
            .iter()
            .find(|t| t.session_key.as_deref() == Some(session_key))?;
        Some((goal, task))
    }

    /// Find the goal whose PM session this key identifies.
    pub fn goal_for_pm_session(&self, session_key: &str) -> Option<&Goal> {
        self.goals
            .iter()
            .find(|g| g.pm_session_key.as_deref() == Some(session_key))
    }

    /// Verify the document invariants. Returns the first violation found.
    ///
    /// This is asserted after every store write in debug builds and driven
    /// directly by the property tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        let strand_ids: Vec<&str> = self.strands.iter().map(|s| s.id.as_str()).collect();

        let mut seen_session_keys: BTreeMap<&str, &str> = BTreeMap::new();
        for goal in &self.goals {
            // 1. strandId references an existing strand or is null.
            if let Some(sid) = &goal.strand_id {
                if !strand_ids.contains(&sid.as_str()) {
                    return Err(format!("goal {} references missing strand {}", goal.id, sid));
                }
            }
            // 3. goal.dependsOn refers to goals in the same strand.
            for dep in &goal.depends_on {
                let Some(dep_goal) = self.goal(dep) else {
                    return Err(format!("goal {} depends on missing goal {}", goal.id, dep));
                };
                if dep_goal.strand_id != goal.strand_id {
                    return Err(format!(
                        "goal {} depends on goal {} in a different strand",
                        goal.id, dep
                    ));
                }
            }
            let task_ids: Vec<&str> = goal.tasks.iter().map(|t| t.id.as_str()).collect();
            let mut all_settled = true;
            for task in &goal.tasks {
                // 2. task.dependsOn refers to siblings.
                for dep in &task.depends_on {
                    if !task_ids.contains(&dep.as_str()) {
                        return Err(format!(
                            "task {} depends on non-sibling task {}",
                            task.id, dep
                        ));
                    }
                }
                // 5. status=done <=> done.
                if (task.status == TaskStatus::Done) != task.done {
                    return Err(format!(
                        "task {} has status {} but done={}",
                        task.id, task.status, task.done
                    ));
                }
                // 6/7. session keys are unique and indexed exactly once.
                if let Some(key) = &task.session_key {
                    if let Some(prev) = seen_session_keys.insert(key.as_str(), task.id.as_str()) {
                        return Err(format!(
                            "session key {} owned by both task {} and task {}",
                            key, prev, task.id
                        ));
                    }
                    let in_goal = self.session_index.contains_key(key.as_str());
                    let in_strand = self.session_strand_index.contains_key(key.as_str());
                    if in_goal == in_strand {
                        return Err(format!(
                            "session key {} indexed in {} indices (expected exactly one)",
                            key,
                            if in_goal { 2 } else { 0 }
                        ));
                    }
                }
                if !matches!(task.status, TaskStatus::Done | TaskStatus::Failed) {
                    all_settled = false;
                }
                // 10. updatedAtMs >= createdAtMs.
                if task.updated_at_ms < task.created_at_ms {
                    return Err(format!("task {} updated before created", task.id));
                }
            }
            // 8. a done goal has all tasks settled.
            if goal.status == GoalStatus::Done && !goal.tasks.is_empty() && !all_settled {
                return Err(format!("goal {} is done but has unsettled tasks", goal.id));
            }
            if goal.updated_at_ms < goal.created_at_ms {
                return Err(format!("goal {} updated before created", goal.id));
            }
        }
        for strand in &self.strands {
            if strand.updated_at_ms < strand.created_at_ms {
                return Err(format!("strand {} updated before created", strand.id));
            }
        }
        // Session index entries must point at existing goals.
        for (key, entry) in &self.session_index {
            if self.goal(&entry.goal_id).is_none() {
                return Err(format!(
                    "sessionIndex entry {} points at missing goal {}",
                    key, entry.goal_id
                ));
            }
        }
        for (key, strand_id) in &self.session_strand_index {
            if self.strand(strand_id).is_none() {
                return Err(format!(
                    "sessionStrandIndex entry {} points at missing strand {}",
                    key, strand_id
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Waiting,
            TaskStatus::Done,
            TaskStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_serde_uses_kebab_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        let back: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskStatus::InProgress);
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn cascade_state_display_roundtrip() {
        let variants = [
            CascadeState::AwaitingPlan,
            CascadeState::TasksCreated,
            CascadeState::PlanReady,
            CascadeState::ResponseSaved,
            CascadeState::PlanParseFailed,
            CascadeState::PlanFetchFailed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: CascadeState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn goal_status_display_roundtrip() {
        for v in &[GoalStatus::Active, GoalStatus::Done, GoalStatus::Failed] {
            let parsed: GoalStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn set_status_keeps_done_mirror_in_sync() {
        let clock = ManualClock::new(10);
        let mut task = Task::new("task_1".into(), "do it", &clock);
        assert!(!task.done);

        task.set_status(TaskStatus::Done, &clock);
        assert!(task.done);

        task.set_status(TaskStatus::Pending, &clock);
        assert!(!task.done);
    }

    #[test]
    fn touch_advances_updated_at() {
        let clock = ManualClock::new(100);
        let mut goal = Goal::new("goal_1".into(), "ship it", &clock);
        assert_eq!(goal.updated_at_ms, 100);

        clock.advance_ms(50);
        goal.touch(&clock);
        assert_eq!(goal.created_at_ms, 100);
        assert_eq!(goal.updated_at_ms, 150);
    }

    #[test]
    fn push_history_trims_oldest_first() {
        let clock = ManualClock::new(0);
        let mut strand = Strand::new("strand_1".into(), "app", &clock);
        for i in 0..105 {
            strand.push_history(ChatMessage::user(format!("msg {i}")), 100);
        }
        assert_eq!(strand.pm_chat_history.len(), 100);
        assert_eq!(strand.pm_chat_history[0].content, "msg 5");
        assert_eq!(strand.pm_chat_history[99].content, "msg 104");
    }

    #[test]
    fn short_id_extracts_numeric_suffix() {
        assert_eq!(short_id("goal_17"), "17");
        assert_eq!(short_id("task_3"), "3");
        assert_eq!(short_id("noprefix"), "noprefix");
    }

    #[test]
    fn camel_case_document_fields() {
        let clock = ManualClock::new(7);
        let goal = Goal::new("goal_1".into(), "g", &clock);
        let value = serde_json::to_value(&goal).unwrap();
        assert!(value.get("createdAtMs").is_some());
        assert!(value.get("updatedAtMs").is_some());
        assert!(value.get("maxRetries").is_some());
    }

    #[test]
    fn invariants_accept_empty_document() {
        assert!(Data::default().check_invariants().is_ok());
    }

    #[test]
    fn invariants_reject_dangling_strand_reference() {
        let clock = ManualClock::new(0);
        let mut data = Data::default();
        let mut goal = Goal::new("goal_1".into(), "g", &clock);
        goal.strand_id = Some("strand_9".into());
        data.goals.push(goal);
        assert!(data.check_invariants().is_err());
    }

    #[test]
    fn invariants_reject_done_status_mismatch() {
        let clock = ManualClock::new(0);
        let mut data = Data::default();
        let mut goal = Goal::new("goal_1".into(), "g", &clock);
        let mut task = Task::new("task_1".into(), "t", &clock);
        task.status = TaskStatus::Done; // mirror not updated
        goal.tasks.push(task);
        data.goals.push(goal);
        assert!(data.check_invariants().is_err());
    }

    #[test]
    fn invariants_reject_unindexed_session_key() {
        let clock = ManualClock::new(0);
        let mut data = Data::default();
        let mut goal = Goal::new("goal_1".into(), "g", &clock);
        let mut task = Task::new("task_1".into(), "t", &clock);
        task.session_key = Some("agent:main:webchat:task-1".into());
        goal.tasks.push(task);
        data.goals.push(goal);
        assert!(data.check_invariants().is_err());

        data.session_index.insert(
            "agent:main:webchat:task-1".into(),
            SessionRef {
                goal_id: "goal_1".into(),
            },
        );
        assert!(data.check_invariants().is_ok());
    }

    #[test]
    fn invariants_reject_done_goal_with_pending_tasks() {
        let clock = ManualClock::new(0);
        let mut data = Data::default();
        let mut goal = Goal::new("goal_1".into(), "g", &clock);
        goal.tasks.push(Task::new("task_1".into(), "t", &clock));
        goal.set_status(GoalStatus::Done, &clock);
        data.goals.push(goal);
        assert!(data.check_invariants().is_err());
    }
}
