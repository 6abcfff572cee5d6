//! File-backed document store and entity model for braid.
//!
//! The entire orchestration state lives in a single JSON document that is
//! loaded once, mutated in memory, and persisted with a replace-then-rename
//! atomic write on every successful operation. This crate owns the document
//! shape ([`models`]), the single-writer store ([`store`]), and the clock
//! abstraction used for timestamp discipline ([`clock`]).

pub mod clock;
pub mod models;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use models::{
    AutonomyMode, CascadeMode, CascadeState, ChatMessage, Data, Goal, GoalStatus, MergeStatus,
    PlanStep, PlanStepStatus, PushStatus, SessionRef, Strand, Task, TaskPlan, TaskStatus,
    WorkspaceMeta, WorktreeMeta,
};
pub use store::{Store, StoreError};
