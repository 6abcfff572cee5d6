//! The braid orchestration engine.
//!
//! Couples the persisted strand/goal/task model to concrete agent sessions
//! and git worktrees: the dependency-driven kickoff scheduler, the PM
//! cascade processor, the session-lifecycle manager, the orchestrator
//! hooks that react to agent starts/ends/streams, and the request surface
//! outside callers invoke.
//!
//! External collaborators are reached through traits: the LLM gateway
//! ([`gateway::Gateway`]) and the free-text session classifier
//! ([`classify::Classifier`]). Git is reached through the `git` binary via
//! [`workspace::WorkspaceManager`]. The engine itself opens no sockets and
//! runs no LLMs.

pub mod api;
pub mod cascade;
pub mod classify;
pub mod config;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod hooks;
pub mod plan;
pub mod roles;
pub mod scheduler;
pub mod sessions;
pub mod tools;
pub mod workspace;

pub use config::EngineConfig;
pub use engine::Engine;
