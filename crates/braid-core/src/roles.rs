//! Agent-role resolution and the session-key grammar.
//!
//! Session keys follow `agent:<agentId>:<sessionType>[:<subId>]`.
//! Reserved session types: `main`, `webchat`, `telegram`. PM sessions are
//! `webchat` sessions whose subId starts with `pm-`; worker sessions use
//! `task-<short>` subIds.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use braid_store::Data;
use braid_store::models::short_id;

use crate::config::EngineConfig;

/// Default role (and default agent id) when a task names none.
pub const DEFAULT_ROLE: &str = "main";

/// Prefix for environment-variable role defaults: `BRAID_AGENT_<ROLE>`.
const ENV_ROLE_PREFIX: &str = "BRAID_AGENT_";

/// Errors from parsing a session key.
#[derive(Debug, Error)]
pub enum SessionKeyError {
    #[error("session key must start with \"agent:\": {0:?}")]
    MissingPrefix(String),

    #[error("session key has no session type: {0:?}")]
    MissingSessionType(String),
}

/// A parsed session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    pub agent_id: String,
    pub session_type: String,
    pub sub_id: Option<String>,
}

impl SessionKey {
    pub fn new(agent_id: impl Into<String>, session_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_type: session_type.into(),
            sub_id: None,
        }
    }

    pub fn with_sub_id(mut self, sub_id: impl Into<String>) -> Self {
        self.sub_id = Some(sub_id.into());
        self
    }

    /// True iff this key identifies a PM session: a `webchat` session whose
    /// subId begins with `pm-`. For legacy compatibility, `subagent` keys
    /// with a `pm-` subId are also recognized.
    pub fn is_pm(&self) -> bool {
        let Some(sub_id) = &self.sub_id else {
            return false;
        };
        if !sub_id.starts_with("pm-") {
            return false;
        }
        self.session_type == "webchat" || self.session_type == "subagent"
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent:{}:{}", self.agent_id, self.session_type)?;
        if let Some(sub_id) = &self.sub_id {
            write!(f, ":{sub_id}")?;
        }
        Ok(())
    }
}

impl FromStr for SessionKey {
    type Err = SessionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("agent:")
            .ok_or_else(|| SessionKeyError::MissingPrefix(s.to_owned()))?;

        let mut parts = rest.splitn(3, ':');
        let agent_id = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SessionKeyError::MissingPrefix(s.to_owned()))?;
        let session_type = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SessionKeyError::MissingSessionType(s.to_owned()))?;
        let sub_id = parts.next().filter(|p| !p.is_empty());

        Ok(Self {
            agent_id: agent_id.to_owned(),
            session_type: session_type.to_owned(),
            sub_id: sub_id.map(str::to_owned),
        })
    }
}

/// True iff the raw key string identifies a PM session.
pub fn is_pm_session_key(key: &str) -> bool {
    key.parse::<SessionKey>().map(|k| k.is_pm()).unwrap_or(false)
}

/// Deterministic PM session key for a goal: subId `pm-<goalId>`.
///
/// Reopening a chat for the same goal finds the same conversation.
pub fn pm_goal_session_key(agent_id: &str, goal_id: &str) -> String {
    SessionKey::new(agent_id, "webchat")
        .with_sub_id(format!("pm-{goal_id}"))
        .to_string()
}

/// Deterministic PM session key for a strand: subId `pm-strand-<strandId>`.
pub fn pm_strand_session_key(agent_id: &str, strand_id: &str) -> String {
    SessionKey::new(agent_id, "webchat")
        .with_sub_id(format!("pm-strand-{strand_id}"))
        .to_string()
}

/// Worker session key for a task: subId `task-<short>`.
pub fn worker_session_key(agent_id: &str, task_id: &str) -> String {
    SessionKey::new(agent_id, "webchat")
        .with_sub_id(format!("task-{}", short_id(task_id)))
        .to_string()
}

/// Resolve an abstract role (`pm`, `backend`, ...) to a concrete agent id.
///
/// Resolution order: store overrides (`agentRoles` in the document), then
/// the engine config map, then the `BRAID_AGENT_<ROLE>` environment
/// default. A name no layer knows is assumed to already be an agent id
/// and passes through unchanged.
pub fn resolve_agent(data: &Data, config: &EngineConfig, role_or_id: &str) -> String {
    if let Some(agent_id) = data.agent_roles.get(role_or_id) {
        return agent_id.clone();
    }
    if let Some(agent_id) = config.agent_roles.get(role_or_id) {
        return agent_id.clone();
    }
    let env_key = format!(
        "{ENV_ROLE_PREFIX}{}",
        role_or_id.to_uppercase().replace('-', "_")
    );
    if let Ok(agent_id) = std::env::var(&env_key) {
        if !agent_id.is_empty() {
            return agent_id;
        }
    }
    role_or_id.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_roundtrip() {
        for raw in [
            "agent:main:webchat",
            "agent:claude:webchat:task-7",
            "agent:pm-bot:webchat:pm-goal_3",
        ] {
            let key: SessionKey = raw.parse().expect("should parse");
            assert_eq!(key.to_string(), raw);
        }
    }

    #[test]
    fn parse_rejects_bad_keys() {
        assert!("main:webchat".parse::<SessionKey>().is_err());
        assert!("agent:main".parse::<SessionKey>().is_err());
        assert!("agent::webchat".parse::<SessionKey>().is_err());
    }

    #[test]
    fn pm_detection() {
        assert!(is_pm_session_key("agent:main:webchat:pm-goal_1"));
        assert!(is_pm_session_key("agent:main:webchat:pm-strand-strand_2"));
        // Legacy form.
        assert!(is_pm_session_key("agent:main:subagent:pm-goal_1"));
        // Not PM: wrong session type or wrong subId.
        assert!(!is_pm_session_key("agent:main:telegram:pm-goal_1"));
        assert!(!is_pm_session_key("agent:main:webchat:task-1"));
        assert!(!is_pm_session_key("agent:main:webchat"));
    }

    #[test]
    fn deterministic_pm_keys() {
        assert_eq!(
            pm_goal_session_key("main", "goal_9"),
            "agent:main:webchat:pm-goal_9"
        );
        assert_eq!(
            pm_strand_session_key("main", "strand_4"),
            "agent:main:webchat:pm-strand-strand_4"
        );
        // Same inputs, same key.
        assert_eq!(
            pm_goal_session_key("main", "goal_9"),
            pm_goal_session_key("main", "goal_9")
        );
    }

    #[test]
    fn worker_key_uses_short_task_id() {
        assert_eq!(
            worker_session_key("claude", "task_31"),
            "agent:claude:webchat:task-31"
        );
    }

    #[test]
    fn resolve_prefers_store_over_config() {
        let mut data = Data::default();
        data.agent_roles.insert("backend".into(), "claude-be".into());
        let mut config = EngineConfig::new("/tmp/x");
        config.agent_roles.insert("backend".into(), "other".into());

        assert_eq!(resolve_agent(&data, &config, "backend"), "claude-be");
    }

    #[test]
    fn resolve_falls_through_to_config_then_passthrough() {
        let data = Data::default();
        let mut config = EngineConfig::new("/tmp/x");
        config.agent_roles.insert("pm".into(), "pm-agent".into());

        assert_eq!(resolve_agent(&data, &config, "pm"), "pm-agent");
        // Unknown names pass through as agent ids.
        assert_eq!(resolve_agent(&data, &config, "claude-opus"), "claude-opus");
    }

    #[test]
    fn resolve_reads_env_defaults() {
        let data = Data::default();
        let config = EngineConfig::new("/tmp/x");
        // SAFETY: tests in this module run on the test harness threads; the
        // variable is unique to this test.
        unsafe { std::env::set_var("BRAID_AGENT_FRONTEND", "fe-agent") };
        assert_eq!(resolve_agent(&data, &config, "frontend"), "fe-agent");
        unsafe { std::env::remove_var("BRAID_AGENT_FRONTEND") };
    }
}
