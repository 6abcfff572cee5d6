//! Engine configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use braid_store::AutonomyMode;
use braid_store::models::DEFAULT_MAX_HISTORY;

/// Options recognized by the engine. All optional beyond `data_dir`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where the document store persists.
    pub data_dir: PathBuf,
    /// Where strand workspaces live. Git features are enabled only when
    /// this is set.
    pub workspaces_dir: Option<PathBuf>,
    /// Default PM session key for strand-level chat when none is minted.
    pub pm_session: Option<String>,
    /// Role -> agent id map (config-file layer; store overrides win).
    pub agent_roles: BTreeMap<String, String>,
    /// Model override applied to spawned workers when the task has none.
    pub default_model: Option<String>,
    /// Autonomy used when neither task, goal, nor strand specifies one.
    pub default_autonomy: AutonomyMode,
    /// PM chat history cap, oldest-first trim.
    pub max_history: usize,
    /// How often PM-response polling re-fetches `chat.history`.
    pub pm_poll_interval: Duration,
    /// Bounded cap on waiting for a PM reply.
    pub pm_poll_timeout: Duration,
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            workspaces_dir: None,
            pm_session: None,
            agent_roles: BTreeMap::new(),
            default_model: None,
            default_autonomy: AutonomyMode::default(),
            max_history: DEFAULT_MAX_HISTORY,
            pm_poll_interval: Duration::from_secs(3),
            pm_poll_timeout: Duration::from_secs(180),
        }
    }
}
