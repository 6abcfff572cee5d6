//! Shared fixtures for braid integration tests: temp stores, temp git
//! repositories, a scripted mock gateway, and a pre-wired engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use braid_core::gateway::{ChatTurn, Gateway};
use braid_core::{Engine, EngineConfig};
use braid_store::Store;

/// Create a temporary git repository with an initial commit.
///
/// Returns the TempDir (keep it alive) and the repo path.
pub fn create_temp_git_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(&repo_path)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    };

    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@braid.dev"]);
    run(&["config", "user.name", "Braid Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test repo\n").expect("write README");
    run(&["add", "."]);
    run(&["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Open a store in a fresh temp directory.
pub fn create_temp_store() -> (TempDir, Arc<Store>) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let store = Store::open(dir.path()).expect("failed to open store");
    (dir, Arc::new(store))
}

/// A scripted gateway: records every call and replays scripted history.
#[derive(Debug, Default)]
pub struct MockGateway {
    sent: Mutex<Vec<(String, String)>>,
    aborted: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    history: Mutex<HashMap<String, Vec<ChatTurn>>>,
    unreachable: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every gateway call fail from now on.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Script an assistant turn into a session's history.
    pub fn push_assistant(&self, session_key: &str, text: &str) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .entry(session_key.to_owned())
            .or_default()
            .push(ChatTurn::assistant(text));
    }

    /// Every `chat.send` observed, in order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Messages sent to one session key.
    pub fn sent_to(&self, session_key: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(key, _)| key == session_key)
            .map(|(_, msg)| msg)
            .collect()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("mock gateway is unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn chat_send(&self, session_key: &str, message: &str) -> Result<()> {
        self.check_reachable()?;
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((session_key.to_owned(), message.to_owned()));
        // The message becomes part of the conversation.
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_key.to_owned())
            .or_default()
            .push(ChatTurn::user(message));
        Ok(())
    }

    async fn chat_history(&self, session_key: &str, limit: usize) -> Result<Vec<ChatTurn>> {
        self.check_reachable()?;
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let turns = history.get(session_key).cloned().unwrap_or_default();
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).collect())
    }

    async fn chat_abort(&self, session_key: &str) -> Result<()> {
        self.check_reachable()?;
        self.aborted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session_key.to_owned());
        Ok(())
    }

    async fn session_delete(&self, session_key: &str) -> Result<()> {
        self.check_reachable()?;
        self.deleted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(session_key.to_owned());
        Ok(())
    }
}

/// A full test rig: temp store, mock gateway, and an engine with fast PM
/// polling. Git features stay off unless a workspaces dir is given.
pub struct TestRig {
    pub engine: Arc<Engine>,
    pub gateway: Arc<MockGateway>,
    pub data_dir: TempDir,
    pub workspaces_dir: Option<TempDir>,
}

impl TestRig {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A rig with git features enabled (workspaces directory present).
    pub fn with_workspaces() -> Self {
        Self::build(true)
    }

    fn build(workspaces: bool) -> Self {
        let data_dir = TempDir::new().expect("failed to create data dir");
        let store = Arc::new(Store::open(data_dir.path()).expect("failed to open store"));
        let gateway = MockGateway::new();

        let mut config = EngineConfig::new(data_dir.path());
        config.pm_poll_interval = Duration::from_millis(10);
        config.pm_poll_timeout = Duration::from_millis(300);

        let workspaces_dir = if workspaces {
            let dir = TempDir::new().expect("failed to create workspaces dir");
            config.workspaces_dir = Some(dir.path().to_path_buf());
            Some(dir)
        } else {
            None
        };

        let engine = Arc::new(Engine::new(
            config,
            store,
            Arc::clone(&gateway) as Arc<dyn Gateway>,
        ));
        Self {
            engine,
            gateway,
            data_dir,
            workspaces_dir,
        }
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll the store until a predicate holds or the timeout expires.
///
/// Uses tokio time, so tests with `start_paused = true` converge without
/// real waiting.
pub async fn wait_for<F>(engine: &Arc<Engine>, timeout: Duration, mut pred: F) -> bool
where
    F: FnMut(&braid_store::Data) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let data = engine.store().snapshot().await;
        if pred(&data) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
