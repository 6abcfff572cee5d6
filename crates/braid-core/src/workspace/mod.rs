//! Git workspace management: per-strand clones, per-goal worktrees.
//!
//! Each strand owns a workspace directory (a clone of its repo, or a
//! locally-initialized one). Each goal gets its own worktree on its own
//! branch under `<workspace>/goals/<goalId>`, so goals can edit files
//! concurrently without conflict. Worktrees share the object store of the
//! strand workspace but have independent working directories.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it uses a lock file on the shared object store), so all
//! mutating operations are serialised through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Deadline for `git clone` (remote fetch of an arbitrary repo).
const CLONE_TIMEOUT: Duration = Duration::from_secs(120);
/// Deadline for every other git command.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The path exists but is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute at all.
    #[error("git command failed: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A git command overran its deadline and was killed.
    #[error("git {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
}

/// Result of creating a strand workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrandWorkspace {
    pub path: PathBuf,
    /// True when the directory already held a git repository.
    pub existed: bool,
}

/// Result of creating a goal worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalWorktree {
    pub path: PathBuf,
    pub branch: String,
    pub existed: bool,
}

/// Result of a merge operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// Merge had conflicts and was aborted.
    Conflict { details: String },
}

/// Result of a push operation. A missing remote is non-fatal so that
/// local-only strands work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    NoRemote,
}

/// `ahead`/`behind` counts of a goal branch relative to the main branch,
/// plus the files a merge would conflict on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchStatus {
    pub ahead: u32,
    pub behind: u32,
    pub conflict_files: Vec<String>,
}

/// Result of opening a pull request via the `gh` CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrOutcome {
    pub url: String,
    pub number: Option<u64>,
}

/// Manages strand workspaces and goal worktrees under a base directory.
#[derive(Debug)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorkspaceManager {
    fn clone(&self) -> Self {
        Self {
            base_dir: self.base_dir.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

/// Sanitize a name into a filesystem/branch-safe slug.
///
/// Lowercases, maps runs of non-alphanumeric characters to single dashes,
/// and trims leading/trailing dashes. Idempotent.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create (or reuse) the workspace directory for a strand.
    ///
    /// Clones `repo_url` when given, otherwise initializes a fresh repo
    /// with an empty commit. Idempotent: an existing git repository at the
    /// slug path is returned with `existed: true`.
    pub fn create_strand_workspace(
        &self,
        strand_id: &str,
        name: &str,
        repo_url: Option<&str>,
    ) -> Result<StrandWorkspace, GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let slug = sanitize(name);
        let dir_name = if slug.is_empty() {
            strand_id.to_owned()
        } else {
            slug
        };
        let path = self.base_dir.join(dir_name);

        if path.join(".git").exists() {
            tracing::info!(path = %path.display(), "strand workspace already exists");
            return Ok(StrandWorkspace {
                path,
                existed: true,
            });
        }

        std::fs::create_dir_all(&self.base_dir).map_err(|source| GitError::Io {
            message: format!(
                "failed to create workspaces directory {}",
                self.base_dir.display()
            ),
            source,
        })?;

        match repo_url {
            Some(url) => {
                run_git(
                    &self.base_dir,
                    &["clone", url, &path.to_string_lossy()],
                    CLONE_TIMEOUT,
                )?;
            }
            None => {
                std::fs::create_dir_all(&path).map_err(|source| GitError::Io {
                    message: format!("failed to create workspace directory {}", path.display()),
                    source,
                })?;
                run_git(&path, &["init", "-b", "main"], GIT_TIMEOUT)?;
                configure_git_user(&path);
                run_git(
                    &path,
                    &["commit", "--allow-empty", "-m", "Initial commit"],
                    GIT_TIMEOUT,
                )?;
            }
        }

        // Keep goal worktrees out of the strand repo's status output.
        let exclude = path.join(".git").join("info").join("exclude");
        if let Some(parent) = exclude.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(&exclude, "goals/\n");

        Ok(StrandWorkspace {
            path,
            existed: false,
        })
    }

    /// Remove a strand workspace directory. Idempotent.
    pub fn remove_strand_workspace(&self, path: &Path) -> Result<(), GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !path.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(path).map_err(|source| GitError::Io {
            message: format!("failed to remove workspace {}", path.display()),
            source,
        })
    }

    /// Create (or reuse) a goal's worktree inside a strand workspace.
    ///
    /// The branch is `goal/<slug-of-title>` (falling back to
    /// `goal/<goalId>` when there is no title); on a branch-name collision
    /// the goal's short id is appended. The worktree lives at
    /// `<workspace>/goals/<goalId>`. Idempotent.
    pub fn create_goal_worktree(
        &self,
        strand_ws: &Path,
        goal_id: &str,
        title: Option<&str>,
    ) -> Result<GoalWorktree, GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        ensure_repo(strand_ws)?;

        let worktree_path = strand_ws.join("goals").join(goal_id);
        if worktree_path.exists() {
            let branch = current_branch(&worktree_path)?;
            tracing::info!(
                path = %worktree_path.display(),
                branch = %branch,
                "goal worktree already exists"
            );
            return Ok(GoalWorktree {
                path: worktree_path,
                branch,
                existed: true,
            });
        }

        let slug = title.map(sanitize).filter(|s| !s.is_empty());
        let mut branch = match slug {
            Some(s) => format!("goal/{s}"),
            None => format!("goal/{goal_id}"),
        };
        if branch_exists(strand_ws, &branch)? {
            let short = goal_id.rsplit_once('_').map(|(_, n)| n).unwrap_or(goal_id);
            branch = format!("{branch}-{short}");
        }

        std::fs::create_dir_all(worktree_path.parent().expect("goals dir has parent")).map_err(
            |source| GitError::Io {
                message: "failed to create goals directory".into(),
                source,
            },
        )?;

        let result = run_git(
            strand_ws,
            &[
                "worktree",
                "add",
                "-b",
                &branch,
                &worktree_path.to_string_lossy(),
            ],
            GIT_TIMEOUT,
        );
        if let Err(e) = result {
            // Clean up partial state before reporting.
            if worktree_path.exists() {
                let _ = std::fs::remove_dir_all(&worktree_path);
            }
            let _ = run_git(strand_ws, &["worktree", "prune"], GIT_TIMEOUT);
            return Err(e);
        }
        configure_git_user(&worktree_path);

        Ok(GoalWorktree {
            path: worktree_path,
            branch,
            existed: false,
        })
    }

    /// Remove a goal worktree. Idempotent.
    pub fn remove_goal_worktree(
        &self,
        strand_ws: &Path,
        worktree_path: &Path,
    ) -> Result<(), GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let result = run_git(
            strand_ws,
            &[
                "worktree",
                "remove",
                "--force",
                &worktree_path.to_string_lossy(),
            ],
            GIT_TIMEOUT,
        );
        match result {
            Ok(_) => {}
            Err(GitError::Exit { stderr, .. }) if stderr.contains("is not a working tree") => {
                if worktree_path.exists() {
                    let _ = std::fs::remove_dir_all(worktree_path);
                }
            }
            Err(e) => return Err(e),
        }
        let _ = run_git(strand_ws, &["worktree", "prune"], GIT_TIMEOUT);
        Ok(())
    }

    /// Detect the main branch of a repository: a local `main`, then a
    /// local `master`, then whatever HEAD points at.
    pub fn detect_main_branch(&self, repo: &Path) -> Result<String, GitError> {
        detect_main(repo)
    }

    /// Stage and commit all changes in a directory.
    ///
    /// Returns `Ok(false)` when the tree is clean.
    pub fn commit_all(&self, dir: &Path, message: &str) -> Result<bool, GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        configure_git_user(dir);

        run_git(dir, &["add", "-A"], GIT_TIMEOUT)?;
        let status = run_git(dir, &["status", "--porcelain"], GIT_TIMEOUT)?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        run_git(dir, &["commit", "-m", message], GIT_TIMEOUT)?;
        Ok(true)
    }

    /// Push a goal branch to `origin`. `NoRemote` when none is configured.
    pub fn push_goal_branch(&self, strand_ws: &Path, branch: &str) -> Result<PushOutcome, GitError> {
        self.push(strand_ws, branch)
    }

    /// Push the main branch to `origin`.
    pub fn push_main(&self, strand_ws: &Path) -> Result<PushOutcome, GitError> {
        let main = self.detect_main_branch(strand_ws)?;
        self.push(strand_ws, &main)
    }

    fn push(&self, strand_ws: &Path, branch: &str) -> Result<PushOutcome, GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let remotes = run_git(strand_ws, &["remote"], GIT_TIMEOUT)?;
        if remotes.trim().is_empty() {
            tracing::debug!(branch = %branch, "no remote configured, skipping push");
            return Ok(PushOutcome::NoRemote);
        }
        run_git(strand_ws, &["push", "-u", "origin", branch], GIT_TIMEOUT)?;
        Ok(PushOutcome::Pushed)
    }

    /// Merge a goal branch into the main branch with `--no-ff`.
    ///
    /// On conflict the merge is aborted and `Conflict` is returned with
    /// git's conflict output.
    pub fn merge_goal_branch(
        &self,
        strand_ws: &Path,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let main = detect_main(strand_ws)?;
        self.merge_into(strand_ws, &main, branch)
    }

    fn merge_into(
        &self,
        strand_ws: &Path,
        main: &str,
        branch: &str,
    ) -> Result<MergeOutcome, GitError> {
        if current_branch(strand_ws)? != main {
            run_git(strand_ws, &["checkout", main], GIT_TIMEOUT)?;
        }
        configure_git_user(strand_ws);

        let (code, stdout, stderr) =
            run_git_raw(strand_ws, &["merge", "--no-ff", branch], GIT_TIMEOUT)?;
        if code == 0 {
            return Ok(MergeOutcome::Merged);
        }

        if stderr.contains("CONFLICT")
            || stdout.contains("CONFLICT")
            || stdout.contains("Automatic merge failed")
            || stderr.contains("Automatic merge failed")
        {
            let _ = run_git_raw(strand_ws, &["merge", "--abort"], GIT_TIMEOUT);
            return Ok(MergeOutcome::Conflict {
                details: format!("{stdout}\n{stderr}").trim().to_owned(),
            });
        }

        Err(GitError::Exit {
            command: "merge".into(),
            code,
            stderr,
        })
    }

    /// How far a goal branch is ahead of / behind main, and which files a
    /// merge would conflict on.
    pub fn check_branch_status(
        &self,
        strand_ws: &Path,
        branch: &str,
    ) -> Result<BranchStatus, GitError> {
        let main = self.detect_main_branch(strand_ws)?;

        let counts = run_git(
            strand_ws,
            &["rev-list", "--left-right", "--count", &format!("{main}...{branch}")],
            GIT_TIMEOUT,
        )?;
        let mut parts = counts.split_whitespace();
        let behind = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
        let ahead = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);

        // `merge-tree --write-tree` exits 1 on conflicts and lists the
        // conflicted paths after the tree OID, up to a blank separator
        // line (informational messages follow it).
        let (code, stdout, _stderr) = run_git_raw(
            strand_ws,
            &["merge-tree", "--write-tree", "--name-only", &main, branch],
            GIT_TIMEOUT,
        )?;
        let conflict_files = if code == 1 {
            stdout
                .lines()
                .skip(1)
                .take_while(|l| !l.trim().is_empty())
                .map(str::to_owned)
                .collect()
        } else {
            Vec::new()
        };

        Ok(BranchStatus {
            ahead,
            behind,
            conflict_files,
        })
    }

    /// Open a pull request for a goal branch via the `gh` CLI.
    pub fn create_pull_request(
        &self,
        strand_ws: &Path,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PrOutcome, GitError> {
        let main = self.detect_main_branch(strand_ws)?;
        let output = run_command(
            strand_ws,
            "gh",
            &[
                "pr", "create", "--head", branch, "--base", &main, "--title", title, "--body",
                body,
            ],
            GIT_TIMEOUT,
        )?;

        let url = output.trim().lines().last().unwrap_or("").trim().to_owned();
        let number = url.rsplit('/').next().and_then(|n| n.parse().ok());
        Ok(PrOutcome { url, number })
    }

    pub fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, GitError> {
        branch_exists(repo, branch)
    }
}

fn detect_main(repo: &Path) -> Result<String, GitError> {
    for candidate in ["main", "master"] {
        if branch_exists(repo, candidate)? {
            return Ok(candidate.to_owned());
        }
    }
    current_branch(repo)
}

fn ensure_repo(path: &Path) -> Result<(), GitError> {
    let (code, _, _) = run_git_raw(path, &["rev-parse", "--git-dir"], GIT_TIMEOUT)?;
    if code != 0 {
        return Err(GitError::NotAGitRepo(path.to_path_buf()));
    }
    Ok(())
}

fn branch_exists(repo: &Path, branch: &str) -> Result<bool, GitError> {
    let (code, _, _) = run_git_raw(
        repo,
        &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
        GIT_TIMEOUT,
    )?;
    Ok(code == 0)
}

fn current_branch(repo: &Path) -> Result<String, GitError> {
    let out = run_git(repo, &["rev-parse", "--abbrev-ref", "HEAD"], GIT_TIMEOUT)?;
    Ok(out.trim().to_owned())
}

/// Set a local git identity so commits made by the engine succeed in
/// environments with no global config.
fn configure_git_user(dir: &Path) {
    let _ = run_git_raw(dir, &["config", "user.email", "braid@localhost"], GIT_TIMEOUT);
    let _ = run_git_raw(dir, &["config", "user.name", "braid"], GIT_TIMEOUT);
}

/// Run a git command, requiring exit code 0. Returns stdout.
fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<String, GitError> {
    let (code, stdout, stderr) = run_git_raw(dir, args, timeout)?;
    if code != 0 {
        return Err(GitError::Exit {
            command: args.join(" "),
            code,
            stderr,
        });
    }
    Ok(stdout)
}

/// Run a git command, returning (exit code, stdout, stderr).
fn run_git_raw(
    dir: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<(i32, String, String), GitError> {
    run_subprocess(dir, "git", args, timeout)
}

/// Run a non-git helper (e.g. `gh`), requiring exit code 0.
fn run_command(
    dir: &Path,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, GitError> {
    let (code, stdout, stderr) = run_subprocess(dir, program, args, timeout)?;
    if code != 0 {
        return Err(GitError::Exit {
            command: format!("{program} {}", args.join(" ")),
            code,
            stderr,
        });
    }
    Ok(stdout)
}

/// Spawn a subprocess with a deadline, polling for exit and killing the
/// child when the deadline passes.
fn run_subprocess(
    dir: &Path,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<(i32, String, String), GitError> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| GitError::Io {
            message: format!("failed to run {program} {}", args.join(" ")),
            source,
        })?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GitError::Timeout {
                        command: args.join(" "),
                        seconds: timeout.as_secs(),
                    });
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(source) => {
                return Err(GitError::Io {
                    message: format!("failed to wait for {program}"),
                    source,
                });
            }
        }
    }

    let output = child.wait_with_output().map_err(|source| GitError::Io {
        message: format!("failed to collect output of {program}"),
        source,
    })?;

    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a temporary git repository with an initial commit.
    fn create_temp_repo() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
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
        std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["My App!", "already-clean", "  Spaces  Here ", "CAPS_and_underscores"] {
            let once = sanitize(input);
            let twice = sanitize(&once);
            assert_eq!(once, twice, "sanitize not idempotent for {input:?}");
        }
    }

    #[test]
    fn sanitize_slugs() {
        assert_eq!(sanitize("My App!"), "my-app");
        assert_eq!(sanitize("backend / API v2"), "backend-api-v2");
        assert_eq!(sanitize("---"), "");
    }

    #[test]
    fn create_strand_workspace_init_mode() {
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());

        let ws = mgr
            .create_strand_workspace("strand_1", "My App", None)
            .expect("create failed");
        assert!(!ws.existed);
        assert!(ws.path.ends_with("my-app"));
        assert!(ws.path.join(".git").exists());

        // Idempotent: second call reports the existing workspace.
        let again = mgr
            .create_strand_workspace("strand_1", "My App", None)
            .expect("second create failed");
        assert!(again.existed);
        assert_eq!(again.path, ws.path);
    }

    #[test]
    fn create_strand_workspace_clone_mode() {
        let (_src_dir, src_repo) = create_temp_repo();
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());

        let url = src_repo.to_string_lossy().to_string();
        let ws = mgr
            .create_strand_workspace("strand_1", "Cloned", Some(&url))
            .expect("clone failed");
        assert!(ws.path.join("README.md").exists());
    }

    #[test]
    fn create_strand_workspace_falls_back_to_id_for_empty_slug() {
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());
        let ws = mgr
            .create_strand_workspace("strand_7", "!!!", None)
            .expect("create failed");
        assert!(ws.path.ends_with("strand_7"));
    }

    #[test]
    fn goal_worktree_create_and_remove() {
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());
        let ws = mgr.create_strand_workspace("strand_1", "app", None).unwrap();

        let wt = mgr
            .create_goal_worktree(&ws.path, "goal_3", Some("Build Backend"))
            .expect("worktree failed");
        assert_eq!(wt.branch, "goal/build-backend");
        assert!(wt.path.ends_with("goals/goal_3"));
        assert!(wt.path.exists());
        assert!(!wt.existed);

        // Idempotent.
        let again = mgr
            .create_goal_worktree(&ws.path, "goal_3", Some("Build Backend"))
            .expect("second create failed");
        assert!(again.existed);
        assert_eq!(again.branch, wt.branch);

        mgr.remove_goal_worktree(&ws.path, &wt.path).expect("remove failed");
        assert!(!wt.path.exists());
        // Removing again is a no-op.
        mgr.remove_goal_worktree(&ws.path, &wt.path).expect("second remove failed");
    }

    #[test]
    fn goal_worktree_without_title_uses_goal_id() {
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());
        let ws = mgr.create_strand_workspace("strand_1", "app", None).unwrap();

        let wt = mgr.create_goal_worktree(&ws.path, "goal_9", None).unwrap();
        assert_eq!(wt.branch, "goal/goal_9");
    }

    #[test]
    fn goal_worktree_branch_collision_appends_short_id() {
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());
        let ws = mgr.create_strand_workspace("strand_1", "app", None).unwrap();

        let first = mgr
            .create_goal_worktree(&ws.path, "goal_1", Some("Refactor"))
            .unwrap();
        let second = mgr
            .create_goal_worktree(&ws.path, "goal_2", Some("Refactor"))
            .unwrap();
        assert_eq!(first.branch, "goal/refactor");
        assert_eq!(second.branch, "goal/refactor-2");
    }

    #[test]
    fn commit_all_reports_clean_tree() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new("/tmp");
        assert!(!mgr.commit_all(&repo, "noop").unwrap());

        std::fs::write(repo.join("new.txt"), "content\n").unwrap();
        assert!(mgr.commit_all(&repo, "add file").unwrap());
        assert!(!mgr.commit_all(&repo, "noop again").unwrap());
    }

    #[test]
    fn merge_goal_branch_success() {
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());
        let ws = mgr.create_strand_workspace("strand_1", "app", None).unwrap();
        let wt = mgr
            .create_goal_worktree(&ws.path, "goal_1", Some("feature"))
            .unwrap();

        std::fs::write(wt.path.join("feature.txt"), "new feature\n").unwrap();
        assert!(mgr.commit_all(&wt.path, "Goal complete: feature").unwrap());

        let outcome = mgr.merge_goal_branch(&ws.path, &wt.branch).expect("merge failed");
        assert_eq!(outcome, MergeOutcome::Merged);
        assert!(ws.path.join("feature.txt").exists());
    }

    #[test]
    fn merge_goal_branch_conflict_aborts() {
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());
        let ws = mgr.create_strand_workspace("strand_1", "app", None).unwrap();
        std::fs::write(ws.path.join("shared.txt"), "base\n").unwrap();
        mgr.commit_all(&ws.path, "add shared").unwrap();

        let wt = mgr
            .create_goal_worktree(&ws.path, "goal_1", Some("conflicting"))
            .unwrap();

        // Diverge: both sides edit the same file.
        std::fs::write(wt.path.join("shared.txt"), "goal version\n").unwrap();
        mgr.commit_all(&wt.path, "goal edit").unwrap();
        std::fs::write(ws.path.join("shared.txt"), "main version\n").unwrap();
        mgr.commit_all(&ws.path, "main edit").unwrap();

        let outcome = mgr.merge_goal_branch(&ws.path, &wt.branch).expect("merge errored");
        match outcome {
            MergeOutcome::Conflict { details } => {
                assert!(details.contains("CONFLICT") || details.contains("conflict"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // Merge was aborted: main still has its own version.
        let content = std::fs::read_to_string(ws.path.join("shared.txt")).unwrap();
        assert_eq!(content, "main version\n");
    }

    #[test]
    fn branch_status_counts_ahead_and_behind() {
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());
        let ws = mgr.create_strand_workspace("strand_1", "app", None).unwrap();
        let wt = mgr
            .create_goal_worktree(&ws.path, "goal_1", Some("work"))
            .unwrap();

        std::fs::write(wt.path.join("a.txt"), "a\n").unwrap();
        mgr.commit_all(&wt.path, "a").unwrap();
        std::fs::write(wt.path.join("b.txt"), "b\n").unwrap();
        mgr.commit_all(&wt.path, "b").unwrap();
        std::fs::write(ws.path.join("c.txt"), "c\n").unwrap();
        mgr.commit_all(&ws.path, "c").unwrap();

        let status = mgr.check_branch_status(&ws.path, &wt.branch).unwrap();
        assert_eq!(status.ahead, 2);
        assert_eq!(status.behind, 1);
        assert!(status.conflict_files.is_empty());
    }

    #[test]
    fn push_without_remote_is_non_fatal() {
        let base = tempfile::TempDir::new().unwrap();
        let mgr = WorkspaceManager::new(base.path());
        let ws = mgr.create_strand_workspace("strand_1", "app", None).unwrap();

        let outcome = mgr.push_main(&ws.path).expect("push errored");
        assert_eq!(outcome, PushOutcome::NoRemote);
    }

    #[test]
    fn detect_main_branch_prefers_main() {
        let (_dir, repo) = create_temp_repo();
        let mgr = WorkspaceManager::new("/tmp");
        assert_eq!(mgr.detect_main_branch(&repo).unwrap(), "main");
    }
}
