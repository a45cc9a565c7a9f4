//! Git worktree management for parallel coding workers.
//!
//! Each coding worker gets its own checkout under `<project>/.worktrees/`
//! so agents can work on different branches simultaneously without stepping
//! on each other. Dev-server ports are handed out from a fixed range to
//! avoid collisions between concurrent checkouts.
//!
//! All git interaction goes through the subprocess layer with a hard 60 s
//! timeout per call. Merge conflicts are reported as `Ok(false)` rather
//! than errors; every other git failure surfaces as
//! [`DaemonError::Worktree`].

use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{DaemonError, Result};
use crate::subprocess::{ProcessCommandBuilder, ProcessError, ProcessOutput, SubprocessManager};

pub const WORKTREE_DIR_NAME: &str = ".worktrees";

/// Dev-server ports handed to coding workers, inclusive on both ends.
pub const PORT_RANGE: RangeInclusive<u16> = 3100..=3199;

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Generate a git-safe branch name for a ticket, e.g.
/// `eng-123-fix-login-flow`.
pub fn branch_for_ticket(ticket_key: &str, ticket_title: &str) -> String {
    let slug = sanitize_branch_slug(ticket_title);
    let key_slug = ticket_key.to_lowercase().replace(' ', "-");
    if slug.is_empty() {
        key_slug
    } else {
        format!("{key_slug}-{slug}")
    }
}

/// Lowercase, collapse runs of non-alphanumerics into single hyphens, trim
/// hyphens, truncate to 60 chars.
fn sanitize_branch_slug(name: &str) -> String {
    let mut slug = String::new();
    let mut pending_hyphen = false;
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch);
        } else {
            pending_hyphen = true;
        }
    }
    slug.truncate(60);
    slug
}

struct WorktreeState {
    allocated_ports: BTreeSet<u16>,
    worker_worktrees: HashMap<String, PathBuf>,
}

/// Manages git worktrees and the dev-server port range for coding workers.
///
/// Callers serialize create/remove per `worker_id`; the dispatcher
/// guarantees this because a worker runs at most one ticket at a time.
pub struct WorktreeManager {
    project_dir: PathBuf,
    base_dir: PathBuf,
    subprocess: SubprocessManager,
    state: Mutex<WorktreeState>,
}

impl WorktreeManager {
    pub fn new(project_dir: PathBuf, subprocess: SubprocessManager) -> Self {
        let base_dir = project_dir.join(WORKTREE_DIR_NAME);
        Self {
            project_dir,
            base_dir,
            subprocess,
            state: Mutex::new(WorktreeState {
                allocated_ports: BTreeSet::new(),
                worker_worktrees: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorktreeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a git command in `cwd`, failing on non-zero exit.
    async fn run_git(&self, args: &[&str], cwd: &Path) -> Result<ProcessOutput> {
        let output = self.run_git_unchecked(args, cwd).await?;
        if !output.status.success() {
            return Err(DaemonError::Worktree(format!(
                "git {} failed (code {}): {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                output.stderr.trim(),
            )));
        }
        Ok(output)
    }

    /// Run a git command, surfacing only spawn/timeout failures. The caller
    /// inspects the exit status.
    async fn run_git_unchecked(&self, args: &[&str], cwd: &Path) -> Result<ProcessOutput> {
        let command = ProcessCommandBuilder::new("git")
            .args(args)
            .current_dir(cwd)
            .timeout(GIT_TIMEOUT)
            .build();

        self.subprocess.runner().run(command).await.map_err(|e| match e {
            ProcessError::Timeout(_) => DaemonError::Worktree(format!(
                "git {} timed out after {}s",
                args.join(" "),
                GIT_TIMEOUT.as_secs()
            )),
            other => DaemonError::Worktree(format!("git {} failed: {}", args.join(" "), other)),
        })
    }

    /// Create a worktree for a worker, pinned to `branch`.
    ///
    /// Replaces any stale worktree left at the worker's path, and creates
    /// the branch from HEAD if it does not exist yet.
    pub async fn create_worktree(&self, worker_id: &str, branch: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.base_dir)?;
        let worktree_path = self.base_dir.join(worker_id);

        if worktree_path.exists() {
            self.remove_worktree(worker_id).await?;
        }

        let listed = self
            .run_git(&["branch", "--list", branch], &self.project_dir)
            .await?;
        if !listed.stdout.contains(branch) {
            self.run_git(&["branch", branch], &self.project_dir).await?;
        }

        let path_str = worktree_path.to_string_lossy().to_string();
        self.run_git(&["worktree", "add", &path_str, branch], &self.project_dir)
            .await?;

        self.lock()
            .worker_worktrees
            .insert(worker_id.to_string(), worktree_path.clone());
        info!(
            "Created worktree for {} at {} (branch={})",
            worker_id,
            worktree_path.display(),
            branch,
        );
        Ok(worktree_path)
    }

    /// Remove a worker's worktree with force. Succeeds when the path is
    /// already gone.
    pub async fn remove_worktree(&self, worker_id: &str) -> Result<()> {
        let worktree_path = self
            .lock()
            .worker_worktrees
            .remove(worker_id)
            .unwrap_or_else(|| self.base_dir.join(worker_id));

        if worktree_path.exists() {
            let path_str = worktree_path.to_string_lossy().to_string();
            self.run_git(
                &["worktree", "remove", &path_str, "--force"],
                &self.project_dir,
            )
            .await?;
            info!("Removed worktree for {}", worker_id);
        }
        Ok(())
    }

    /// Merge a branch back to main with `--no-ff`.
    ///
    /// Returns `Ok(false)` on conflict — the merge is aborted and the branch
    /// left behind for manual review. Other git failures propagate.
    pub async fn merge_to_main(&self, branch: &str) -> Result<bool> {
        self.run_git(&["checkout", "main"], &self.project_dir).await?;

        let message = format!("Merge {branch}");
        let output = self
            .run_git_unchecked(
                &["merge", "--no-ff", branch, "-m", &message],
                &self.project_dir,
            )
            .await?;

        if output.status.success() {
            info!("Merged {} to main", branch);
            return Ok(true);
        }

        let combined = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
        if combined.contains("conflict") {
            let _ = self
                .run_git_unchecked(&["merge", "--abort"], &self.project_dir)
                .await;
            warn!("Merge conflict on {}, aborting", branch);
            return Ok(false);
        }

        Err(DaemonError::Worktree(format!(
            "git merge --no-ff {} failed (code {}): {}",
            branch,
            output.status.code().unwrap_or(-1),
            output.stderr.trim(),
        )))
    }

    /// Allocate the lowest free port in [`PORT_RANGE`].
    pub fn allocate_port(&self) -> Result<u16> {
        let mut state = self.lock();
        for port in PORT_RANGE {
            if !state.allocated_ports.contains(&port) {
                state.allocated_ports.insert(port);
                return Ok(port);
            }
        }
        Err(DaemonError::Worktree(format!(
            "No free ports in range {}-{}",
            PORT_RANGE.start(),
            PORT_RANGE.end()
        )))
    }

    /// Release a previously allocated port. No-op for unallocated ports.
    pub fn release_port(&self, port: u16) {
        self.lock().allocated_ports.remove(&port);
    }

    /// Remove worktree directories that no longer belong to a tracked
    /// worker. Returns the number removed.
    pub async fn cleanup_stale_worktrees(&self) -> Result<usize> {
        if !self.base_dir.exists() {
            return Ok(0);
        }

        let stale: Vec<PathBuf> = {
            let state = self.lock();
            let mut found = Vec::new();
            for entry in std::fs::read_dir(&self.base_dir)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if !state.worker_worktrees.contains_key(&name) {
                    found.push(path);
                }
            }
            found
        };

        let mut cleaned = 0;
        for path in stale {
            let path_str = path.to_string_lossy().to_string();
            match self
                .run_git(
                    &["worktree", "remove", &path_str, "--force"],
                    &self.project_dir,
                )
                .await
            {
                Ok(_) => {
                    cleaned += 1;
                    info!("Cleaned stale worktree: {}", path.display());
                }
                Err(e) => {
                    warn!("Failed to clean worktree {}: {}", path.display(), e);
                }
            }
        }
        Ok(cleaned)
    }
}
