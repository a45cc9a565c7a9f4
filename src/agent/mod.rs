//! Agent runtime seam.
//!
//! The daemon treats the thing that actually works a ticket as an opaque
//! session: hand it a working directory, a model identifier, and a prompt,
//! get back a status and a response. Production uses the `claude` CLI
//! through the subprocess layer; tests use [`ScriptedRuntime`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{DaemonError, Result};
use crate::subprocess::{ProcessCommandBuilder, ProcessError, SubprocessManager};

/// Marker an agent emits when it believes the whole project is finished.
const PROJECT_COMPLETE_MARKER: &str = "PROJECT_COMPLETE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session finished normally; more work may remain.
    Continue,
    /// Session reports the project as complete. Logged, never fatal.
    Complete,
    Error,
}

#[derive(Debug, Clone)]
pub struct SessionResult {
    pub status: SessionStatus,
    pub response: String,
}

impl SessionResult {
    pub fn error(response: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Error,
            response: response.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == SessionStatus::Error
    }
}

/// One agent session: run to completion in `workdir` with the given model.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run_session(
        &self,
        workdir: &Path,
        model: &str,
        prompt: &str,
    ) -> Result<SessionResult>;
}

/// Production runtime backed by the `claude` CLI.
pub struct ClaudeCliRuntime {
    subprocess: SubprocessManager,
}

impl ClaudeCliRuntime {
    pub fn new(subprocess: SubprocessManager) -> Self {
        Self { subprocess }
    }

    /// Probe for the CLI so startup can warn early instead of failing on
    /// the first dispatch.
    pub async fn check_availability(&self) -> Result<bool> {
        let result = self
            .subprocess
            .runner()
            .run(ProcessCommandBuilder::new("claude").arg("--version").build())
            .await;

        match result {
            Ok(output) => Ok(output.status.success()),
            Err(ProcessError::CommandNotFound(_)) => Ok(false),
            Err(e) => Err(DaemonError::AgentRuntime(e.to_string())),
        }
    }
}

#[async_trait]
impl AgentRuntime for ClaudeCliRuntime {
    async fn run_session(
        &self,
        workdir: &Path,
        model: &str,
        prompt: &str,
    ) -> Result<SessionResult> {
        let command = ProcessCommandBuilder::new("claude")
            .arg("-p")
            .args(["--model", model])
            .args(["--output-format", "text"])
            .current_dir(workdir)
            .stdin(prompt.to_string())
            .build();

        let output = self
            .subprocess
            .runner()
            .run(command)
            .await
            .map_err(|e| DaemonError::AgentRuntime(e.to_string()))?;

        if !output.status.success() {
            let detail = if output.stderr.trim().is_empty() {
                format!("claude exited with code {}", output.status.code().unwrap_or(-1))
            } else {
                output.stderr.trim().to_string()
            };
            return Ok(SessionResult::error(detail));
        }

        let status = if output.stdout.contains(PROJECT_COMPLETE_MARKER) {
            SessionStatus::Complete
        } else {
            SessionStatus::Continue
        };

        Ok(SessionResult {
            status,
            response: output.stdout,
        })
    }
}

/// Task prompt for continuing work on an initialized project.
pub fn continuation_prompt(project_dir: &Path) -> String {
    format!(
        "Continue work on the project at {}. Check the tracker for the next \
         actionable ticket, implement it, run the tests, and move the ticket \
         to the appropriate state. If the tracker has no actionable tickets, \
         say so and stop.",
        project_dir.display()
    )
}

/// Task prompt for first-time project setup.
pub fn initializer_prompt(project_dir: &Path) -> String {
    format!(
        "Initialize the project at {}. Read the project specification, set \
         up the tracker state, and prepare the repository so ticketed work \
         can begin.",
        project_dir.display()
    )
}

/// Scripted runtime for tests: returns queued results in order and records
/// every session request it receives.
#[derive(Default)]
pub struct ScriptedRuntime {
    results: Mutex<std::collections::VecDeque<SessionResult>>,
    sessions: Mutex<Vec<RecordedSession>>,
}

#[derive(Debug, Clone)]
pub struct RecordedSession {
    pub workdir: PathBuf,
    pub model: String,
    pub prompt: String,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, result: SessionResult) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn sessions(&self) -> Vec<RecordedSession> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn run_session(
        &self,
        workdir: &Path,
        model: &str,
        prompt: &str,
    ) -> Result<SessionResult> {
        self.sessions.lock().unwrap().push(RecordedSession {
            workdir: workdir.to_path_buf(),
            model: model.to_string(),
            prompt: prompt.to_string(),
        });

        Ok(self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SessionResult {
                status: SessionStatus::Continue,
                response: "ok".to_string(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cli_runtime_reports_continue_on_success() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("claude")
            .with_args(|args| args.contains(&"--model".to_string()))
            .returns_stdout("Implemented ENG-1, tests pass.")
            .returns_success()
            .finish();

        let runtime = ClaudeCliRuntime::new(subprocess);
        let result = runtime
            .run_session(Path::new("/tmp/project"), "claude-sonnet-4-5-20250929", "go")
            .await
            .unwrap();

        assert_eq!(result.status, SessionStatus::Continue);
        assert!(result.response.contains("ENG-1"));
    }

    #[tokio::test]
    async fn cli_runtime_detects_project_complete_marker() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("claude")
            .returns_stdout("All tickets done. PROJECT_COMPLETE")
            .returns_success()
            .finish();

        let runtime = ClaudeCliRuntime::new(subprocess);
        let result = runtime
            .run_session(Path::new("/tmp/project"), "m", "go")
            .await
            .unwrap();
        assert_eq!(result.status, SessionStatus::Complete);
    }

    #[tokio::test]
    async fn cli_runtime_maps_nonzero_exit_to_error_result() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("claude")
            .returns_exit_code(1)
            .returns_stderr("API rate limit exceeded")
            .finish();

        let runtime = ClaudeCliRuntime::new(subprocess);
        let result = runtime
            .run_session(Path::new("/tmp/project"), "m", "go")
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.response.contains("rate limit"));
    }

    #[tokio::test]
    async fn cli_runtime_passes_prompt_via_stdin_and_sets_cwd() {
        let (subprocess, mut mock) = SubprocessManager::mock();
        mock.expect_command("claude").returns_success().finish();

        let runtime = ClaudeCliRuntime::new(subprocess);
        runtime
            .run_session(Path::new("/work/tree"), "model-id", "the prompt")
            .await
            .unwrap();

        let calls = mock.call_history();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].stdin.as_deref(), Some("the prompt"));
        assert_eq!(
            calls[0].working_dir.as_deref(),
            Some(Path::new("/work/tree"))
        );
        assert!(calls[0].args.contains(&"model-id".to_string()));
    }

    #[tokio::test]
    async fn scripted_runtime_returns_queued_results() {
        let runtime = ScriptedRuntime::new();
        runtime.push_result(SessionResult::error("boom"));

        let first = runtime
            .run_session(Path::new("/p"), "m", "prompt")
            .await
            .unwrap();
        assert!(first.is_error());

        let second = runtime
            .run_session(Path::new("/p"), "m", "prompt")
            .await
            .unwrap();
        assert_eq!(second.status, SessionStatus::Continue);

        assert_eq!(runtime.sessions().len(), 2);
    }
}
