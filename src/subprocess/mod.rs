//! Subprocess abstraction layer for external tool integration.
//!
//! Everything the daemon shells out to — git for worktree plumbing, the
//! `claude` CLI for agent sessions — goes through the [`ProcessRunner`]
//! trait so production and tests share one code path. The production runner
//! is tokio-based; tests swap in [`MockProcessRunner`] with scripted
//! expectations.

pub mod builder;
pub mod error;
pub mod mock;
pub mod runner;

pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use mock::{MockCommandConfig, MockProcessRunner};
pub use runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner};

use std::sync::Arc;

/// Shared handle to a process runner.
///
/// Cheap to clone; the worktree manager and the agent runtime each hold one.
#[derive(Clone)]
pub struct SubprocessManager {
    runner: Arc<dyn ProcessRunner>,
}

impl SubprocessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Production manager backed by the tokio process runner.
    pub fn production() -> Self {
        Self::new(Arc::new(runner::TokioProcessRunner))
    }

    /// Mock manager for tests; returns the mock so expectations can be
    /// configured after construction.
    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let runner = Arc::new(mock.clone()) as Arc<dyn ProcessRunner>;
        (Self::new(runner), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn production_runner_success() {
        let runner = runner::TokioProcessRunner;
        let command = ProcessCommandBuilder::new("echo").arg("hello world").build();

        let output = runner.run(command).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "hello world");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn production_runner_failure_exit_code() {
        let runner = runner::TokioProcessRunner;
        let command = ProcessCommandBuilder::new("false").build();

        let output = runner.run(command).await.unwrap();
        assert!(!output.status.success());
        assert_eq!(output.status.code(), Some(1));
    }

    #[tokio::test]
    async fn production_runner_command_not_found() {
        let runner = runner::TokioProcessRunner;
        let command = ProcessCommandBuilder::new("nonexistent-command-12345").build();

        let result = runner.run(command).await;
        assert!(matches!(
            result.unwrap_err(),
            ProcessError::CommandNotFound(_)
        ));
    }

    #[tokio::test]
    async fn production_runner_timeout() {
        let runner = runner::TokioProcessRunner;
        let command = ProcessCommandBuilder::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100))
            .build();

        let result = runner.run(command).await;
        assert!(matches!(result.unwrap_err(), ProcessError::Timeout(_)));
    }

    #[tokio::test]
    async fn production_runner_pipes_stdin() {
        let runner = runner::TokioProcessRunner;
        let command = ProcessCommandBuilder::new("cat")
            .stdin("piped input".to_string())
            .build();

        let output = runner.run(command).await.unwrap();
        assert_eq!(output.stdout, "piped input");
    }

    #[tokio::test]
    async fn mock_runner_matches_program_and_args() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .with_args(|args| args == ["status"])
            .returns_stdout("On branch main\n")
            .returns_success()
            .finish();

        let output = mock
            .run(ProcessCommandBuilder::new("git").arg("status").build())
            .await
            .unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout, "On branch main\n");
        assert!(mock.verify_called("git", 1));
    }

    #[tokio::test]
    async fn mock_runner_rejects_unexpected_commands() {
        let mock = MockProcessRunner::new();
        let result = mock
            .run(ProcessCommandBuilder::new("rm").arg("-rf").build())
            .await;
        assert!(matches!(
            result.unwrap_err(),
            ProcessError::MockExpectationNotMet(_)
        ));
    }

    #[tokio::test]
    async fn mock_runner_enforces_call_count() {
        let mut mock = MockProcessRunner::new();
        mock.expect_command("git")
            .with_args(|args| args == ["merge", "--abort"])
            .returns_success()
            .times(1)
            .finish();

        let cmd = || ProcessCommandBuilder::new("git").args(["merge", "--abort"]).build();
        assert!(mock.run(cmd()).await.is_ok());
        assert!(mock.run(cmd()).await.is_err());
    }

    #[tokio::test]
    async fn manager_exposes_shared_runner() {
        let (manager, mut mock) = SubprocessManager::mock();
        mock.expect_command("ls")
            .returns_stdout("file1.txt\n")
            .returns_success()
            .finish();

        let output = manager
            .runner()
            .run(ProcessCommandBuilder::new("ls").build())
            .await
            .unwrap();
        assert_eq!(output.stdout, "file1.txt\n");
    }
}
