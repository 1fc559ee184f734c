//! Save-and-publish pipeline.
//!
//! A pipeline run executes an ordered list of [`CommandStep`]s, each as its
//! own process. Step `n + 1` starts only after step `n` exits with status 0;
//! the first failure aborts the run and is reported with the failing step's
//! position. The pipeline does not know what the steps mean. [`git_steps`]
//! builds the stage / commit / push sequence the supervisor uses.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::process::{CommandRunner, ProcessError, ProcessInvocation};

/// Error returned when a pipeline step fails.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// A step could not be launched or exited non-zero. Later steps were skipped.
    #[error("Step {position}/{total} `{step}` failed: {source}")]
    StepFailed {
        /// 1-based position of the failing step.
        position: usize,
        /// Number of steps in the run.
        total: usize,
        /// The failing command line.
        step: String,
        #[source]
        source: ProcessError,
    },
}

impl PersistenceError {
    /// 1-based position of the failing step.
    pub fn position(&self) -> usize {
        match self {
            PersistenceError::StepFailed { position, .. } => *position,
        }
    }

    /// Underlying process failure.
    pub fn process_error(&self) -> &ProcessError {
        match self {
            PersistenceError::StepFailed { source, .. } => source,
        }
    }
}

/// Result type for pipeline runs.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// One command of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandStep {
    /// Creates a step running `program` with `args`.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn invocation(&self, working_dir: Option<&PathBuf>) -> ProcessInvocation {
        let invocation = ProcessInvocation::new(&self.program)
            .args(self.args.iter().cloned())
            .quiet();
        match working_dir {
            Some(dir) => invocation.current_dir(dir),
            None => invocation,
        }
    }
}

impl fmt::Display for CommandStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Builds the commit message for a run at `at`.
///
/// The timestamp is the ISO-8601 UTC time with `:` replaced by `-` and
/// sub-second precision dropped, e.g. `ralph: iteration 2024-05-06T07-08-09Z`.
pub fn commit_message(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}{}", prefix, at.format("%Y-%m-%dT%H-%M-%SZ"))
}

/// Stage everything, commit with `message`, push to `remote`/`branch`.
pub fn git_steps(message: &str, remote: &str, branch: &str) -> Vec<CommandStep> {
    vec![
        CommandStep::new("git", ["add", "-A"]),
        CommandStep::new("git", ["commit", "-m", message]),
        CommandStep::new("git", ["push", remote, branch]),
    ]
}

/// Runs command sequences with short-circuit on failure.
///
/// Runs are serialized: a second `run` waits until the first one resolves.
pub struct PersistencePipeline {
    runner: Arc<dyn CommandRunner>,
    working_dir: Option<PathBuf>,
    gate: Mutex<()>,
}

impl PersistencePipeline {
    /// Creates a pipeline that launches steps through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            working_dir: None,
            gate: Mutex::new(()),
        }
    }

    /// Runs every step in `working_dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Executes `steps` strictly in order, stopping at the first failure.
    pub async fn run(&self, steps: &[CommandStep]) -> PersistenceResult<()> {
        let _guard = self.gate.lock().await;
        let total = steps.len();

        for (index, step) in steps.iter().enumerate() {
            debug!("Persistence step {}/{}: {}", index + 1, total, step);
            self.runner
                .run(step.invocation(self.working_dir.as_ref()))
                .await
                .map_err(|source| PersistenceError::StepFailed {
                    position: index + 1,
                    total,
                    step: step.to_string(),
                    source,
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessResult;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex as StdMutex;

    /// Fails the invocation at `fail_at` (1-based), succeeds otherwise.
    struct ScriptedRunner {
        fail_at: Option<usize>,
        spawn_failure: bool,
        calls: StdMutex<Vec<ProcessInvocation>>,
    }

    impl ScriptedRunner {
        fn new(fail_at: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                fail_at,
                spawn_failure: false,
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn spawn_failing(fail_at: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_at: Some(fail_at),
                spawn_failure: true,
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<ProcessInvocation> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, invocation: ProcessInvocation) -> ProcessResult<String> {
            let position = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(invocation.clone());
                calls.len()
            };

            if self.fail_at == Some(position) {
                if self.spawn_failure {
                    return Err(ProcessError::Spawn {
                        program: invocation.program,
                        source: io::Error::new(io::ErrorKind::NotFound, "not found"),
                    });
                }
                return Err(ProcessError::Exit {
                    program: invocation.program,
                    code: Some(1),
                    stderr: "nothing to commit".to_string(),
                });
            }
            Ok(String::new())
        }
    }

    fn steps() -> Vec<CommandStep> {
        git_steps("ralph: iteration 2024-01-01T00-00-00Z", "origin", "main")
    }

    #[test]
    fn test_commit_message_format() {
        let at = DateTime::parse_from_rfc3339("2024-05-06T07:08:09.123Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            commit_message("ralph: iteration ", at),
            "ralph: iteration 2024-05-06T07-08-09Z"
        );
    }

    #[test]
    fn test_git_steps() {
        let steps = git_steps("msg with spaces", "upstream", "trunk");
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], CommandStep::new("git", ["add", "-A"]));
        assert_eq!(
            steps[1],
            CommandStep::new("git", ["commit", "-m", "msg with spaces"])
        );
        assert_eq!(steps[2].to_string(), "git push upstream trunk");
    }

    #[tokio::test]
    async fn test_all_steps_run_in_order() {
        let runner = ScriptedRunner::new(None);
        let pipeline = PersistencePipeline::new(runner.clone()).with_working_dir("/repo");

        pipeline.run(&steps()).await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].args, vec!["add", "-A"]);
        assert_eq!(calls[1].args[0], "commit");
        assert_eq!(calls[2].args, vec!["push", "origin", "main"]);
        assert!(calls.iter().all(|c| !c.echo_output));
        assert!(calls
            .iter()
            .all(|c| c.working_dir == Some(PathBuf::from("/repo"))));
    }

    #[tokio::test]
    async fn test_failure_short_circuits_remaining_steps() {
        let runner = ScriptedRunner::new(Some(2));
        let pipeline = PersistencePipeline::new(runner.clone());

        let err = pipeline.run(&steps()).await.unwrap_err();

        assert_eq!(runner.calls().len(), 2);
        assert_eq!(err.position(), 2);
        assert_eq!(err.process_error().exit_code(), Some(1));
        assert_eq!(err.process_error().stderr(), Some("nothing to commit"));
        let message = err.to_string();
        assert!(message.contains("Step 2/3"));
        assert!(message.contains("git commit -m"));
    }

    #[tokio::test]
    async fn test_spawn_failure_aborts_first_step() {
        let runner = ScriptedRunner::spawn_failing(1);
        let pipeline = PersistencePipeline::new(runner.clone());

        let err = pipeline.run(&steps()).await.unwrap_err();

        assert_eq!(runner.calls().len(), 1);
        assert_eq!(err.position(), 1);
        assert!(err.process_error().is_spawn_failure());
    }

    #[tokio::test]
    async fn test_empty_pipeline_succeeds() {
        let runner = ScriptedRunner::new(Some(1));
        let pipeline = PersistencePipeline::new(runner.clone());
        pipeline.run(&[]).await.unwrap();
        assert!(runner.calls().is_empty());
    }
}
