//! External process invocation.
//!
//! A [`ProcessInvocation`] describes one launch of an external command. A
//! [`CommandRunner`] executes it and resolves with the captured stdout when
//! the process exits with status 0. [`ProcessRunner`] is the real
//! implementation backed by `tokio::process`.

pub mod runner;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use runner::ProcessRunner;

/// Errors that can occur while running an external process.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The executable could not be launched at all.
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The process ran but did not exit with status 0.
    #[error("{program} failed ({}): {stderr}", describe_exit(.code))]
    Exit {
        program: String,
        /// Exit code, `None` when the process was terminated by a signal.
        code: Option<i32>,
        /// Everything the process wrote to stderr.
        stderr: String,
    },

    /// Reading the output streams or waiting on the child failed.
    #[error("Failed to collect output of {program}: {source}")]
    Stream {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl ProcessError {
    /// Exit code of a process that ran and failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::Exit { code, .. } => *code,
            _ => None,
        }
    }

    /// Captured stderr of a process that ran and failed.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessError::Exit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Whether the executable never started.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, ProcessError::Spawn { .. })
    }
}

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// One launch of an external command.
///
/// Stdin is always disconnected. The child inherits the supervisor's
/// environment, extended by `env`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInvocation {
    /// Executable name or path.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Working directory; the supervisor's own when `None`.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Prefix used when echoing output chunks to the log.
    pub label: String,
    /// Whether output chunks are echoed to the log as they arrive.
    pub echo_output: bool,
}

impl ProcessInvocation {
    /// Creates an invocation of `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let label = Path::new(&program)
            .file_name()
            .map(|name| name.to_string_lossy().to_uppercase())
            .unwrap_or_else(|| program.to_uppercase());
        Self {
            label,
            program,
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            echo_output: true,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the log prefix for echoed output.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Captures output without echoing it to the log.
    pub fn quiet(mut self) -> Self {
        self.echo_output = false;
        self
    }
}

impl fmt::Display for ProcessInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Executes external processes.
///
/// Implementations resolve with the full stdout text only when the process
/// exits with status 0.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `invocation` to completion.
    async fn run(&self, invocation: ProcessInvocation) -> ProcessResult<String>;
}
