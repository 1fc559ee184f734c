//! Supervisor configuration.
//!
//! Configuration is resolved once at startup from three layers, lowest
//! priority first:
//! - built-in defaults (the historical constants of the loop script)
//! - an optional TOML file (`.ralph/supervisor.toml` unless overridden)
//! - `RALPH_*` environment variables (e.g. `RALPH_AGENT_COMMAND`,
//!   `RALPH_RESTART_DELAY_MS`)
//!
//! The resulting [`SupervisorConfig`] is immutable for the life of the process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

/// Default location of the optional configuration file.
pub const DEFAULT_CONFIG_FILE: &str = ".ralph/supervisor.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "RALPH";

/// Older name of `agent_command`.
const LEGACY_AGENT_COMMAND_KEY: &str = "copilot_cmd";

const DEFAULT_SEED_PROMPT: &str =
    "Load PROMPT.md and prepare for iterative development. Wait for further instructions.";

const DEFAULT_ITERATION_PROMPT: &str = "Begin the NEXT iteration using the Iteration template in PROMPT.md.
Focus on the smallest high-value increment.
End the iteration with: RALPH_NEXT
";

/// Errors that can occur while resolving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The merged configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// What the controller does when an iteration succeeds without the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingSentinelPolicy {
    /// Stay idle until a termination request arrives.
    #[default]
    Pause,
    /// Treat it like a failed invocation and retry after the restart delay.
    Retry,
}

/// How a failed persistence run affects the iteration that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    /// Log the failure and dispatch the prompt anyway.
    #[default]
    Lenient,
    /// Skip the prompt and retry the iteration-start sequence.
    Strict,
}

/// Process-wide supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Executable of the agent CLI.
    ///
    /// The legacy key `copilot_cmd` (`RALPH_COPILOT_CMD`) is used only when
    /// `agent_command` is not set by any source.
    pub agent_command: String,
    /// Extra arguments placed before `-p <prompt>`.
    pub agent_args: Vec<String>,
    /// Path of the append-only log file.
    pub log_file: PathBuf,
    /// Size in bytes above which the log file is rotated.
    pub max_log_size: u64,
    /// Completion marker searched for in the agent's stdout.
    pub sentinel: String,
    /// Delay before retrying after a failed iteration.
    pub restart_delay_ms: u64,
    /// Delay before starting the next iteration once the sentinel is seen.
    pub next_iteration_delay_ms: u64,
    /// Delay between seeding and the first iteration.
    pub seed_delay_ms: u64,
    /// Priming prompt sent once at startup.
    pub seed_prompt: String,
    /// Prompt sent for every iteration.
    pub iteration_prompt: String,
    /// Commit message prefix, followed by a timestamp.
    pub commit_prefix: String,
    /// Remote to push to.
    pub remote: String,
    /// Branch to push to.
    pub branch: String,
    /// Stop before starting iteration `max_iterations + 1` (0 = unlimited).
    pub max_iterations: u64,
    /// Behaviour when the sentinel is absent.
    pub on_missing_sentinel: MissingSentinelPolicy,
    /// Behaviour when the persistence pipeline fails.
    pub persistence: PersistenceMode,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            agent_command: "copilot".to_string(),
            agent_args: Vec::new(),
            log_file: PathBuf::from(".ralph").join("cli.log"),
            max_log_size: 10 * 1024 * 1024,
            sentinel: "RALPH_NEXT".to_string(),
            restart_delay_ms: 5000,
            next_iteration_delay_ms: 1000,
            seed_delay_ms: 1000,
            seed_prompt: DEFAULT_SEED_PROMPT.to_string(),
            iteration_prompt: DEFAULT_ITERATION_PROMPT.to_string(),
            commit_prefix: "ralph: iteration ".to_string(),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            max_iterations: 0,
            on_missing_sentinel: MissingSentinelPolicy::default(),
            persistence: PersistenceMode::default(),
        }
    }
}

impl SupervisorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from the file layer and the process environment.
    ///
    /// With `path` set the file must exist; otherwise
    /// [`DEFAULT_CONFIG_FILE`] is read only if present.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        Self::load_with_env(path, None)
    }

    /// Same as [`load`](Self::load), but reads environment overrides from
    /// `vars` instead of the process environment when given.
    ///
    /// Keys in `vars` carry the `RALPH_` prefix, as real variables would.
    pub fn load_with_env(
        path: Option<&Path>,
        vars: Option<config::Map<String, String>>,
    ) -> ConfigResult<Self> {
        let file = match path {
            Some(p) => File::from(p).format(FileFormat::Toml).required(true),
            None => File::from(Path::new(DEFAULT_CONFIG_FILE))
                .format(FileFormat::Toml)
                .required(false),
        };

        let environment = Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .list_separator(" ")
            .with_list_parse_key("agent_args")
            .source(vars);

        let settings = Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?;

        let legacy_command = match settings.get_string("agent_command") {
            Ok(_) => None,
            Err(_) => settings.get_string(LEGACY_AGENT_COMMAND_KEY).ok(),
        };

        let mut config: SupervisorConfig = settings.try_deserialize()?;
        if let Some(command) = legacy_command {
            config.agent_command = command;
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the supervisor cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.agent_command.trim().is_empty() {
            return Err(ConfigError::Invalid("agent_command is empty".to_string()));
        }
        if self.sentinel.is_empty() {
            return Err(ConfigError::Invalid("sentinel is empty".to_string()));
        }
        if self.max_log_size == 0 {
            return Err(ConfigError::Invalid(
                "max_log_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retrying after a failure.
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Delay before the next iteration after the sentinel was detected.
    pub fn next_iteration_delay(&self) -> Duration {
        Duration::from_millis(self.next_iteration_delay_ms)
    }

    /// Delay between seeding and the first iteration.
    pub fn seed_delay(&self) -> Duration {
        Duration::from_millis(self.seed_delay_ms)
    }

    /// Sets the agent command.
    pub fn with_agent_command(mut self, command: impl Into<String>) -> Self {
        self.agent_command = command.into();
        self
    }

    /// Sets the completion sentinel.
    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    /// Sets all three scheduling delays at once.
    pub fn with_delays(mut self, seed: Duration, next: Duration, restart: Duration) -> Self {
        self.seed_delay_ms = saturating_millis(seed);
        self.next_iteration_delay_ms = saturating_millis(next);
        self.restart_delay_ms = saturating_millis(restart);
        self
    }

    /// Sets the iteration limit (0 = unlimited).
    pub fn with_max_iterations(mut self, max: u64) -> Self {
        self.max_iterations = max;
        self
    }

    /// Sets the missing-sentinel policy.
    pub fn with_missing_sentinel_policy(mut self, policy: MissingSentinelPolicy) -> Self {
        self.on_missing_sentinel = policy;
        self
    }

    /// Sets the persistence strictness.
    pub fn with_persistence_mode(mut self, mode: PersistenceMode) -> Self {
        self.persistence = mode;
        self
    }
}

fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
