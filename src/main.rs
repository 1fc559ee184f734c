use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use ralph_supervisor::config::SupervisorConfig;
use ralph_supervisor::logging::{init_logging, ActivityClock, LoggingConfig};
use ralph_supervisor::process::{CommandRunner, ProcessRunner};
use ralph_supervisor::shutdown::ShutdownHandle;
use ralph_supervisor::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "ralph-loop")]
#[command(version)]
#[command(about = "Drive a CLI coding agent through committed, pushed iterations")]
#[command(after_help = "Settings come from .ralph/supervisor.toml (if present) and RALPH_* \
environment variables, e.g. RALPH_AGENT_COMMAND=copilot RALPH_RESTART_DELAY_MS=5000")]
struct Cli {
    /// Configuration file (default: .ralph/supervisor.toml when it exists)
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Working directory (repository the agent works in)
    #[arg(long, short = 'd', value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Do not echo the log on the console; the log file is still written
    #[arg(long, short)]
    quiet: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(ref dir) = cli.dir {
        std::env::set_current_dir(dir)
            .map_err(|e| format!("Cannot enter {}: {}", dir.display(), e))?;
    }

    let config = SupervisorConfig::load(cli.config.as_deref())?;

    let activity = ActivityClock::new();
    init_logging(
        LoggingConfig::from_verbosity(cli.verbose)
            .with_console(!cli.quiet)
            .with_log_file(&config.log_file, config.max_log_size)
            .with_activity(activity.clone()),
    );

    let shutdown = ShutdownHandle::new();
    shutdown.install_signal_handler()?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
    let mut supervisor =
        Supervisor::new(config, runner, shutdown.subscribe()).with_activity_clock(activity);
    supervisor.run().await;

    Ok(ExitCode::SUCCESS)
}
