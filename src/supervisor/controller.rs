//! Supervisor control loop.
//!
//! seed -> [persist previous -> prompt -> inspect output -> schedule]* -> stop
//!
//! Exactly one external operation is in flight at a time: every step is
//! awaited before the next one starts. The shutdown flag is consulted before
//! each scheduled step (including the prompt that follows persistence) and
//! during delays, never while an invocation runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{
    contains_sentinel, OnSupervisorEvent, Phase, RunSummary, StopReason, SupervisorEvent,
    SupervisorState,
};
use crate::config::{MissingSentinelPolicy, PersistenceMode, SupervisorConfig};
use crate::logging::ActivityClock;
use crate::persistence::{commit_message, git_steps, PersistencePipeline, PersistenceResult};
use crate::process::{CommandRunner, ProcessInvocation, ProcessResult};

/// Characters of a prompt shown in the log.
const PROMPT_PREVIEW_CHARS: usize = 50;

/// What a single iteration led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterationOutcome {
    SentinelDetected,
    SentinelMissing,
    Failed,
    /// Shutdown arrived before the prompt was sent.
    Interrupted,
}

/// Drives the agent through iterations until shutdown.
pub struct Supervisor {
    config: SupervisorConfig,
    runner: Arc<dyn CommandRunner>,
    pipeline: PersistencePipeline,
    state: SupervisorState,
    shutdown: watch::Receiver<bool>,
    on_event: Option<OnSupervisorEvent>,
}

impl Supervisor {
    /// Creates a supervisor.
    ///
    /// `runner` launches both the agent and the persistence steps; `shutdown`
    /// flips to `true` when the process should stop.
    pub fn new(
        config: SupervisorConfig,
        runner: Arc<dyn CommandRunner>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let pipeline = PersistencePipeline::new(Arc::clone(&runner));
        Self {
            config,
            runner,
            pipeline,
            state: SupervisorState::new(),
            shutdown,
            on_event: None,
        }
    }

    /// Sets the callback for supervisor events.
    pub fn on_event(mut self, callback: OnSupervisorEvent) -> Self {
        self.on_event = Some(callback);
        self
    }

    /// Shares `clock` as the state's last-activity time.
    pub fn with_activity_clock(mut self, clock: ActivityClock) -> Self {
        self.state = SupervisorState::with_activity(clock);
        self
    }

    /// Current state.
    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// Configuration in use.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Runs until shutdown or the iteration limit.
    pub async fn run(&mut self) -> RunSummary {
        info!("Ralph Loop Supervisor starting...");

        let reason = if self.shutdown_requested() {
            StopReason::Shutdown
        } else {
            self.seed().await;
            self.drive().await
        };

        self.state.transition(Phase::Shutdown);
        let summary = RunSummary {
            iterations: self.state.iteration(),
            reason,
        };
        info!(
            "Supervisor stopped after {} iteration(s): {}",
            summary.iterations, summary.reason
        );
        self.emit(SupervisorEvent::Stopped(summary));
        summary
    }

    async fn drive(&mut self) -> StopReason {
        if !self.wait(self.config.seed_delay()).await {
            return StopReason::Shutdown;
        }

        loop {
            let limit = self.config.max_iterations;
            if limit > 0 && self.state.iteration() >= limit {
                info!("Reached iteration limit ({})", limit);
                return StopReason::IterationLimit;
            }

            let delay = match self.run_iteration().await {
                IterationOutcome::Interrupted => return StopReason::Shutdown,
                IterationOutcome::SentinelDetected => self.config.next_iteration_delay(),
                IterationOutcome::Failed => self.config.restart_delay(),
                IterationOutcome::SentinelMissing => match self.config.on_missing_sentinel {
                    MissingSentinelPolicy::Retry => self.config.restart_delay(),
                    MissingSentinelPolicy::Pause => {
                        self.wait_for_shutdown().await;
                        return StopReason::Shutdown;
                    }
                },
            };

            if !self.wait(delay).await {
                return StopReason::Shutdown;
            }
            self.state.transition(Phase::Idle);
        }
    }

    /// Sends the priming prompt. Failure is logged and otherwise ignored.
    async fn seed(&mut self) {
        self.state.transition(Phase::Seeding);
        info!("Seeding agent session with initial prompt");

        let result = self.execute_prompt(&self.config.seed_prompt).await;
        self.state.touch();

        match result {
            Ok(_) => {
                info!("Session seeded successfully, starting iterations...");
                self.emit(SupervisorEvent::Seeded);
            }
            Err(e) => {
                error!("Failed to seed session: {}", e);
                info!("Continuing with iterations anyway...");
                self.emit(SupervisorEvent::SeedFailed {
                    error: e.to_string(),
                });
            }
        }

        self.state.transition(Phase::Idle);
    }

    async fn run_iteration(&mut self) -> IterationOutcome {
        let iteration = self.state.begin_iteration();
        self.state.transition(Phase::RunningIteration);
        info!("Starting iteration {}", iteration);
        self.emit(SupervisorEvent::IterationStarted { iteration });

        let persisted = self.persist().await;
        self.state.touch();
        match persisted {
            Ok(()) => self.emit(SupervisorEvent::PersistenceCompleted { iteration }),
            Err(e) => {
                error!("Auto-commit failed: {}", e);
                self.emit(SupervisorEvent::PersistenceFailed {
                    iteration,
                    error: e.to_string(),
                });

                if self.config.persistence == PersistenceMode::Strict {
                    warn!(
                        "Skipping prompt for iteration {}, retrying in {:?}",
                        iteration,
                        self.config.restart_delay()
                    );
                    return self.fail(iteration, e.to_string());
                }
            }
        }

        if self.shutdown_requested() {
            info!("Not sending prompt for iteration {}", iteration);
            return IterationOutcome::Interrupted;
        }

        let result = self.execute_prompt(&self.config.iteration_prompt).await;
        self.state.touch();

        match result {
            Ok(output) if contains_sentinel(&output, &self.config.sentinel) => {
                info!(
                    "Detected {} sentinel - starting next iteration",
                    self.config.sentinel
                );
                self.state.transition(Phase::DetectedSignal);
                self.emit(SupervisorEvent::SentinelDetected { iteration });
                IterationOutcome::SentinelDetected
            }
            Ok(_) => {
                match self.config.on_missing_sentinel {
                    MissingSentinelPolicy::Pause => info!(
                        "Iteration completed but {} not found - waiting for manual trigger",
                        self.config.sentinel
                    ),
                    MissingSentinelPolicy::Retry => warn!(
                        "Iteration completed but {} not found - retrying in {:?}",
                        self.config.sentinel,
                        self.config.restart_delay()
                    ),
                }
                self.state.transition(Phase::AwaitingTrigger);
                self.emit(SupervisorEvent::SentinelMissing { iteration });
                IterationOutcome::SentinelMissing
            }
            Err(e) => {
                error!("Iteration prompt execution failed: {}", e);
                self.fail(iteration, e.to_string())
            }
        }
    }

    fn fail(&mut self, iteration: u64, error: String) -> IterationOutcome {
        self.state.transition(Phase::Failed);
        self.emit(SupervisorEvent::IterationFailed { iteration, error });
        IterationOutcome::Failed
    }

    /// Commits and pushes whatever the previous iteration left behind.
    async fn persist(&self) -> PersistenceResult<()> {
        info!("Auto-committing changes");
        let message = commit_message(&self.config.commit_prefix, Utc::now());
        let steps = git_steps(&message, &self.config.remote, &self.config.branch);
        self.pipeline.run(&steps).await?;
        info!("Auto-commit completed successfully");
        Ok(())
    }

    async fn execute_prompt(&self, prompt: &str) -> ProcessResult<String> {
        let preview: String = prompt.chars().take(PROMPT_PREVIEW_CHARS).collect();
        info!("Executing prompt: {}...", preview.trim_end());

        let result = self.runner.run(self.agent_invocation(prompt)).await;
        if result.is_ok() {
            info!("Prompt execution completed successfully");
        }
        result
    }

    /// `<agent> [agent_args..] -p <prompt> --allow-all-tools`
    fn agent_invocation(&self, prompt: &str) -> ProcessInvocation {
        ProcessInvocation::new(&self.config.agent_command)
            .args(self.config.agent_args.iter().cloned())
            .args(["-p", prompt, "--allow-all-tools"])
    }

    /// Checks the shutdown flag, recording it in the state the first time.
    fn shutdown_requested(&mut self) -> bool {
        let requested = *self.shutdown.borrow();
        if requested && self.state.request_shutdown() {
            info!("Shutdown requested, not scheduling further work");
        }
        requested
    }

    /// Sleeps for `delay` unless shutdown arrives first.
    ///
    /// Returns `false` when the caller should stop.
    async fn wait(&mut self, delay: Duration) -> bool {
        if self.shutdown_requested() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(&mut self.shutdown) => {}
        }

        !self.shutdown_requested()
    }

    async fn wait_for_shutdown(&mut self) {
        cancelled(&mut self.shutdown).await;
        self.shutdown_requested();
    }

    fn emit(&mut self, event: SupervisorEvent) {
        if let Some(ref mut callback) = self.on_event {
            callback(event);
        }
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}
