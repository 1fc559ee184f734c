//! Iteration supervisor.
//!
//! The [`Supervisor`] seeds the agent session once, then loops: persist the
//! previous iteration, run the iteration prompt, look for the completion
//! sentinel in the output, and schedule what comes next. This module holds
//! the state it mutates and the events it reports.

pub mod controller;

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::logging::ActivityClock;

pub use controller::Supervisor;

/// Where the controller is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Sending the priming prompt.
    Seeding,
    /// Between iterations, possibly waiting out a delay.
    #[default]
    Idle,
    /// Persisting the previous iteration and running the prompt.
    RunningIteration,
    /// The sentinel was found; the next iteration is scheduled.
    DetectedSignal,
    /// The iteration finished without the sentinel; nothing is scheduled.
    AwaitingTrigger,
    /// The invocation failed; a retry is scheduled.
    Failed,
    /// Terminal.
    Shutdown,
}

/// Mutable state owned by the controller.
#[derive(Debug, Clone)]
pub struct SupervisorState {
    iteration: u64,
    shutdown: bool,
    activity: ActivityClock,
    phase: Phase,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorState {
    /// Fresh state: no iterations, running, idle.
    pub fn new() -> Self {
        Self::with_activity(ActivityClock::new())
    }

    /// Fresh state whose last-activity time is `clock`.
    ///
    /// Pass the clock installed in the logging subscriber so that every log
    /// entry counts as activity.
    pub fn with_activity(clock: ActivityClock) -> Self {
        clock.touch();
        Self {
            iteration: 0,
            shutdown: false,
            activity: clock,
            phase: Phase::Idle,
        }
    }

    /// Number of iteration starts so far.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Whether shutdown has been observed.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Time of the last log entry or recorded step.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.activity.last()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Counts a new iteration start and returns its number.
    pub fn begin_iteration(&mut self) -> u64 {
        self.iteration += 1;
        self.touch();
        self.iteration
    }

    /// Records activity now.
    pub fn touch(&mut self) {
        self.activity.touch();
    }

    /// Marks shutdown. Returns `true` only the first time.
    pub fn request_shutdown(&mut self) -> bool {
        if self.shutdown {
            return false;
        }
        self.shutdown = true;
        true
    }

    /// Moves to `phase`. Nothing leaves [`Phase::Shutdown`].
    pub fn transition(&mut self, phase: Phase) {
        if self.phase == Phase::Shutdown || self.phase == phase {
            return;
        }
        debug!("Phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }
}

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A termination request was observed.
    Shutdown,
    /// The configured iteration limit was reached.
    IterationLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Shutdown => write!(f, "shutdown requested"),
            StopReason::IterationLimit => write!(f, "iteration limit reached"),
        }
    }
}

/// Outcome of a supervisor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Iteration starts, retries included.
    pub iterations: u64,
    pub reason: StopReason,
}

/// Progress notifications emitted by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The priming prompt succeeded.
    Seeded,
    /// The priming prompt failed; iterations start anyway.
    SeedFailed { error: String },
    /// An iteration started.
    IterationStarted { iteration: u64 },
    /// The previous iteration's work was committed and pushed.
    PersistenceCompleted { iteration: u64 },
    /// The persistence pipeline failed.
    PersistenceFailed { iteration: u64, error: String },
    /// The iteration output contained the sentinel.
    SentinelDetected { iteration: u64 },
    /// The iteration succeeded without the sentinel.
    SentinelMissing { iteration: u64 },
    /// The iteration could not complete; a retry is scheduled.
    IterationFailed { iteration: u64, error: String },
    /// The run ended.
    Stopped(RunSummary),
}

/// Callback type for supervisor events.
pub type OnSupervisorEvent = Box<dyn FnMut(SupervisorEvent) + Send>;

/// Whether `output` contains `sentinel`.
///
/// Plain case-sensitive substring match anywhere in the output.
pub fn contains_sentinel(output: &str, sentinel: &str) -> bool {
    output.contains(sentinel)
}
