//! Scripted command runner shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ralph_supervisor::config::SupervisorConfig;
use ralph_supervisor::process::{CommandRunner, ProcessError, ProcessInvocation, ProcessResult};
use ralph_supervisor::supervisor::{OnSupervisorEvent, SupervisorEvent};
use tokio::sync::watch;

pub const SEED_PROMPT: &str = "SEED";
pub const ITERATION_PROMPT: &str = "ITERATE";

/// How the fake agent answers one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(&'static str),
    Exit(i32),
    SpawnFailure,
}

/// What the runner was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Seed,
    Prompt,
    Git(String),
}

/// Command runner that plays back scripted agent replies and git results.
pub struct FakeRunner {
    seed_reply: Mutex<Reply>,
    prompt_replies: Mutex<VecDeque<Reply>>,
    /// Git subcommand (`add`, `commit`, `push`) that exits non-zero.
    failing_git: Mutex<Option<&'static str>>,
    delay: Duration,
    /// Requests shutdown while the matching call is running.
    shutdown_during: Mutex<Option<(Call, watch::Sender<bool>)>>,
    calls: Mutex<Vec<Call>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRunner {
    pub fn new(prompt_replies: Vec<Reply>) -> Self {
        Self {
            seed_reply: Mutex::new(Reply::Output("ready")),
            prompt_replies: Mutex::new(prompt_replies.into()),
            failing_git: Mutex::new(None),
            delay: Duration::from_millis(2),
            shutdown_during: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_seed_reply(self, reply: Reply) -> Self {
        *self.seed_reply.lock().unwrap() = reply;
        self
    }

    pub fn with_failing_git(self, subcommand: &'static str) -> Self {
        *self.failing_git.lock().unwrap() = Some(subcommand);
        self
    }

    pub fn with_shutdown_during(self, call: Call, shutdown: watch::Sender<bool>) -> Self {
        *self.shutdown_during.lock().unwrap() = Some((call, shutdown));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn prompt_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Prompt))
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn classify(invocation: &ProcessInvocation) -> Call {
        if invocation.program == "git" {
            return Call::Git(invocation.args.first().cloned().unwrap_or_default());
        }
        if invocation.args.iter().any(|a| a == SEED_PROMPT) {
            Call::Seed
        } else {
            Call::Prompt
        }
    }

    fn reply_for(&self, call: &Call) -> Reply {
        match call {
            Call::Seed => self.seed_reply.lock().unwrap().clone(),
            Call::Prompt => self
                .prompt_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Output("done. RALPH_NEXT")),
            Call::Git(subcommand) => {
                if *self.failing_git.lock().unwrap() == Some(subcommand.as_str()) {
                    Reply::Exit(1)
                } else {
                    Reply::Output("")
                }
            }
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: ProcessInvocation) -> ProcessResult<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let call = Self::classify(&invocation);
        self.calls.lock().unwrap().push(call.clone());
        let reply = self.reply_for(&call);

        if let Some((trigger, shutdown)) = self.shutdown_during.lock().unwrap().as_ref() {
            if *trigger == call {
                shutdown.send_replace(true);
            }
        }

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Output(text) => Ok(text.to_string()),
            Reply::Exit(code) => Err(ProcessError::Exit {
                program: invocation.program,
                code: Some(code),
                stderr: "scripted failure".to_string(),
            }),
            Reply::SpawnFailure => Err(ProcessError::Spawn {
                program: invocation.program,
                source: io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"),
            }),
        }
    }
}

/// Config with test prompts and short delays.
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        seed_prompt: SEED_PROMPT.to_string(),
        iteration_prompt: ITERATION_PROMPT.to_string(),
        ..SupervisorConfig::new().with_delays(
            Duration::ZERO,
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
    }
}

/// Event sink that records everything into a shared vector.
pub fn event_recorder() -> (Arc<Mutex<Vec<SupervisorEvent>>>, OnSupervisorEvent) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: OnSupervisorEvent = Box::new(move |event| sink.lock().unwrap().push(event));
    (events, callback)
}
