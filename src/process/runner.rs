//! `tokio::process` backed command runner.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CommandRunner, ProcessError, ProcessInvocation, ProcessResult};

const CHUNK_SIZE: usize = 8 * 1024;

/// How long output is still read after the child has exited.
///
/// A background process started by the child can hold the pipes open
/// forever; once this expires the pipes are dropped.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Runs external processes one at a time.
///
/// Every invocation holds the runner's gate from spawn until exit, so two
/// invocations issued through the same runner never overlap.
#[derive(Debug, Default)]
pub struct ProcessRunner {
    gate: Mutex<()>,
}

impl ProcessRunner {
    /// Creates a runner.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: ProcessInvocation) -> ProcessResult<String> {
        let _guard = self.gate.lock().await;

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        debug!(pid = ?child.id(), "Spawned {}", invocation);

        let echo = invocation.echo_output;
        let stderr_label = format!("{} STDERR", invocation.label);
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let stream_error = |source| ProcessError::Stream {
            program: invocation.program.clone(),
            source,
        };

        // The call ends when the child exits, not when its pipes close.
        let (status, streamed) = {
            let readers = async {
                let (out, err) = tokio::join!(
                    collect(stdout_pipe, &mut stdout, &invocation.label, echo),
                    collect(stderr_pipe, &mut stderr, &stderr_label, echo),
                );
                out.and(err)
            };
            tokio::pin!(readers);

            let mut streamed = None;
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    result = &mut readers, if streamed.is_none() => streamed = Some(result),
                }
            };

            let streamed = match streamed {
                Some(result) => result,
                None => match tokio::time::timeout(OUTPUT_GRACE, &mut readers).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            "{} exited but its output is still open, detaching",
                            invocation.program
                        );
                        Ok(())
                    }
                },
            };
            (status, streamed)
        };

        let status = status.map_err(stream_error)?;
        streamed.map_err(stream_error)?;

        debug!(status = %status, "{} exited", invocation.program);

        if status.success() {
            Ok(String::from_utf8_lossy(&stdout).into_owned())
        } else {
            Err(ProcessError::Exit {
                program: invocation.program,
                code: status.code(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
    }
}

/// Reads a child stream to EOF into `collected`, echoing each chunk to the
/// log if asked. Bytes read so far stay in `collected` if the read is dropped.
async fn collect<R>(
    stream: Option<R>,
    collected: &mut Vec<u8>,
    label: &str,
    echo: bool,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return Ok(());
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);

        if echo {
            let chunk = String::from_utf8_lossy(&buf[..n]);
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                info!("{}: {}", label, chunk);
            }
        }
    }

    Ok(())
}
