//! Captured subprocess execution bounded by the run deadline.
use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Point in time after which no new work starts and running work is killed.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} killed at run deadline")]
    DeadlineExpired { program: String },
}

/// Run `command` to completion, feeding `input` on stdin and capturing both
/// output streams. The child is killed once `deadline` passes.
pub fn run_captured(
    mut command: Command,
    input: Option<&[u8]>,
    deadline: &Deadline,
) -> Result<ProcessOutput, ProcessError> {
    let program = command.get_program().to_string_lossy().into_owned();
    if deadline.expired() {
        return Err(ProcessError::DeadlineExpired { program });
    }

    command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let writer = match (input, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => {
            let bytes = bytes.to_vec();
            let (sender, receiver) = mpsc::channel();
            thread::spawn(move || {
                let _ = sender.send(pipe.write_all(&bytes));
            });
            Some(receiver)
        }
        _ => None,
    };
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        let polled = child.try_wait().map_err(|source| ProcessError::Io {
            program: program.clone(),
            source,
        })?;
        if let Some(status) = polled {
            break status;
        }
        if deadline.expired() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::warn!(
                program = %program,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "subprocess killed at deadline"
            );
            // Readers are left to finish on their own; a grandchild may
            // still hold the pipes open.
            return Err(ProcessError::DeadlineExpired { program });
        }
        thread::sleep(POLL_INTERVAL);
    };

    // A grandchild can inherit the pipes and outlive the child, so the
    // stream threads are bounded by the deadline too.
    if let Some(writer) = writer {
        match writer.recv_timeout(deadline.remaining()) {
            Ok(Ok(())) => {}
            // The child may exit without reading all of its input.
            Ok(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {}
            Ok(Err(source)) => return Err(ProcessError::Io { program, source }),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ProcessError::Io {
                    program,
                    source: io::Error::other("stdin writer panicked"),
                })
            }
            Err(RecvTimeoutError::Timeout) => return Err(stream_deadline(program, start)),
        }
    }
    let Some(stdout) = collect(stdout, deadline) else {
        return Err(stream_deadline(program, start));
    };
    let Some(stderr) = collect(stderr, deadline) else {
        return Err(stream_deadline(program, start));
    };

    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn stream_deadline(program: String, start: Instant) -> ProcessError {
    tracing::warn!(
        program = %program,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "output streams still open at deadline"
    );
    ProcessError::DeadlineExpired { program }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<Vec<u8>>> {
    pipe.map(|mut pipe| {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            let _ = sender.send(bytes);
        });
        receiver
    })
}

/// Bytes read from a stream, or `None` when it is still open at the deadline.
fn collect(receiver: Option<Receiver<Vec<u8>>>, deadline: &Deadline) -> Option<Vec<u8>> {
    let Some(receiver) = receiver else {
        return Some(Vec::new());
    };
    match receiver.recv_timeout(deadline.remaining()) {
        Ok(bytes) => Some(bytes),
        Err(RecvTimeoutError::Disconnected) => Some(Vec::new()),
        Err(RecvTimeoutError::Timeout) => None,
    }
}
