use std::{
    io::{self, Read},
    process::{Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

#[derive(Debug, Clone)]
/// stdout/stderr and exit status of a finished child process
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<io::Result<String>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = String::new();
            pipe.read_to_string(&mut buffer).map(|_| buffer)
        })
    })
}

fn collect(handle: Option<JoinHandle<io::Result<String>>>) -> String {
    match handle.map(JoinHandle::join) {
        Some(Ok(Ok(buffer))) => buffer,
        Some(Ok(Err(error))) => {
            warn!(error = ?error, "Failed to read child output");
            String::new()
        }
        Some(Err(_)) => {
            warn!("Output reader thread panicked");
            String::new()
        }
        None => String::new(),
    }
}

/// Run `command` to completion with captured output, killing it after `timeout`.
///
/// Both pipes are drained while waiting, so children printing large listings
/// do not block on a full pipe.
pub fn run_captured(command: &mut Command, timeout: Duration) -> Result<CapturedOutput, ProcessError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let start = Instant::now();

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

    debug!(program = %program, pid = child.id(), "Spawned child process");

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!(program = %program, "Child ran into timeout, killing it");
            if let Err(error) = child.kill() {
                warn!(error = ?error, "Failed to kill child");
            }
            let _ = child.wait();

            return Err(ProcessError::Timeout { program, timeout });
        }
        Err(source) => return Err(ProcessError::Wait { program, source }),
    };

    let output = CapturedOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
        runtime: start.elapsed(),
    };

    debug!(
        program = %program,
        status = ?output.status,
        runtime_ms = output.runtime.as_millis() as u64,
        "Child finished"
    );

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_stderr() {
        let output = run_captured(
            Command::new("sh").args(["-c", "echo out; echo err >&2"]),
            Duration::from_secs(10),
        )
        .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[test]
    fn reports_failing_status() {
        let output =
            run_captured(Command::new("sh").args(["-c", "exit 3"]), Duration::from_secs(10))
                .unwrap();

        assert!(!output.success());
        assert_eq!(output.status.code(), Some(3));
    }

    #[test]
    fn large_output_does_not_stall() {
        let output = run_captured(
            Command::new("sh").args(["-c", "yes lfn | head -n 100000"]),
            Duration::from_secs(30),
        )
        .unwrap();

        assert_eq!(output.stdout.lines().count(), 100_000);
    }

    #[test]
    fn kills_on_timeout() {
        let error = run_captured(
            Command::new("sh").args(["-c", "sleep 5"]),
            Duration::from_millis(100),
        )
        .unwrap_err();

        assert!(matches!(error, ProcessError::Timeout { .. }));
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let error = run_captured(
            &mut Command::new("/nonexistent/gridin-test-binary"),
            Duration::from_secs(1),
        )
        .unwrap_err();

        assert!(matches!(error, ProcessError::Spawn { .. }));
    }
}
