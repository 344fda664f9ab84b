//! Subprocess execution
//!
//! Blocking spawn-and-wait used for both the long-running OpenVPN process
//! and the short-lived route commands replayed on pause/resume. Output is
//! forwarded line by line to the log.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use tracing::{debug, info};

/// Runs a program to completion
pub trait CommandRunner: Send + Sync {
    /// Execute `program` with `args`, blocking until it exits.
    ///
    /// A non-zero exit status is an error.
    fn exec(&self, program: &str, args: &[String]) -> Result<(), ExecError>;
}

/// Runner backed by `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a new runner
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn exec(&self, program: &str, args: &[String]) -> Result<(), ExecError> {
        info!("Executing: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Drain stderr concurrently; neither pipe may fill up
        let stderr_text = thread::scope(|scope| {
            let stderr_reader = scope.spawn(move || {
                let mut text = String::new();
                if let Some(mut err) = stderr {
                    let _ = err.read_to_string(&mut text);
                }
                text
            });

            if let Some(out) = stdout {
                forward_lines(program, out);
            }

            stderr_reader.join().unwrap_or_default()
        });

        for line in stderr_text.lines() {
            debug!("[{}] (stderr) {}", program, line);
        }

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Failed {
                program: program.to_string(),
                status,
                stderr: stderr_text.trim().to_string(),
            })
        }
    }
}

/// Log `out` line by line until EOF.
///
/// Lines are decoded lossily; the pipe stays open until the child closes it.
fn forward_lines(program: &str, out: impl Read) {
    let mut reader = BufReader::new(out);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                debug!("[{}] {}", program, line.trim_end_matches(['\r', '\n']));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("[{}] output stream closed: {}", program, e);
                break;
            }
        }
    }
}

/// Subprocess execution errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
