//! Ingressify ops: external hook commands run around a render.

#![forbid(unsafe_code)]

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::process::Command;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook command is empty")]
    Empty,
    #[error("spawning {program}: {source}")]
    Spawn { program: String, source: std::io::Error },
    #[error("{program} exited with {status}: {stderr}")]
    Exit { program: String, status: ExitStatus, stderr: String },
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// Runs one hook command: the first element is the program, the rest its arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookRunner {
    timeout: Option<Duration>,
}

impl HookRunner {
    pub fn new() -> Self { Self::default() }

    /// `None` lets a hook run for as long as it takes.
    pub fn with_timeout(timeout: Option<Duration>) -> Self { Self { timeout } }

    /// Run `cmd` to completion and return its stdout verbatim.
    pub async fn run(&self, cmd: &[String]) -> Result<String, HookError> {
        let (program, args) = cmd.split_first().ok_or(HookError::Empty)?;
        let started = Instant::now();
        counter!("hook_runs", 1u64);
        info!(hook = %program, args = args.len(), "executing hook");

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        let output = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, command.output()).await {
                Ok(res) => res,
                Err(_) => {
                    counter!("hook_failures", 1u64);
                    error!(hook = %program, ?timeout, "hook timed out");
                    return Err(HookError::Timeout { program: program.clone(), timeout });
                }
            },
            None => command.output().await,
        };
        let output = output.map_err(|source| {
            counter!("hook_failures", 1u64);
            error!(hook = %program, error = %source, "failed to spawn hook");
            HookError::Spawn { program: program.clone(), source }
        })?;
        histogram!("hook_ms", started.elapsed().as_secs_f64() * 1000.0);

        if !output.status.success() {
            counter!("hook_failures", 1u64);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(hook = %program, status = %output.status, stderr = %stderr, "hook failed");
            return Err(HookError::Exit { program: program.clone(), status: output.status, stderr });
        }
        info!(hook = %program, "hook execution successful");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
