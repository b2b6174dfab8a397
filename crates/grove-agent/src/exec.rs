//! Command execution for grove-agent.

use crate::protocol::{ExecParams, ExecResult};
use crate::usage::{self, CpuTimes};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Maximum output size in bytes (1 MB).
/// Prevents memory exhaustion from commands with huge output.
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Used when the host sends no timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Truncate a string to max bytes, preserving UTF-8 boundaries.
fn truncate_output(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_string();
    truncated.push_str("\n... [output truncated]");
    truncated
}

/// Run one command to completion or until its timeout.
///
/// A command that times out is killed and reported with `timed_out: true`;
/// its partial output is discarded.
pub async fn run(params: ExecParams) -> ExecResult {
    let Some((program, args)) = params.command.split_first() else {
        return ExecResult::failed("empty command");
    };
    let timeout = match params.timeout_ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => DEFAULT_TIMEOUT,
    };
    debug!(program = %program, argc = args.len(), timeout_ms = timeout.as_millis() as u64, "executing command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(&params.env)
        .stdin(if params.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &params.workdir {
        cmd.current_dir(dir);
    }

    let cpu_before = CpuTimes::sample();
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %program, error = %e, "failed to spawn command");
            return ExecResult::failed(format!("failed to spawn {program}: {e}"));
        }
    };

    if let (Some(input), Some(mut pipe)) = (params.stdin, child.stdin.take()) {
        // written concurrently so a child that fills its stdout cannot deadlock us
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                debug!(error = %e, "child closed stdin early");
            }
        });
    }

    let outcome = tokio::time::timeout(timeout, child.wait_with_output()).await;
    let duration_ms = started.elapsed().as_millis() as u64;
    let cpu_percent = match (cpu_before, CpuTimes::sample()) {
        (Some(before), Some(after)) => after.percent_since(&before),
        _ => 0.0,
    };
    let memory_used_mb = usage::memory_used_mb();

    let result = match outcome {
        Ok(Ok(out)) => ExecResult {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: truncate_output(String::from_utf8_lossy(&out.stdout).into_owned(), MAX_OUTPUT_SIZE),
            stderr: truncate_output(String::from_utf8_lossy(&out.stderr).into_owned(), MAX_OUTPUT_SIZE),
            duration_ms,
            memory_used_mb,
            cpu_percent,
            timed_out: false,
        },
        Ok(Err(e)) => {
            warn!(program = %program, error = %e, "failed to collect command output");
            ExecResult {
                duration_ms,
                ..ExecResult::failed(format!("failed to wait for {program}: {e}"))
            }
        }
        // the child was dropped with the future and killed
        Err(_) => {
            warn!(program = %program, timeout_ms = timeout.as_millis() as u64, "command timed out, killed");
            ExecResult {
                duration_ms,
                memory_used_mb,
                cpu_percent,
                timed_out: true,
                ..ExecResult::failed(format!("command timed out after {timeout:?}"))
            }
        }
    };

    debug!(
        exit_code = result.exit_code,
        stdout_len = result.stdout.len(),
        stderr_len = result.stderr.len(),
        duration_ms,
        "command completed"
    );
    trace!(stdout = %result.stdout, stderr = %result.stderr, "command output");
    result
}
