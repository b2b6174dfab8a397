//! Ways of running a command inside a microVM.
//!
//! [`AgentExecutor`] is the real path: JSON-RPC to grove-agent over vsock.
//! [`SimulatedExecutor`] is a placeholder that fabricates plausible output
//! and timing without touching the guest. Its results carry
//! `simulated: true` and must never be treated as performance data.

use crate::client::AgentClient;
use crate::config::ExecutionStrategy;
use crate::error::{CoreError, Result};
use crate::sandbox::{ExecutionRequest, ExecutionResult, ResourceUsage};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;

/// Runs commands for one sandbox.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> ExecutionStrategy;

    /// Run `request`, giving up after `timeout`.
    async fn execute(&self, request: &ExecutionRequest, timeout: Duration) -> Result<ExecutionResult>;

    /// Drop any connection to the guest and establish a fresh one.
    ///
    /// Called after a snapshot restore replaced the guest.
    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Executes commands through grove-agent.
pub struct AgentExecutor {
    sandbox_id: String,
    vsock_path: PathBuf,
    client: Mutex<Option<AgentClient>>,
}

impl AgentExecutor {
    /// Connect to the agent behind `vsock_path` and verify it responds.
    pub async fn connect(sandbox_id: impl Into<String>, vsock_path: impl Into<PathBuf>) -> Result<Self> {
        let executor = Self {
            sandbox_id: sandbox_id.into(),
            vsock_path: vsock_path.into(),
            client: Mutex::new(None),
        };
        executor.reconnect().await?;
        Ok(executor)
    }
}

#[async_trait]
impl CommandExecutor for AgentExecutor {
    fn kind(&self) -> ExecutionStrategy {
        ExecutionStrategy::Agent
    }

    async fn execute(&self, request: &ExecutionRequest, timeout: Duration) -> Result<ExecutionResult> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(AgentClient::connect(&self.vsock_path).await?);
        }
        let Some(client) = guard.as_mut() else {
            return Err(CoreError::Connection("agent client unavailable".into()));
        };

        let started = std::time::Instant::now();
        let response = match client.exec(request, timeout).await {
            Ok(r) => r,
            Err(e) => {
                // The stream may hold a half-read reply; start clean next time.
                *guard = None;
                return Err(match e {
                    CoreError::AgentTimeout(_) => CoreError::ExecutionTimeout {
                        sandbox_id: self.sandbox_id.clone(),
                        timeout,
                    },
                    other => other,
                });
            }
        };

        if response.timed_out {
            return Err(CoreError::ExecutionTimeout {
                sandbox_id: self.sandbox_id.clone(),
                timeout,
            });
        }

        Ok(ExecutionResult {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            duration: started.elapsed(),
            resource_usage: ResourceUsage {
                memory_mb: response.memory_used_mb,
                cpu_percent: response.cpu_percent,
            },
            simulated: false,
        })
    }

    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.client.lock().await;
        *guard = None;
        let mut client = AgentClient::connect(&self.vsock_path).await?;
        client.ping().await?;
        tracing::debug!(sandbox_id = %self.sandbox_id, "Agent connection established");
        *guard = Some(client);
        Ok(())
    }
}

/// Placeholder executor that never reaches the guest.
///
/// Recognises a handful of common programs and answers with canned output
/// and a nominal duration. Nothing here runs real code.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    sandbox_id: String,
}

impl SimulatedExecutor {
    /// Simulated executor for one sandbox.
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
        }
    }

    fn respond(&self, request: &ExecutionRequest) -> (i32, String, String, Duration) {
        let argv = effective_argv(request);
        let program = argv
            .first()
            .map(|p| p.rsplit('/').next().unwrap_or(p.as_str()))
            .unwrap_or_default();
        let args = argv.get(1..).unwrap_or_default();
        let ms = Duration::from_millis;

        match program {
            "" => (127, String::new(), "empty command\n".into(), ms(0)),
            "true" | ":" => (0, String::new(), String::new(), ms(1)),
            "false" => (1, String::new(), String::new(), ms(1)),
            "echo" => (0, format!("{}\n", args.join(" ")), String::new(), ms(2)),
            "cat" if args.is_empty() => (
                0,
                request.stdin.clone().unwrap_or_default(),
                String::new(),
                ms(2),
            ),
            "pwd" => (
                0,
                format!("{}\n", request.workdir.as_deref().unwrap_or("/")),
                String::new(),
                ms(1),
            ),
            "ls" => (0, "bin\netc\nhome\ntmp\nusr\nvar\n".into(), String::new(), ms(5)),
            "sleep" => {
                let secs = args.first().and_then(|a| a.parse::<f64>().ok()).unwrap_or(0.0);
                let nominal = Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX);
                (0, String::new(), String::new(), nominal)
            }
            "python" | "python3" if args.first().map(String::as_str) == Some("--version") => {
                (0, "Python 3.11.4\n".into(), String::new(), ms(20))
            }
            "python" | "python3" => (0, String::new(), String::new(), ms(150)),
            "node" => (0, String::new(), String::new(), ms(120)),
            "pip" | "pip3" | "npm" | "cargo" => (0, String::new(), String::new(), ms(800)),
            "git" => (0, String::new(), String::new(), ms(30)),
            _ => (0, String::new(), String::new(), ms(10)),
        }
    }
}

#[async_trait]
impl CommandExecutor for SimulatedExecutor {
    fn kind(&self) -> ExecutionStrategy {
        ExecutionStrategy::Simulated
    }

    async fn execute(&self, request: &ExecutionRequest, timeout: Duration) -> Result<ExecutionResult> {
        let (exit_code, stdout, stderr, duration) = self.respond(request);
        if duration > timeout {
            return Err(CoreError::ExecutionTimeout {
                sandbox_id: self.sandbox_id.clone(),
                timeout,
            });
        }
        tracing::trace!(
            sandbox_id = %self.sandbox_id,
            program = request.program().unwrap_or_default(),
            "Simulated command"
        );
        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            duration,
            resource_usage: ResourceUsage::default(),
            simulated: true,
        })
    }
}

/// Unwrap `sh -c "<script>"` into the script's words.
fn effective_argv(request: &ExecutionRequest) -> Vec<String> {
    let command = &request.command;
    let is_shell = command
        .first()
        .map(|p| matches!(p.rsplit('/').next(), Some("sh" | "bash")))
        .unwrap_or(false);
    if is_shell && command.get(1).map(String::as_str) == Some("-c") {
        if let Some(script) = command.get(2) {
            return script.split_whitespace().map(str::to_string).collect();
        }
    }
    command.clone()
}
