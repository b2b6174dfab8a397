//! Host side of the guest agent connection.
//!
//! Firecracker exposes guest vsock ports through a Unix socket. A client
//! writes `CONNECT <port>\n`, Firecracker answers `OK <host port>\n`, and
//! from then on the stream carries newline-delimited JSON-RPC 2.0.

use crate::error::CoreError;
use crate::sandbox::ExecutionRequest;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::UnixStream;
use tokio::time::Instant;

/// Guest port that grove-agent listens on.
pub const GUEST_PORT: u32 = 52;

/// How long [`AgentClient::connect`] keeps retrying while the guest boots.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Timeout for `ping`.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra time the host waits beyond a command's own timeout.
const EXEC_GRACE: Duration = Duration::from_secs(2);

type Result<T> = std::result::Result<T, CoreError>;

/// One JSON-RPC session with grove-agent over a vsock UDS.
pub struct AgentClient {
    reader: BufReader<ReadHalf<UnixStream>>,
    writer: BufWriter<WriteHalf<UnixStream>>,
    next_id: u64,
}

impl AgentClient {
    /// Connect to the agent behind `vsock_path`, e.g. `/tmp/grove/vm-1/v.sock`.
    ///
    /// The agent comes up some time after the VM boots, so failed attempts
    /// are retried every 100ms for up to 10s before giving up with
    /// [`CoreError::AgentTimeout`].
    pub async fn connect(vsock_path: &Path) -> Result<Self> {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match Self::open(vsock_path).await {
                Ok(client) => {
                    tracing::debug!(
                        path = %vsock_path.display(),
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Agent connected"
                    );
                    return Ok(client);
                }
                Err(e) => e,
            };
            if started.elapsed() >= CONNECT_DEADLINE {
                tracing::warn!(path = %vsock_path.display(), attempts, error = %err, "Agent never answered");
                return Err(CoreError::AgentTimeout(CONNECT_DEADLINE));
            }
            tracing::trace!(attempt = attempts, error = %err, "Agent not ready");
            tokio::time::sleep(CONNECT_BACKOFF).await;
        }
    }

    async fn open(vsock_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(vsock_path)
            .await
            .map_err(|e| CoreError::Connection(format!("connect {}: {e}", vsock_path.display())))?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            next_id: 1,
        };

        client.send_line(&format!("CONNECT {GUEST_PORT}")).await?;
        let ack = client.read_line().await?;
        if !ack.starts_with("OK ") {
            return Err(CoreError::Connection(format!("vsock handshake refused: {}", ack.trim())));
        }
        Ok(client)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(CoreError::Connection("agent closed the connection".into()));
        }
        Ok(line)
    }

    /// Issue `method` and decode its result into `R`.
    ///
    /// A JSON-RPC error object becomes [`CoreError::Rpc`]. No answer within
    /// `deadline` becomes [`CoreError::AgentTimeout`]; the session should be
    /// dropped afterwards since a late reply would desynchronize it.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
        deadline: Duration,
    ) -> Result<R> {
        let id = self.next_id;
        self.next_id += 1;

        let request = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;
        tracing::trace!(id, method, "RPC request");
        self.send_line(&request).await?;

        let line = match tokio::time::timeout(deadline, self.read_line()).await {
            Ok(line) => line?,
            Err(_) => {
                tracing::warn!(id, method, timeout_ms = deadline.as_millis() as u64, "RPC timed out");
                return Err(CoreError::AgentTimeout(deadline));
            }
        };

        let reply: RpcReply = serde_json::from_str(&line)?;
        match (reply.result, reply.error) {
            (_, Some(error)) => {
                tracing::debug!(id, method, code = error.code, message = %error.message, "RPC error");
                Err(CoreError::Rpc {
                    code: error.code,
                    message: error.message,
                })
            }
            (Some(result), None) => Ok(serde_json::from_value(result)?),
            (None, None) => Err(CoreError::Rpc {
                code: -1,
                message: format!("{method}: reply carries neither result nor error"),
            }),
        }
    }

    /// Round-trip `ping`.
    pub async fn ping(&mut self) -> Result<()> {
        let _: Value = self.call("ping", Value::Null, CONTROL_TIMEOUT).await?;
        Ok(())
    }

    /// Run a command in the guest.
    ///
    /// The guest enforces `timeout` itself; the host waits a little longer
    /// so the guest's `timed_out` verdict normally arrives first.
    pub async fn exec(&mut self, request: &ExecutionRequest, timeout: Duration) -> Result<AgentExecResult> {
        tracing::debug!(
            program = request.program().unwrap_or_default(),
            timeout_ms = timeout.as_millis() as u64,
            "Agent exec"
        );
        let params = ExecParams::new(request, timeout);
        self.call("exec", params, timeout + EXEC_GRACE).await
    }
}

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFailure>,
}

#[derive(Deserialize)]
struct RpcFailure {
    code: i32,
    #[serde(default)]
    message: String,
}

/// Parameters of the agent's `exec` method.
#[derive(Debug, Serialize)]
struct ExecParams<'a> {
    command: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    workdir: Option<&'a str>,
    env: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin: Option<&'a str>,
    timeout_ms: u64,
}

impl<'a> ExecParams<'a> {
    fn new(request: &'a ExecutionRequest, timeout: Duration) -> Self {
        Self {
            command: &request.command,
            workdir: request.workdir.as_deref(),
            env: &request.env,
            stdin: request.stdin.as_deref(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Result of the agent's `exec` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecResult {
    /// Process exit code (-1 if the process couldn't be started or was killed).
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Guest-measured wall-clock duration.
    pub duration_ms: u64,
    /// Guest memory in use after the command, MiB.
    #[serde(default)]
    pub memory_used_mb: f64,
    /// Guest CPU utilization while the command ran, percent.
    #[serde(default)]
    pub cpu_percent: f64,
    /// True if the guest killed the command at its timeout.
    #[serde(default)]
    pub timed_out: bool,
}
