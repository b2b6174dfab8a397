//! JSON-RPC 2.0 protocol types for grove-agent.
//!
//! One request or response per line. The host side lives in
//! `grove_core::AgentClient`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// JSON-RPC 2.0 standard error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Protocol version, must be "2.0".
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Parameters of the `exec` method.
#[derive(Debug, Deserialize)]
pub struct ExecParams {
    /// Program and arguments. Not run through a shell.
    pub command: Vec<String>,
    /// Working directory.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Data written to the child's stdin, which is then closed.
    #[serde(default)]
    pub stdin: Option<String>,
    /// Kill the child after this many milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Result of the `exec` method.
#[derive(Debug, Serialize)]
pub struct ExecResult {
    /// Exit code, -1 if the process couldn't be started or was killed.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Guest memory in use after the command, MiB.
    pub memory_used_mb: f64,
    /// Guest CPU utilization while the command ran, percent.
    pub cpu_percent: f64,
    pub timed_out: bool,
}

impl ExecResult {
    /// Result for a command that never ran.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message.into(),
            duration_ms: 0,
            memory_used_mb: 0.0,
            cpu_percent: 0.0,
            timed_out: false,
        }
    }
}
