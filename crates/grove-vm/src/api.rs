//! Direct Firecracker API socket client.
//!
//! firepilot's high-level API covers create/start/kill but not vsock,
//! machine sizing, pause/resume or snapshots. Those go straight to the
//! Firecracker API socket through this client.

use crate::config::VsockConfig;
use crate::error::{Result, VmError};
use firepilot_models::models::{MachineConfiguration, Vsock};
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long to wait for a freshly spawned Firecracker to create its API socket.
pub const API_READY_TIMEOUT: Duration = Duration::from_secs(5);

const API_READY_POLL: Duration = Duration::from_millis(10);

/// Client bound to one Firecracker API socket.
#[derive(Debug, Clone)]
pub struct FirecrackerApi {
    socket_path: PathBuf,
}

/// Body of `PUT /snapshot/create`.
#[derive(Debug, Serialize)]
struct SnapshotCreateBody<'a> {
    snapshot_type: &'static str,
    snapshot_path: &'a str,
    mem_file_path: &'a str,
}

/// Body of `PUT /snapshot/load`.
#[derive(Debug, Serialize)]
struct SnapshotLoadBody<'a> {
    snapshot_path: &'a str,
    mem_backend: MemBackend<'a>,
    enable_diff_snapshots: bool,
    resume_vm: bool,
}

#[derive(Debug, Serialize)]
struct MemBackend<'a> {
    backend_type: &'static str,
    backend_path: &'a str,
}

impl FirecrackerApi {
    /// Create a client for the given API socket.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Path of the API socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait until the API socket file exists.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while !self.socket_path.exists() {
            if start.elapsed() >= timeout {
                return Err(VmError::Timeout(timeout));
            }
            tokio::time::sleep(API_READY_POLL).await;
        }
        tracing::trace!(
            socket = %self.socket_path.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "API socket ready"
        );
        Ok(())
    }

    /// Configure vsock. Must be called before the VM starts.
    pub async fn configure_vsock(&self, config: &VsockConfig) -> Result<()> {
        tracing::debug!(
            cid = config.guest_cid,
            uds_path = %config.uds_path.display(),
            socket = %self.socket_path.display(),
            "Configuring vsock"
        );
        let vsock = Vsock::new(
            config.guest_cid as i32,
            config.uds_path.to_string_lossy().to_string(),
        );
        self.send(Method::PUT, "/vsock", &vsock).await
    }

    /// Configure vCPU and memory. Must be called before the VM starts.
    pub async fn configure_machine(&self, vcpu_count: u8, mem_size_mib: u32) -> Result<()> {
        tracing::debug!(vcpu_count, mem_size_mib, "Configuring machine resources");
        let config = MachineConfiguration::new(mem_size_mib as i32, vcpu_count as i32);
        self.send(Method::PUT, "/machine-config", &config).await
    }

    /// Pause all vCPUs.
    pub async fn pause(&self) -> Result<()> {
        self.send(Method::PATCH, "/vm", &serde_json::json!({ "state": "Paused" }))
            .await
    }

    /// Resume paused vCPUs.
    pub async fn resume(&self) -> Result<()> {
        self.send(Method::PATCH, "/vm", &serde_json::json!({ "state": "Resumed" }))
            .await
    }

    /// Ask the guest to shut down (Ctrl+Alt+Del).
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.send(
            Method::PUT,
            "/actions",
            &serde_json::json!({ "action_type": "SendCtrlAltDel" }),
        )
        .await
    }

    /// Write a full snapshot. The VM must be paused.
    pub async fn create_snapshot(&self, state_path: &Path, mem_path: &Path) -> Result<()> {
        let state = state_path.to_string_lossy();
        let mem = mem_path.to_string_lossy();
        let body = SnapshotCreateBody {
            snapshot_type: "Full",
            snapshot_path: &state,
            mem_file_path: &mem,
        };
        self.send(Method::PUT, "/snapshot/create", &body).await
    }

    /// Load a snapshot into a fresh, unconfigured Firecracker process.
    pub async fn load_snapshot(&self, state_path: &Path, mem_path: &Path, resume: bool) -> Result<()> {
        let state = state_path.to_string_lossy();
        let mem = mem_path.to_string_lossy();
        let body = SnapshotLoadBody {
            snapshot_path: &state,
            mem_backend: MemBackend {
                backend_type: "File",
                backend_path: &mem,
            },
            enable_diff_snapshots: false,
            resume_vm: resume,
        };
        self.send(Method::PUT, "/snapshot/load", &body).await
    }

    async fn send<T: Serialize>(&self, method: Method, path: &str, payload: &T) -> Result<()> {
        let start = Instant::now();
        let transport = |message: String| VmError::Transport {
            method: method.to_string(),
            path: path.to_string(),
            message,
        };
        let body = serde_json::to_string(payload).map_err(|e| transport(format!("encode body: {e}")))?;
        tracing::trace!(method = %method, path, body = %body, "Firecracker API request");

        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        let request = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .map_err(|e| transport(format!("build request: {e}")))?;

        let client = Client::unix();
        let response = client.request(request).await.map_err(|e| {
            tracing::error!(method = %method, path, error = %e, "Firecracker API request failed");
            transport(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_bytes = hyper::body::to_bytes(response.into_body())
                .await
                .unwrap_or_default();
            let body = String::from_utf8_lossy(&body_bytes).into_owned();
            tracing::error!(method = %method, path, status = %status, body = %body, "Firecracker API error");
            return Err(VmError::Api {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(
            method = %method,
            path,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Firecracker API call succeeded"
        );
        Ok(())
    }
}
