//! Ordering and failure tolerance of combined VM + state-store snapshots.

use async_trait::async_trait;
use grove_core::{
    CombinedSandbox, CommandOutput, CommandRunner, ExecutionRequest, ExecutionResult, MockSandbox, Result, Sandbox,
    SandboxConfig, SandboxId, SandboxInfo, StateStoreClient, StateStoreConfig,
};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

/// Delegates to a mock and records snapshot calls.
struct RecordingSandbox {
    inner: MockSandbox,
    log: Log,
}

#[async_trait]
impl Sandbox for RecordingSandbox {
    fn id(&self) -> &SandboxId {
        self.inner.id()
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.inner.execute(request).await
    }

    async fn create_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("vm snapshot {snapshot_id}"));
        self.inner.create_snapshot(snapshot_id).await
    }

    async fn restore_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("vm restore {snapshot_id}"));
        self.inner.restore_snapshot(snapshot_id).await
    }

    async fn list_snapshots(&self) -> Result<Vec<String>> {
        self.inner.list_snapshots().await
    }

    async fn info(&self) -> Result<SandboxInfo> {
        self.inner.info().await
    }

    async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.inner.stop().await
    }

    async fn destroy(&self) -> Result<()> {
        self.inner.destroy().await
    }
}

/// State store whose commits and restores succeed or fail on demand.
struct RecordingStore {
    log: Log,
    fail_commit: bool,
    fail_restore: bool,
}

#[async_trait]
impl CommandRunner for RecordingStore {
    async fn run(&self, _: &Path, args: &[String], _: Option<&Path>, _: Duration) -> io::Result<CommandOutput> {
        let operation = args[0].as_str();
        let entry = match operation {
            "restore" => format!("store restore {}", args[args.len() - 1]),
            _ => format!("store {operation}"),
        };
        self.log.lock().unwrap().push(entry);
        let failed = match operation {
            "commit" => self.fail_commit,
            "restore" => self.fail_restore,
            _ => false,
        };
        if failed {
            return Ok(CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: format!("{operation}: repository locked\n"),
            });
        }
        let stdout = if operation == "commit" {
            r#"{"snapshot_id":"c0ffee"}"#.to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

fn combined(fail_commit: bool, fail_restore: bool) -> (CombinedSandbox, Log) {
    let log: Log = Arc::default();
    let sandbox = Arc::new(RecordingSandbox {
        inner: MockSandbox::new(SandboxConfig::default()),
        log: Arc::clone(&log),
    });
    let store = StateStoreClient::with_runner(
        StateStoreConfig::new("helios", "/srv/work"),
        Arc::new(RecordingStore {
            log: Arc::clone(&log),
            fail_commit,
            fail_restore,
        }),
    );
    (CombinedSandbox::new(sandbox, store), log)
}

#[tokio::test]
async fn test_commit_before_vm_snapshot_and_reverse_on_restore() {
    let (sandbox, log) = combined(false, false);
    let snap = sandbox.snapshot("n1").await.unwrap();
    assert_eq!(snap.state_snapshot_id.as_deref(), Some("c0ffee"));
    sandbox.restore("n1").await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["store commit", "vm snapshot n1", "vm restore n1", "store restore grove-n1"]
    );
}

#[tokio::test]
async fn test_failed_commit_still_snapshots_vm() {
    let (sandbox, log) = combined(true, false);
    let snap = sandbox.snapshot("n1").await.unwrap();

    assert_eq!(snap.state_snapshot_id, None);
    assert_eq!(snap.warnings.len(), 1);
    assert!(snap.warnings[0].contains("repository locked"));
    assert_eq!(sandbox.list_snapshots().await.unwrap(), vec!["n1"]);
    assert_eq!(*log.lock().unwrap(), vec!["store commit", "vm snapshot n1"]);
}

#[tokio::test]
async fn test_failed_store_restore_keeps_vm_restore() {
    let (sandbox, _) = combined(false, true);
    sandbox.snapshot("n1").await.unwrap();

    let restored = sandbox.restore("n1").await.unwrap();
    assert_eq!(restored.warnings.len(), 1);
    assert!(restored.warnings[0].contains("restore failed"));
    assert_eq!(restored.state_metrics, None);
}

#[tokio::test]
async fn test_trait_object_use() {
    let (sandbox, log) = combined(false, false);
    let handle: Arc<dyn Sandbox> = Arc::new(sandbox);
    handle.create_snapshot("n2").await.unwrap();
    handle.restore_snapshot("n2").await.unwrap();
    assert_eq!(log.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_new_wrapper_restores_filesystem_layer() {
    let (original, log) = combined(false, false);
    original.snapshot("n3").await.unwrap();
    let rewrapped = CombinedSandbox::new(Arc::clone(original.inner()), original.store().clone());
    drop(original);

    let restored = rewrapped.restore("n3").await.unwrap();
    assert!(restored.warnings.is_empty());
    assert_eq!(
        *log.lock().unwrap(),
        vec!["store commit", "vm snapshot n3", "vm restore n3", "store restore grove-n3"]
    );
}
