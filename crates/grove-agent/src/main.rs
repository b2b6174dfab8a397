//! grove-agent: Guest agent for grove microVMs.
//!
//! Serves newline-delimited JSON-RPC on vsock port 52. Setting
//! `GROVE_AGENT_SOCKET` switches to a Unix socket at that path, which is
//! how the agent is exercised outside a VM.

mod exec;
mod handler;
mod protocol;
mod usage;

use handler::handle_request;
use protocol::{error_codes, Request, Response};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};
use tracing::{debug, error, info, warn};

/// Port the host connects to through the Firecracker vsock device.
const VSOCK_PORT: u32 = 52;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("grove_agent=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "grove-agent starting");

    match std::env::var("GROVE_AGENT_SOCKET") {
        Ok(path) => serve_unix(Path::new(&path)).await,
        Err(_) => serve_vsock().await,
    }
}

async fn serve_vsock() -> Result<(), BoxError> {
    let mut listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, VSOCK_PORT))?;
    info!(port = VSOCK_PORT, "listening on vsock");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer_cid = addr.cid(), "accepted vsock connection");
                tokio::spawn(serve(stream));
            }
            Err(e) => error!(error = %e, "failed to accept vsock connection"),
        }
    }
}

async fn serve_unix(path: &Path) -> Result<(), BoxError> {
    if path.exists() {
        std::fs::remove_file(path)?;
        debug!(path = %path.display(), "removed stale socket file");
    }
    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "listening on unix socket");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                debug!("accepted unix connection");
                tokio::spawn(serve(stream));
            }
            Err(e) => error!(error = %e, "failed to accept unix connection"),
        }
    }
}

async fn serve<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = handle_connection(stream).await {
        warn!(error = %e, "connection error");
    }
}

/// Handle a single client connection.
///
/// Reads newline-delimited JSON-RPC requests and writes one response line
/// per request, in order.
async fn handle_connection<S>(stream: S) -> Result<(), BoxError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            debug!("client disconnected");
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        debug!(request_len = trimmed.len(), "received request");

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => handle_request(req).await,
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                Response::error(0, error_codes::PARSE_ERROR, format!("parse error: {e}"))
            }
        };

        let mut json = serde_json::to_string(&response)?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
        writer.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn roundtrip(lines: &str) -> Vec<Value> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_connection(server));
        let (read, mut write) = tokio::io::split(client);
        write.write_all(lines.as_bytes()).await.unwrap();
        write.shutdown().await.unwrap();

        let mut reader = BufReader::new(read);
        let mut out = Vec::new();
        let mut line = String::new();
        while reader.read_line(&mut line).await.unwrap() > 0 {
            out.push(serde_json::from_str(line.trim()).unwrap());
            line.clear();
        }
        task.await.unwrap().unwrap();
        out
    }

    #[tokio::test]
    async fn test_connection_answers_in_order() {
        let responses = roundtrip(concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{}}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"exec","params":{"command":["echo","hi"]}}"#,
            "\n",
        ))
        .await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["pong"], true);
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["result"]["stdout"], "hi\n");
    }

    #[tokio::test]
    async fn test_parse_error_keeps_connection() {
        let responses = roundtrip(concat!(
            "not json\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#,
            "\n",
        ))
        .await;
        assert_eq!(responses[0]["error"]["code"], error_codes::PARSE_ERROR);
        assert_eq!(responses[1]["result"]["pong"], true);
    }
}
