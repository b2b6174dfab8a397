//! Method dispatch for the agent's JSON-RPC surface.
//!
//! | method | params         | result                   |
//! |--------|----------------|--------------------------|
//! | `ping` | ignored        | `{"pong": true}`         |
//! | `exec` | [`ExecParams`] | [`ExecResult`](crate::protocol::ExecResult) |

use crate::exec;
use crate::protocol::{error_codes, ExecParams, Request, Response};
use serde_json::{json, Value};

/// JSON-RPC error code and message.
type Failure = (i32, String);

/// Answer one request. Never fails: errors become error responses.
pub async fn handle_request(req: Request) -> Response {
    tracing::debug!(id = req.id, method = %req.method, "Request received");

    match dispatch(&req.method, req.params).await {
        Ok(result) => Response::success(req.id, result),
        Err((code, message)) => {
            tracing::debug!(id = req.id, code, message = %message, "Request rejected");
            Response::error(req.id, code, message)
        }
    }
}

async fn dispatch(method: &str, params: Value) -> Result<Value, Failure> {
    match method {
        "ping" => Ok(json!({ "pong": true })),
        "exec" => {
            let params = exec_params(params)?;
            let result = exec::run(params).await;
            serde_json::to_value(&result).map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
        }
        other => {
            tracing::warn!(method = other, "Unknown method");
            Err((error_codes::METHOD_NOT_FOUND, format!("method not found: {other}")))
        }
    }
}

fn exec_params(params: Value) -> Result<ExecParams, Failure> {
    let invalid = |detail: String| (error_codes::INVALID_PARAMS, format!("invalid params: {detail}"));
    let params: ExecParams = serde_json::from_value(params).map_err(|e| invalid(e.to_string()))?;
    if params.command.first().map_or(true, String::is_empty) {
        return Err(invalid("command is empty".into()));
    }
    Ok(params)
}
