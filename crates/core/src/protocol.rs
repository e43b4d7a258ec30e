//! Client/daemon wire format.
//!
//! One JSON object per line over a Unix socket, one request per connection:
//! `{"action": "...", "params": {...}}` answered by
//! `{"success": bool, "data": ..., "error": "..."}`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::metrics::SchedulerMetrics;
use crate::model::{ResourceStatus, Task, TaskId, TaskStatus};

/// Longest request or response line accepted, newline included.
pub const MAX_LINE_BYTES: usize = 1 << 20;

// ── Requests ──────────────────────────────────────────────────

/// A missing or `null` `params` reads as `{}`, so parameterless actions
/// can be sent as a bare `{"action": "status"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    content = "params",
    rename_all = "snake_case",
    try_from = "RawRequest"
)]
pub enum Request {
    Submit(SubmitParams),
    Status(StatusParams),
    List(ListParams),
    Cancel(CancelParams),
    Logs(LogsParams),
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Request::Submit(_) => "submit",
            Request::Status(_) => "status",
            Request::List(_) => "list",
            Request::Cancel(_) => "cancel",
            Request::Logs(_) => "logs",
        }
    }
}

#[derive(Deserialize)]
struct RawRequest {
    action: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

impl TryFrom<RawRequest> for Request {
    type Error = String;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        fn params<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, String> {
            serde_json::from_value(value).map_err(|e| format!("invalid params: {e}"))
        }

        let value = match raw.params {
            None | Some(serde_json::Value::Null) => serde_json::json!({}),
            Some(value) => value,
        };
        match raw.action.as_str() {
            "submit" => params(value).map(Request::Submit),
            "status" => params(value).map(Request::Status),
            "list" => params(value).map(Request::List),
            "cancel" => params(value).map(Request::Cancel),
            "logs" => params(value).map(Request::Logs),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Optional fields fall back to the daemon's configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitParams {
    pub command: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub gpu_ids: Option<Vec<u32>>,
    #[serde(default)]
    pub min_free_memory_gb: Option<f64>,
    #[serde(default)]
    pub max_util_percent: Option<f64>,
    #[serde(default)]
    pub gpu_count: Option<u32>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusParams {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListParams {
    /// `None` lists every task.
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    /// Full id or a unique prefix of it.
    pub task_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogsParams {
    pub task_id: String,
    /// Number of trailing lines. `None` uses the daemon default, `Some(0)` returns everything.
    #[serde(default)]
    pub tail: Option<usize>,
}

// ── Replies ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReply {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub gpus: Vec<ResourceStatus>,
    pub tasks: BTreeMap<TaskStatus, usize>,
    pub running: bool,
    pub uptime_seconds: f64,
    pub config: StatusConfig,
    pub metrics: SchedulerMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    pub check_interval: f64,
    pub max_concurrent_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListReply {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReply {
    pub task_id: TaskId,
    pub cancelled: bool,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogsReply {
    pub logs: String,
}

// ── Response envelope ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok<T: Serialize>(data: &T) -> Result<Self, CoreError> {
        let data = serde_json::to_value(data).map_err(|e| CoreError::Protocol(e.to_string()))?;
        Ok(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Unwrap a successful payload, turning a failure into an error carrying
    /// the daemon's message.
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T, CoreError> {
        if !self.success {
            return Err(CoreError::Protocol(
                self.error.unwrap_or_else(|| "request failed".to_string()),
            ));
        }
        let data = self.data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(|e| CoreError::Protocol(format!("malformed reply: {e}")))
    }
}

// ── Line codec ────────────────────────────────────────────────

/// Serialize one message as a newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, CoreError> {
    let mut bytes = serde_json::to_vec(message).map_err(|e| CoreError::Protocol(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, CoreError> {
    serde_json::from_str(line.trim_end()).map_err(|e| CoreError::Protocol(format!("invalid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = Request::Cancel(CancelParams {
            task_id: "3f2a".into(),
        });
        let json: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(json["action"], "cancel");
        assert_eq!(json["params"]["task_id"], "3f2a");
    }

    #[test]
    fn test_submit_accepts_sparse_params() {
        let line = r#"{"action":"submit","params":{"command":"python train.py","gpu_ids":null}}"#;
        let req: Request = decode_line(line).unwrap();
        match req {
            Request::Submit(params) => {
                assert_eq!(params.command, "python train.py");
                assert!(params.gpu_ids.is_none());
                assert_eq!(params.priority, 0);
                assert!(params.env.is_empty());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_list_filter_uses_lowercase_status() {
        let req: Request = decode_line(r#"{"action":"list","params":{"status":"failed"}}"#).unwrap();
        assert_eq!(
            req,
            Request::List(ListParams {
                status: Some(TaskStatus::Failed)
            })
        );
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = decode_line::<Request>(r#"{"action":"reboot","params":{}}"#).unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[test]
    fn test_params_may_be_omitted() {
        let req: Request = decode_line(r#"{"action":"status"}"#).unwrap();
        assert_eq!(req, Request::Status(StatusParams {}));

        let req: Request = decode_line(r#"{"action":"list","params":null}"#).unwrap();
        assert_eq!(req, Request::List(ListParams { status: None }));
    }

    #[test]
    fn test_required_params_still_enforced() {
        let err = decode_line::<Request>(r#"{"action":"cancel"}"#).unwrap_err();
        assert!(err.to_string().contains("task_id"));

        let err = decode_line::<Request>(r#"{"action":"reboot"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown action: reboot"));
    }

    #[test]
    fn test_error_response_into_data() {
        let err = Response::error("task not found: abc")
            .into_data::<LogsReply>()
            .unwrap_err();
        assert!(err.to_string().contains("task not found"));
    }

    #[test]
    fn test_encode_line_terminates_with_newline() {
        let bytes = encode_line(&Response::ok(&LogsReply { logs: "a\nb".into() }).unwrap()).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }
}
