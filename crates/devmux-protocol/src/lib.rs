
use serde::{Deserialize, Serialize};

/// Unique identifier for a session.
pub type SessionId = String;

/// Client-chosen identifier for one viewport attached to a session.
pub type ConnId = String;

/// Upper bound for a single JSON line on the agent socket.
pub const MAX_JSON_LINE_BYTES: usize = 1024 * 1024;

/// Envelope for everything a client writes to the agent socket.
///
/// Requests carry an `id` that is echoed back on the matching `ok`/`error`
/// response. Notifies (`input`, `resize`) are never answered, so their `id`
/// is ignored.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

/// Client-to-agent requests and notifies.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Create {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
    },
    List,
    Attach {
        #[serde(default)]
        session_id: SessionId,
        #[serde(default)]
        conn_id: ConnId,
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
    },
    Input {
        #[serde(default)]
        session_id: SessionId,
        #[serde(default)]
        conn_id: ConnId,
        #[serde(default)]
        data_b64: String,
    },
    Resize {
        #[serde(default)]
        session_id: SessionId,
        #[serde(default)]
        conn_id: ConnId,
        #[serde(default)]
        cols: u16,
        #[serde(default)]
        rows: u16,
    },
    History {
        #[serde(default)]
        session_id: SessionId,
        #[serde(default)]
        start_seq: u64,
        #[serde(default)]
        end_seq: Option<u64>,
    },
    Clear {
        #[serde(default)]
        session_id: SessionId,
    },
    Delete {
        #[serde(default)]
        session_id: SessionId,
    },
}

impl Request {
    /// One-way messages get no response, not even an error.
    pub fn is_notify(&self) -> bool {
        matches!(self, Request::Input { .. } | Request::Resize { .. })
    }
}

/// Agent-to-client frames.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
    Event(Event),
}

impl Response {
    pub fn ok(id: Option<u64>, data: Option<serde_json::Value>) -> Self {
        Response::Ok { id, data }
    }

    pub fn error(id: Option<u64>, code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            id,
            code,
            message: message.into(),
        }
    }
}

/// Notifications pushed to attached streams.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Output {
        session_id: SessionId,
        data_b64: String,
        sequence: u64,
        timestamp_ms: u64,
        echo_of_input: bool,
        /// Set only on the frame delivered to the connection whose input
        /// produced this echo.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_source: Option<ConnId>,
    },
    NameUpdate {
        session_id: SessionId,
        new_name: String,
        working_dir: String,
    },
}

impl Event {
    pub fn session_id(&self) -> &str {
        match self {
            Event::Output { session_id, .. } | Event::NameUpdate { session_id, .. } => session_id,
        }
    }
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    PermissionDenied,
    SessionNotFound,
    SandboxViolation,
    ServerError,
}

/// Session summary as exposed to clients. `working_dir` is always virtual.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub working_dir: String,
    pub created_at_ms: u64,
    pub last_active_at_ms: u64,
    pub is_active: bool,
}

/// One replayed scrollback chunk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub data_b64: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateResult {
    pub session: SessionInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListResult {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HistoryResult {
    pub chunks: Vec<ChunkInfo>,
}

/// Result body for attach, clear and delete.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct OkResult {
    pub ok: bool,
}
