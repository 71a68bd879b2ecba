//! The terminal engine seam.
//!
//! An engine owns the shell processes, their scrollback and the per-session
//! viewport connections. The manager only reaches it through
//! [`TerminalEngine`], and the engine reports back through [`EngineEvents`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use devmux_protocol::SessionId;

use crate::error::EngineError;
use crate::output::HistoryChunk;

/// Point-in-time view of an engine session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub name: String,
    /// Real path. Callers virtualize before exposing it.
    pub working_dir: PathBuf,
    pub created_at: SystemTime,
    pub last_active_at: SystemTime,
    pub is_active: bool,
    pub next_sequence: u64,
}

/// Callbacks fired from engine-owned threads. Implementations must not
/// block.
pub trait EngineEvents: Send + Sync {
    fn on_data(
        &self,
        session_id: &str,
        chunk: &HistoryChunk,
        is_echo: bool,
        source_conn: Option<&str>,
    );

    fn on_name_changed(&self, session_id: &str, old_name: &str, new_name: &str, working_dir: &Path);

    fn on_session_created(&self, _session_id: &str) {}

    fn on_session_closed(&self, _session_id: &str) {}

    fn on_error(&self, session_id: &str, err: &EngineError);
}

/// Session table plus PTY lifecycle. Internally synchronized.
pub trait TerminalEngine: Send + Sync {
    fn set_event_handler(&self, handler: Arc<dyn EngineEvents>);

    fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<SessionSnapshot, EngineError>;

    fn get_session(&self, session_id: &str) -> Option<SessionSnapshot>;

    fn list_sessions(&self) -> Vec<SessionSnapshot>;

    fn delete_session(&self, session_id: &str) -> Result<(), EngineError>;

    fn clear_history(&self, session_id: &str) -> Result<(), EngineError>;

    /// Adds a viewport, or updates its size when `conn_id` is already known.
    fn add_connection(
        &self,
        session_id: &str,
        conn_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), EngineError>;

    fn remove_connection(&self, session_id: &str, conn_id: &str) -> Result<(), EngineError>;

    fn update_connection_size(
        &self,
        session_id: &str,
        conn_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), EngineError>;

    /// Write input, tagging the connection it came from so the resulting
    /// echo can be attributed.
    fn write_data(
        &self,
        session_id: &str,
        data: &[u8],
        source_conn: Option<&str>,
    ) -> Result<(), EngineError>;

    /// Retained chunks with `sequence >= start_seq`.
    fn history_from(
        &self,
        session_id: &str,
        start_seq: u64,
    ) -> Result<Vec<HistoryChunk>, EngineError>;
}
