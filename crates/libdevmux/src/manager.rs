use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use devmux_protocol::{
    ChunkInfo, CreateResult, Event, HistoryResult, ListResult, OkResult, Request, SessionInfo,
};

use crate::engine::{EngineEvents, SessionSnapshot, TerminalEngine};
use crate::error::{EngineError, ManagerError};
use crate::output::{HistoryChunk, epoch_ms};
use crate::policy::{Caller, ExecutePolicy};
use crate::registry::SessionRegistry;
use crate::sink::StreamId;
use crate::vpath::VirtualPathSandbox;

const DEFAULT_SINK_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-stream notification queue bound.
    pub sink_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }
}

/// Binds the engine, the attachment registry and the RPC handlers.
pub struct TerminalManager {
    engine: Arc<dyn TerminalEngine>,
    registry: Arc<SessionRegistry>,
    sandbox: Arc<VirtualPathSandbox>,
    policy: Arc<dyn ExecutePolicy>,
}

impl TerminalManager {
    pub fn new(
        engine: Arc<dyn TerminalEngine>,
        sandbox: VirtualPathSandbox,
        policy: Arc<dyn ExecutePolicy>,
        config: ManagerConfig,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.sink_capacity));
        let sandbox = Arc::new(sandbox);
        engine.set_event_handler(Arc::new(OutputFanout {
            registry: Arc::clone(&registry),
            sandbox: Arc::clone(&sandbox),
        }));
        Self {
            engine,
            registry,
            sandbox,
            policy,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn sandbox(&self) -> &VirtualPathSandbox {
        &self.sandbox
    }

    /// Route a decoded request. Notifies return `Ok(None)`.
    pub async fn handle(
        &self,
        caller: &Caller,
        request: Request,
    ) -> Result<Option<Value>, ManagerError> {
        match request {
            Request::Create {
                name,
                working_dir,
                cols,
                rows,
            } => {
                let session = self.create(caller, name, working_dir, cols, rows)?;
                to_value(&CreateResult { session })
            }
            Request::List => {
                let sessions = self.list(caller)?;
                to_value(&ListResult { sessions })
            }
            Request::Attach {
                session_id,
                conn_id,
                cols,
                rows,
            } => {
                self.attach(caller, &session_id, &conn_id, cols, rows)?;
                to_value(&OkResult { ok: true })
            }
            Request::Input {
                session_id,
                conn_id,
                data_b64,
            } => {
                self.input(caller, &session_id, &conn_id, &data_b64)?;
                Ok(None)
            }
            Request::Resize {
                session_id,
                conn_id,
                cols,
                rows,
            } => {
                self.resize(caller, &session_id, &conn_id, cols, rows)?;
                Ok(None)
            }
            Request::History {
                session_id,
                start_seq,
                end_seq,
            } => {
                let chunks = self.history(caller, &session_id, start_seq, end_seq)?;
                to_value(&HistoryResult { chunks })
            }
            Request::Clear { session_id } => {
                self.clear(caller, &session_id)?;
                to_value(&OkResult { ok: true })
            }
            Request::Delete { session_id } => {
                self.delete(caller, &session_id)?;
                to_value(&OkResult { ok: true })
            }
        }
    }

    pub fn create(
        &self,
        caller: &Caller,
        name: Option<String>,
        working_dir: Option<String>,
        cols: u16,
        rows: u16,
    ) -> Result<SessionInfo, ManagerError> {
        self.authorize(caller)?;
        require_viewport(cols, rows)?;

        let real_dir = match working_dir.as_deref() {
            None | Some("") => self.sandbox.root().to_path_buf(),
            Some(virtual_dir) => self.sandbox.resolve(virtual_dir)?,
        };
        if !real_dir.is_dir() {
            return Err(ManagerError::invalid(format!(
                "working_dir {} is not a directory",
                self.sandbox.virtualize(&real_dir)
            )));
        }

        let snapshot = self
            .engine
            .create_session(name.as_deref().unwrap_or_default(), &real_dir, cols, rows)
            .map_err(|err| internal("create session", err))?;
        info!(session_id = %snapshot.id, name = %snapshot.name, "terminal created");
        Ok(self.session_info(&snapshot))
    }

    pub fn list(&self, caller: &Caller) -> Result<Vec<SessionInfo>, ManagerError> {
        self.authorize(caller)?;
        Ok(self
            .engine
            .list_sessions()
            .iter()
            .map(|snapshot| self.session_info(snapshot))
            .collect())
    }

    pub fn attach(
        &self,
        caller: &Caller,
        session_id: &str,
        conn_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), ManagerError> {
        self.authorize(caller)?;
        require_id("session_id", session_id)?;
        require_id("conn_id", conn_id)?;
        require_viewport(cols, rows)?;
        self.require_session(session_id)?;

        let stream = &caller.stream;
        let previous = self
            .registry
            .attach(session_id, conn_id, stream)
            .map_err(|err| ManagerError::Internal(format!("attach stream: {err}")))?;

        if let Err(err) = self.engine.add_connection(session_id, conn_id, cols, rows) {
            self.registry.rollback(stream.id, session_id, previous.as_deref());
            return Err(match err {
                EngineError::SessionNotFound(id) => ManagerError::SessionNotFound(id),
                other => internal("add connection", other),
            });
        }

        if let Some(replaced) = previous.filter(|prev| prev != conn_id) {
            if let Err(err) = self.engine.remove_connection(session_id, &replaced) {
                debug!(session_id, conn_id = %replaced, error = %err, "replaced connection already gone");
            }
        }

        debug!(session_id, conn_id, stream = %stream.id, cols, rows, "attached");
        Ok(())
    }

    pub fn input(
        &self,
        caller: &Caller,
        session_id: &str,
        conn_id: &str,
        data_b64: &str,
    ) -> Result<(), ManagerError> {
        self.authorize(caller)?;
        require_id("session_id", session_id)?;
        require_id("conn_id", conn_id)?;
        let data = STANDARD
            .decode(data_b64)
            .map_err(|err| ManagerError::invalid(format!("data_b64 is not valid base64: {err}")))?;
        if data.is_empty() {
            return Ok(());
        }
        self.require_session(session_id)?;

        self.engine
            .write_data(session_id, &data, Some(conn_id))
            .map_err(|err| match err {
                EngineError::SessionNotFound(id) => ManagerError::SessionNotFound(id),
                other => internal("write input", other),
            })
    }

    /// Best effort: a connection that is not (yet) attached is ignored,
    /// since resize can race ahead of attach.
    pub fn resize(
        &self,
        caller: &Caller,
        session_id: &str,
        conn_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), ManagerError> {
        self.authorize(caller)?;
        require_id("session_id", session_id)?;
        require_id("conn_id", conn_id)?;
        require_viewport(cols, rows)?;
        self.require_session(session_id)?;

        match self
            .engine
            .update_connection_size(session_id, conn_id, cols, rows)
        {
            Ok(()) => Ok(()),
            Err(EngineError::ConnectionNotFound { .. }) => {
                debug!(session_id, conn_id, "resize for unknown connection ignored");
                Ok(())
            }
            Err(EngineError::SessionNotFound(id)) => Err(ManagerError::SessionNotFound(id)),
            Err(other) => Err(internal("resize", other)),
        }
    }

    /// Chunks with `start_seq <= sequence <= end_seq`. A missing or zero
    /// `end_seq` means no upper bound.
    pub fn history(
        &self,
        caller: &Caller,
        session_id: &str,
        start_seq: u64,
        end_seq: Option<u64>,
    ) -> Result<Vec<ChunkInfo>, ManagerError> {
        self.authorize(caller)?;
        require_id("session_id", session_id)?;
        self.require_session(session_id)?;

        let chunks = self
            .engine
            .history_from(session_id, start_seq)
            .map_err(|err| match err {
                EngineError::SessionNotFound(id) => ManagerError::SessionNotFound(id),
                other => internal("read history", other),
            })?;

        let upper = end_seq.filter(|end| *end > 0).unwrap_or(u64::MAX);
        Ok(chunks
            .iter()
            .filter(|chunk| chunk.sequence >= start_seq && chunk.sequence <= upper)
            .map(chunk_info)
            .collect())
    }

    pub fn clear(&self, caller: &Caller, session_id: &str) -> Result<(), ManagerError> {
        self.authorize(caller)?;
        require_id("session_id", session_id)?;
        self.engine.clear_history(session_id).map_err(|err| match err {
            EngineError::SessionNotFound(id) => ManagerError::SessionNotFound(id),
            other => internal("clear history", other),
        })
    }

    /// Removes the engine session. Attachments stay registered until their
    /// streams detach.
    pub fn delete(&self, caller: &Caller, session_id: &str) -> Result<(), ManagerError> {
        self.authorize(caller)?;
        require_id("session_id", session_id)?;
        self.engine.delete_session(session_id).map_err(|err| match err {
            EngineError::SessionNotFound(id) => ManagerError::SessionNotFound(id),
            other => internal("delete session", other),
        })?;
        info!(session_id, "terminal deleted");
        Ok(())
    }

    /// Stream teardown hook: drop the stream's attachments, release the
    /// matching engine connections and close its sink.
    pub async fn detach_stream(&self, stream: StreamId) -> usize {
        let removed = self.registry.detach_sink(stream).await;
        for (session_id, conn_id) in &removed {
            match self.engine.remove_connection(session_id, conn_id) {
                Ok(()) => {}
                // Deleted sessions and replaced connections are expected here.
                Err(EngineError::SessionNotFound(_) | EngineError::ConnectionNotFound { .. }) => {}
                Err(err) => warn!(session_id = %session_id, conn_id = %conn_id, error = %err, "remove connection failed"),
            }
        }
        removed.len()
    }

    fn authorize(&self, caller: &Caller) -> Result<(), ManagerError> {
        if self.policy.can_execute(caller) {
            Ok(())
        } else {
            Err(ManagerError::PermissionDenied)
        }
    }

    fn require_session(&self, session_id: &str) -> Result<SessionSnapshot, ManagerError> {
        self.engine
            .get_session(session_id)
            .ok_or_else(|| ManagerError::SessionNotFound(session_id.to_string()))
    }

    fn session_info(&self, snapshot: &SessionSnapshot) -> SessionInfo {
        SessionInfo {
            id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            working_dir: self.sandbox.virtualize(&snapshot.working_dir),
            created_at_ms: epoch_ms(snapshot.created_at),
            last_active_at_ms: epoch_ms(snapshot.last_active_at),
            is_active: snapshot.is_active,
        }
    }
}

/// Engine callback sink: turns engine events into notify frames and fans
/// them out. Runs on engine threads, so it only ever enqueues.
struct OutputFanout {
    registry: Arc<SessionRegistry>,
    sandbox: Arc<VirtualPathSandbox>,
}

impl EngineEvents for OutputFanout {
    fn on_data(
        &self,
        session_id: &str,
        chunk: &HistoryChunk,
        is_echo: bool,
        source_conn: Option<&str>,
    ) {
        let data_b64 = STANDARD.encode(&chunk.data);
        let timestamp_ms = chunk.timestamp_ms();
        self.registry.broadcast_with(session_id, |conn_id| {
            let own_echo = is_echo && source_conn == Some(conn_id);
            Event::Output {
                session_id: session_id.to_string(),
                data_b64: data_b64.clone(),
                sequence: chunk.sequence,
                timestamp_ms,
                echo_of_input: own_echo,
                original_source: own_echo.then(|| conn_id.to_string()),
            }
        });
    }

    fn on_name_changed(&self, session_id: &str, old_name: &str, new_name: &str, working_dir: &Path) {
        debug!(session_id, old_name, new_name, "session renamed");
        self.registry.broadcast(
            session_id,
            Event::NameUpdate {
                session_id: session_id.to_string(),
                new_name: new_name.to_string(),
                working_dir: self.sandbox.virtualize(working_dir),
            },
        );
    }

    fn on_session_created(&self, session_id: &str) {
        debug!(session_id, "engine session created");
    }

    fn on_session_closed(&self, session_id: &str) {
        debug!(session_id, "engine session closed");
    }

    fn on_error(&self, session_id: &str, err: &EngineError) {
        error!(session_id, error = %err, "engine error");
    }
}

fn chunk_info(chunk: &HistoryChunk) -> ChunkInfo {
    ChunkInfo {
        sequence: chunk.sequence,
        timestamp_ms: chunk.timestamp_ms(),
        data_b64: STANDARD.encode(&chunk.data),
    }
}

fn require_id(field: &str, value: &str) -> Result<(), ManagerError> {
    if value.is_empty() {
        return Err(ManagerError::invalid(format!("{field} is required")));
    }
    Ok(())
}

fn require_viewport(cols: u16, rows: u16) -> Result<(), ManagerError> {
    if cols == 0 || rows == 0 {
        return Err(ManagerError::invalid("cols and rows must be positive"));
    }
    Ok(())
}

fn internal(context: &str, err: EngineError) -> ManagerError {
    error!(error = %err, "{context} failed");
    ManagerError::Internal(format!("{context}: {err}"))
}

fn to_value<T: serde::Serialize>(data: &T) -> Result<Option<Value>, ManagerError> {
    serde_json::to_value(data)
        .map(Some)
        .map_err(|err| ManagerError::Internal(format!("encode response: {err}")))
}
