use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime};

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::{debug, info, warn};

use devmux_protocol::{ConnId, SessionId};

use crate::engine::{EngineEvents, SessionSnapshot, TerminalEngine};
use crate::error::EngineError;
use crate::osc::{OscTracker, OscUpdate};
use crate::output::{HistoryChunk, ScrollbackBuffer};

const DEFAULT_SCROLLBACK_CHUNKS: usize = 10_000;
const DEFAULT_ECHO_WINDOW: Duration = Duration::from_millis(50);
const READ_BUFFER_BYTES: usize = 4096;
const EIO: i32 = 5;

#[derive(Debug, Clone)]
pub struct PtyEngineConfig {
    pub shell: String,
    pub shell_args: Vec<String>,
    pub scrollback_chunks: usize,
    /// Output read within this long after a tagged write counts as its echo.
    pub echo_window: Duration,
}

impl Default for PtyEngineConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            shell_args: Vec::new(),
            scrollback_chunks: DEFAULT_SCROLLBACK_CHUNKS,
            echo_window: DEFAULT_ECHO_WINDOW,
        }
    }
}

pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn EngineEvents>>>>;

fn current_handler(slot: &HandlerSlot) -> Option<Arc<dyn EngineEvents>> {
    slot.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Viewport {
    cols: u16,
    rows: u16,
}

struct SessionState {
    name: String,
    working_dir: PathBuf,
    last_active_at: SystemTime,
    alive: bool,
    deleted: bool,
    size: Viewport,
    connections: HashMap<ConnId, Viewport>,
    scrollback: ScrollbackBuffer,
    pending_echo: Option<(ConnId, Instant)>,
}

impl SessionState {
    /// Smallest viewport across attached connections, so every client can
    /// render the full screen.
    fn effective_size(&self) -> Option<Viewport> {
        let cols = self.connections.values().map(|v| v.cols).min()?;
        let rows = self.connections.values().map(|v| v.rows).min()?;
        Some(Viewport { cols, rows })
    }

    /// Put a connection back the way it was before a failed change.
    fn restore_connection(&mut self, conn_id: &str, previous: Option<Viewport>) {
        match previous {
            Some(viewport) => {
                self.connections.insert(conn_id.to_string(), viewport);
            }
            None => {
                self.connections.remove(conn_id);
            }
        }
    }

    fn take_echo(&mut self, window: Duration) -> Option<ConnId> {
        let (conn_id, at) = self.pending_echo.take()?;
        (at.elapsed() <= window).then_some(conn_id)
    }
}

struct PtySession {
    id: SessionId,
    created_at: SystemTime,
    state: Mutex<SessionState>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtySession {
    fn snapshot(&self) -> SessionSnapshot {
        let state = lock(&self.state);
        SessionSnapshot {
            id: self.id.clone(),
            name: state.name.clone(),
            working_dir: state.working_dir.clone(),
            created_at: self.created_at,
            last_active_at: state.last_active_at,
            is_active: state.alive,
            next_sequence: state.scrollback.next_seq(),
        }
    }

    fn apply_viewport(&self) -> Result<(), EngineError> {
        let (target, current) = {
            let mut state = lock(&self.state);
            match state.effective_size() {
                Some(size) if size != state.size => {
                    let current = state.size;
                    state.size = size;
                    (size, current)
                }
                _ => return Ok(()),
            }
        };
        let resized = lock(&self.master).resize(PtySize {
            rows: target.rows,
            cols: target.cols,
            pixel_width: 0,
            pixel_height: 0,
        });
        if let Err(err) = resized {
            let mut state = lock(&self.state);
            if state.size == target {
                state.size = current;
            }
            return Err(EngineError::Pty(err.to_string()));
        }
        Ok(())
    }
}

/// [`TerminalEngine`] backed by real pseudo-terminals.
pub struct PtyEngine {
    config: PtyEngineConfig,
    sessions: Mutex<HashMap<SessionId, Arc<PtySession>>>,
    handler: HandlerSlot,
}

impl PtyEngine {
    pub fn new(config: PtyEngineConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            handler: Arc::new(RwLock::new(None)),
        }
    }

    fn session(&self, session_id: &str) -> Result<Arc<PtySession>, EngineError> {
        lock(&self.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    fn display_name(&self, requested: &str) -> String {
        if !requested.is_empty() {
            return requested.to_string();
        }
        Path::new(&self.config.shell)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shell".to_string())
    }
}

impl TerminalEngine for PtyEngine {
    fn set_event_handler(&self, handler: Arc<dyn EngineEvents>) {
        *self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<SessionSnapshot, EngineError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let size = Viewport { cols, rows };

        let pty_system = native_pty_system();
        let pty_pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.config.shell);
        cmd.args(&self.config.shell_args);
        cmd.cwd(working_dir);
        cmd.env("TERM", "xterm-256color");

        let mut child = pty_pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| EngineError::Pty(e.to_string()))?;
        drop(pty_pair.slave);

        let (reader, writer) = match take_io(pty_pair.master.as_ref()) {
            Ok(io) => io,
            Err(err) => {
                if let Err(kill_err) = child.kill() {
                    debug!(error = %kill_err, "kill after failed pty setup");
                }
                let _ = child.wait();
                return Err(err);
            }
        };
        let killer = child.clone_killer();

        let now = SystemTime::now();
        let session = Arc::new(PtySession {
            id: session_id.clone(),
            created_at: now,
            state: Mutex::new(SessionState {
                name: self.display_name(name),
                working_dir: working_dir.to_path_buf(),
                last_active_at: now,
                alive: true,
                deleted: false,
                size,
                connections: HashMap::new(),
                scrollback: ScrollbackBuffer::new(self.config.scrollback_chunks),
                pending_echo: None,
            }),
            master: Mutex::new(pty_pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
        });

        lock(&self.sessions).insert(session_id.clone(), Arc::clone(&session));

        // Reap the child so exited shells do not linger as zombies.
        let reap_id = session_id.clone();
        std::thread::spawn(move || match child.wait() {
            Ok(status) => debug!(session_id = %reap_id, exit_code = status.exit_code(), "shell exited"),
            Err(err) => debug!(session_id = %reap_id, error = %err, "shell wait failed"),
        });

        let reader_session = Arc::clone(&session);
        let handler = Arc::clone(&self.handler);
        let echo_window = self.config.echo_window;
        std::thread::spawn(move || read_loop(reader_session, reader, handler, echo_window));

        info!(session_id = %session_id, cwd = %working_dir.display(), "session created");
        if let Some(handler) = current_handler(&self.handler) {
            handler.on_session_created(&session_id);
        }
        Ok(session.snapshot())
    }

    fn get_session(&self, session_id: &str) -> Option<SessionSnapshot> {
        lock(&self.sessions).get(session_id).map(|s| s.snapshot())
    }

    fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<PtySession>> = lock(&self.sessions).values().cloned().collect();
        let mut list: Vec<SessionSnapshot> = sessions.iter().map(|s| s.snapshot()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    fn delete_session(&self, session_id: &str) -> Result<(), EngineError> {
        let session = lock(&self.sessions)
            .remove(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        {
            let mut state = lock(&session.state);
            state.deleted = true;
            state.connections.clear();
        }
        if let Err(err) = lock(&session.killer).kill() {
            // Already exited shells report an error here.
            debug!(session_id = %session_id, error = %err, "kill failed");
        }
        info!(session_id = %session_id, "session deleted");
        Ok(())
    }

    fn clear_history(&self, session_id: &str) -> Result<(), EngineError> {
        let session = self.session(session_id)?;
        lock(&session.state).scrollback.clear();
        Ok(())
    }

    fn add_connection(
        &self,
        session_id: &str,
        conn_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), EngineError> {
        let session = self.session(session_id)?;
        let previous = lock(&session.state)
            .connections
            .insert(conn_id.to_string(), Viewport { cols, rows });
        if let Err(err) = session.apply_viewport() {
            lock(&session.state).restore_connection(conn_id, previous);
            return Err(err);
        }
        Ok(())
    }

    fn remove_connection(&self, session_id: &str, conn_id: &str) -> Result<(), EngineError> {
        let session = self.session(session_id)?;
        let removed = lock(&session.state).connections.remove(conn_id);
        if removed.is_none() {
            return Err(EngineError::ConnectionNotFound {
                session_id: session_id.to_string(),
                conn_id: conn_id.to_string(),
            });
        }
        session.apply_viewport()
    }

    fn update_connection_size(
        &self,
        session_id: &str,
        conn_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), EngineError> {
        let session = self.session(session_id)?;
        {
            let mut state = lock(&session.state);
            let Some(viewport) = state.connections.get_mut(conn_id) else {
                return Err(EngineError::ConnectionNotFound {
                    session_id: session_id.to_string(),
                    conn_id: conn_id.to_string(),
                });
            };
            *viewport = Viewport { cols, rows };
        }
        session.apply_viewport()
    }

    fn write_data(
        &self,
        session_id: &str,
        data: &[u8],
        source_conn: Option<&str>,
    ) -> Result<(), EngineError> {
        let session = self.session(session_id)?;
        {
            let mut state = lock(&session.state);
            if !state.alive {
                return Err(EngineError::SessionExited(session_id.to_string()));
            }
            state.last_active_at = SystemTime::now();
            state.pending_echo = source_conn.map(|conn| (conn.to_string(), Instant::now()));
        }

        let mut writer = lock(&session.writer);
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn history_from(
        &self,
        session_id: &str,
        start_seq: u64,
    ) -> Result<Vec<HistoryChunk>, EngineError> {
        let session = self.session(session_id)?;
        let chunks = lock(&session.state).scrollback.replay_from(start_seq);
        Ok(chunks)
    }
}

struct ReadOutcome {
    chunk: HistoryChunk,
    echo_source: Option<ConnId>,
    renamed: Option<(String, String, PathBuf)>,
}

/// Blocking PTY reader. Runs on its own thread until the shell closes the
/// terminal.
type PtyIo = (Box<dyn Read + Send>, Box<dyn Write + Send>);

fn take_io(master: &(dyn MasterPty + Send)) -> Result<PtyIo, EngineError> {
    let reader = master
        .try_clone_reader()
        .map_err(|e| EngineError::Pty(e.to_string()))?;
    let writer = master
        .take_writer()
        .map_err(|e| EngineError::Pty(e.to_string()))?;
    Ok((reader, writer))
}

fn read_loop(
    session: Arc<PtySession>,
    mut reader: Box<dyn Read + Send>,
    handler: HandlerSlot,
    echo_window: Duration,
) {
    let mut buf = [0u8; READ_BUFFER_BYTES];
    let mut osc = OscTracker::new();

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // EIO on the master is how Linux reports a closed child side.
                if err.raw_os_error() != Some(EIO) && !lock(&session.state).deleted {
                    if let Some(handler) = current_handler(&handler) {
                        handler.on_error(&session.id, &EngineError::Io(err));
                    }
                } else {
                    debug!(session_id = %session.id, error = %err, "pty read ended");
                }
                break;
            }
        };

        let updates = osc.feed(&buf[..n]);
        let outcome = {
            let mut state = lock(&session.state);
            if state.deleted {
                continue;
            }
            let chunk = state.scrollback.push(buf[..n].to_vec());
            state.last_active_at = chunk.timestamp;
            let echo_source = state.take_echo(echo_window);

            let old_name = state.name.clone();
            let old_dir = state.working_dir.clone();
            for update in updates {
                match update {
                    OscUpdate::Title(title) => state.name = title,
                    OscUpdate::WorkingDir(dir) => state.working_dir = dir,
                }
            }
            let renamed = (state.name != old_name || state.working_dir != old_dir)
                .then(|| (old_name, state.name.clone(), state.working_dir.clone()));

            ReadOutcome {
                chunk,
                echo_source,
                renamed,
            }
        };

        if let Some(handler) = current_handler(&handler) {
            handler.on_data(
                &session.id,
                &outcome.chunk,
                outcome.echo_source.is_some(),
                outcome.echo_source.as_deref(),
            );
            if let Some((old_name, new_name, working_dir)) = &outcome.renamed {
                handler.on_name_changed(&session.id, old_name, new_name, working_dir);
            }
        }
    }

    let deleted = {
        let mut state = lock(&session.state);
        state.alive = false;
        state.deleted
    };
    if !deleted {
        warn!(session_id = %session.id, "shell closed its terminal");
    }
    if let Some(handler) = current_handler(&handler) {
        handler.on_session_closed(&session.id);
    }
}
