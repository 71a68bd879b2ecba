pub mod engine;
pub mod error;
pub mod manager;
pub mod osc;
pub mod output;
pub mod policy;
pub mod pty;
pub mod registry;
pub mod sink;
pub mod vpath;

pub use engine::{EngineEvents, SessionSnapshot, TerminalEngine};
pub use error::{EngineError, ManagerError, SandboxError, TransportError};
pub use manager::{ManagerConfig, TerminalManager};
pub use output::{HistoryChunk, ScrollbackBuffer};
pub use policy::{AllowAll, Caller, ExecutePolicy, ReadOnlyUids};
pub use pty::{PtyEngine, PtyEngineConfig};
pub use registry::SessionRegistry;
pub use sink::{AsyncNotifySink, NotifyTransport, SendOutcome, StreamHandle, StreamId};
pub use vpath::VirtualPathSandbox;
