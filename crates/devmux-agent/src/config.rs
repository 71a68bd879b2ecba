use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use nix::unistd::Uid;
use serde::Deserialize;

use libdevmux::pty::default_shell;

const DEFAULT_SINK_CAPACITY: usize = 256;
const DEFAULT_OUTBOUND_QUEUE: usize = 1024;
const DEFAULT_SCROLLBACK_CHUNKS: usize = 10_000;

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "devmux terminal session agent")]
pub struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/devmux/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the Unix socket.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Real directory that clients see as `/`.
    #[arg(long)]
    pub sandbox_root: Option<PathBuf>,

    /// Program spawned for each session.
    #[arg(long)]
    pub shell: Option<String>,

    /// Per-stream notification queue bound.
    #[arg(long)]
    pub sink_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub socket_path: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub sandbox_root: Option<PathBuf>,
    pub shell: Option<String>,
    pub shell_args: Option<Vec<String>>,
    pub sink_capacity: Option<usize>,
    pub outbound_queue: Option<usize>,
    pub scrollback_chunks: Option<usize>,
    pub read_only_uids: Option<Vec<u32>>,
}

impl FileConfig {
    /// Read `path`. A missing file is only an error when it was asked for
    /// explicitly.
    pub fn read(path: &Path, required: bool) -> Result<Self> {
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    pub sandbox_root: PathBuf,
    pub shell: String,
    pub shell_args: Vec<String>,
    pub sink_capacity: usize,
    pub outbound_queue: usize,
    pub scrollback_chunks: usize,
    pub read_only_uids: Vec<u32>,
}

impl AgentConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let defaults = DefaultLocations::from_env();
        let file = match &cli.config {
            Some(path) => FileConfig::read(path, true)?,
            None => FileConfig::read(&defaults.config_file(), false)?,
        };
        Self::merge(cli, file, &defaults)
    }

    /// Defaults, overridden by the file, overridden by flags.
    pub fn merge(cli: &Cli, file: FileConfig, defaults: &DefaultLocations) -> Result<Self> {
        let config = Self {
            socket_path: cli
                .socket
                .clone()
                .or(file.socket_path)
                .unwrap_or_else(|| defaults.socket()),
            pid_file: cli
                .pid_file
                .clone()
                .or(file.pid_file)
                .unwrap_or_else(|| defaults.pid_file()),
            sandbox_root: cli
                .sandbox_root
                .clone()
                .or(file.sandbox_root)
                .unwrap_or_else(|| defaults.sandbox_root()),
            shell: cli.shell.clone().or(file.shell).unwrap_or_else(default_shell),
            shell_args: file.shell_args.unwrap_or_default(),
            sink_capacity: cli
                .sink_capacity
                .or(file.sink_capacity)
                .unwrap_or(DEFAULT_SINK_CAPACITY),
            outbound_queue: file.outbound_queue.unwrap_or(DEFAULT_OUTBOUND_QUEUE),
            scrollback_chunks: file.scrollback_chunks.unwrap_or(DEFAULT_SCROLLBACK_CHUNKS),
            read_only_uids: file.read_only_uids.unwrap_or_default(),
        };

        if config.sink_capacity == 0 {
            bail!("sink_capacity must be at least 1");
        }
        if config.outbound_queue == 0 {
            bail!("outbound_queue must be at least 1");
        }
        if config.scrollback_chunks == 0 {
            bail!("scrollback_chunks must be at least 1");
        }
        Ok(config)
    }
}

/// Per-user places the agent falls back to when nothing is configured.
#[derive(Debug, Clone)]
pub struct DefaultLocations {
    runtime_dir: Option<PathBuf>,
    config_home: Option<PathBuf>,
    home: Option<PathBuf>,
    uid: u32,
}

impl DefaultLocations {
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var_os(name)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        };
        Self {
            runtime_dir: var("XDG_RUNTIME_DIR"),
            config_home: var("XDG_CONFIG_HOME"),
            home: var("HOME"),
            uid: Uid::effective().as_raw(),
        }
    }

    /// `$XDG_RUNTIME_DIR/devmux.sock`, or a uid-scoped name in `/tmp`.
    pub fn socket(&self) -> PathBuf {
        match &self.runtime_dir {
            Some(dir) => dir.join("devmux.sock"),
            None => PathBuf::from(format!("/tmp/devmux-{}.sock", self.uid)),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config_home {
            dir.join("devmux")
        } else if let Some(home) = &self.home {
            home.join(".config").join("devmux")
        } else {
            PathBuf::from(format!("/tmp/devmux-{}", self.uid))
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir().join("devmux.pid")
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir().join("config.toml")
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.home.clone().unwrap_or_else(|| PathBuf::from("/"))
    }
}
