//! Plugin child processes.
//!
//! The manager talks to processes through [`ProcessLauncher`] and
//! [`PluginProcess`]; output lines and exits come back as [`ProcessEvent`]s
//! on a channel the manager owns.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Everything needed to launch one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub plugin: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output {
        plugin: String,
        stream: OutputStream,
        line: String,
    },
    Exited {
        plugin: String,
        pid: u32,
        code: Option<i32>,
    },
    /// The process could not be waited on; it has been killed.
    Failed {
        plugin: String,
        pid: u32,
        error: String,
    },
}

pub trait PluginProcess: Send + Sync {
    fn pid(&self) -> u32;
    /// Ask the process to stop (SIGTERM where available).
    fn terminate(&self);
    /// Stop the process immediately.
    fn kill(&self);
}

pub trait ProcessLauncher: Send + Sync {
    fn spawn(
        &self,
        spec: SpawnSpec,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Box<dyn PluginProcess>>;
}

/// Launches plugins as OS child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLauncher;

impl ProcessLauncher for NativeLauncher {
    fn spawn(
        &self,
        spec: SpawnSpec,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<Box<dyn PluginProcess>> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.program.display()))?;

        let pid = child
            .id()
            .context("Spawned plugin process has no pid")?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(
                spec.plugin.clone(),
                OutputStream::Stdout,
                stdout,
                events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(
                spec.plugin.clone(),
                OutputStream::Stderr,
                stderr,
                events.clone(),
            ));
        }

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_child(spec.plugin, pid, child, kill_rx, events));

        Ok(Box::new(NativeProcess { pid, kill_tx }))
    }
}

struct NativeProcess {
    pid: u32,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl PluginProcess for NativeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(&self) {
        #[cfg(unix)]
        {
            debug!(pid = self.pid, "Sending SIGTERM");
            // SAFETY: kill(2) with a pid we spawned and a valid signal number.
            unsafe {
                libc_kill(self.pid as i32, SIGTERM);
            }
        }
        #[cfg(not(unix))]
        self.kill();
    }

    fn kill(&self) {
        let _ = self.kill_tx.send(());
    }
}

#[cfg(unix)]
const SIGTERM: i32 = 15;

#[cfg(unix)]
unsafe extern "C" {
    #[link_name = "kill"]
    fn libc_kill(pid: i32, sig: i32) -> i32;
}

async fn pump_lines<R>(
    plugin: String,
    stream: OutputStream,
    reader: R,
    events: mpsc::UnboundedSender<ProcessEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let event = ProcessEvent::Output {
                    plugin: plugin.clone(),
                    stream,
                    line,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %plugin, error = %e, "Output stream closed");
                break;
            }
        }
    }
}

async fn watch_child(
    plugin: String,
    pid: u32,
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut handle_alive = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv(), if handle_alive => match request {
                Some(()) => {
                    debug!(plugin = %plugin, pid, "Killing plugin process");
                    if let Err(e) = child.start_kill() {
                        warn!(plugin = %plugin, pid, error = %e, "Failed to kill plugin process");
                    }
                }
                None => handle_alive = false,
            },
        }
    };

    let event = match status {
        Ok(status) => ProcessEvent::Exited {
            plugin,
            pid,
            code: status.code(),
        },
        Err(e) => {
            let _ = child.start_kill();
            ProcessEvent::Failed {
                plugin,
                pid,
                error: e.to_string(),
            }
        }
    };
    let _ = events.send(event);
}
