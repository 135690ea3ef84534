//! Execution sandbox seam and the local process implementation.
//!
//! A sandbox accepts a file-tree snapshot (`mount`) and runs commands against
//! it (`spawn`). Each spawned process reports through an event stream: output
//! lines, a readiness signal carrying the reachable URL, and its exit.

use async_trait::async_trait;
use devroom_common::{FileNode, FileTree};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::SandboxSection;
use crate::errors::SandboxError;

/// How long output readers may keep draining after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `terminate` waits for the process to be reaped.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(String),
    ServerReady { port: u16, url: String },
    Exited { code: Option<i32> },
}

#[async_trait]
pub trait SandboxProcess: Send {
    /// The process event stream. Can be taken once.
    fn take_events(&mut self) -> Option<mpsc::Receiver<ProcessEvent>>;

    async fn terminate(&mut self) -> Result<(), SandboxError>;
}

#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    async fn mount(&self, project_id: &str, tree: &FileTree) -> Result<(), SandboxError>;

    async fn spawn(
        &self,
        project_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<Box<dyn SandboxProcess>, SandboxError>;
}

// ── Run control ──────────────────────────────────────────────────────

/// Cancellation plus the process slot of one sandbox run.
///
/// Whoever terminates a run cancels the token first; a process attached after
/// that point is killed immediately instead of being stored. Once a driver
/// guard has been handed out, `terminate` also waits for that guard to drop,
/// so the next run never overlaps the workspace writes of this one.
#[derive(Clone, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    finished: CancellationToken,
    driven: Arc<AtomicBool>,
    process: Arc<Mutex<Option<Box<dyn SandboxProcess>>>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard held by the task driving this run; dropping it marks the run
    /// wound down.
    pub fn driver(&self) -> DropGuard {
        self.driven.store(true, Ordering::SeqCst);
        self.finished.clone().drop_guard()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub async fn attach(&self, mut process: Box<dyn SandboxProcess>) -> Result<(), SandboxError> {
        let mut slot = self.process.lock().await;
        if self.cancel.is_cancelled() {
            drop(slot);
            if let Err(e) = process.terminate().await {
                warn!(error = %e, "Failed to stop process of a superseded run");
            }
            return Err(SandboxError::Superseded);
        }
        if let Some(mut previous) = slot.replace(process)
            && let Err(e) = previous.terminate().await
        {
            warn!(error = %e, "Failed to stop replaced process");
        }
        Ok(())
    }

    /// Take the current process out of the slot without stopping it.
    pub async fn detach(&self) -> Option<Box<dyn SandboxProcess>> {
        self.process.lock().await.take()
    }

    /// Cancel the run, kill its process and wait for its driver to finish.
    /// Returns whether a process was live.
    pub async fn terminate(&self) -> bool {
        self.cancel.cancel();
        let process = self.process.lock().await.take();
        let killed = match process {
            Some(mut process) => {
                if let Err(e) = process.terminate().await {
                    warn!(error = %e, "Failed to terminate sandbox process");
                }
                true
            }
            None => false,
        };

        if self.driven.load(Ordering::SeqCst)
            && tokio::time::timeout(TERMINATE_TIMEOUT, self.finished.cancelled())
                .await
                .is_err()
        {
            warn!(
                timeout_secs = TERMINATE_TIMEOUT.as_secs(),
                "Sandbox run did not wind down in time"
            );
        }
        killed
    }
}

// ── Local process sandbox ────────────────────────────────────────────

/// Runs commands as local child processes inside per-project workspaces.
pub struct LocalSandbox {
    root: PathBuf,
    public_host: String,
    preserve: Vec<String>,
    probe_interval: Duration,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>, public_host: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_host: public_host.into(),
            preserve: Vec::new(),
            probe_interval: Duration::from_millis(100),
        }
    }

    pub fn from_config(section: &SandboxSection) -> Self {
        Self::new(&section.root, &section.public_host).with_preserved(section.preserve.clone())
    }

    /// Workspace entries kept across mounts, e.g. installed dependencies.
    pub fn with_preserved(mut self, names: Vec<String>) -> Self {
        self.preserve = names;
        self
    }

    pub fn workspace(&self, project_id: &str) -> Result<PathBuf, SandboxError> {
        FileTree::check_key(project_id)?;
        if project_id.contains(['/', '\\']) {
            return Err(devroom_common::PathError::Traversal(project_id.to_string()).into());
        }
        Ok(self.root.join(project_id))
    }

    async fn clear(&self, workspace: &Path) -> Result<(), SandboxError> {
        let io_err = |source| SandboxError::Workspace {
            path: workspace.to_path_buf(),
            source,
        };
        let mut entries = tokio::fs::read_dir(workspace).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            if self.preserve.iter().any(|keep| name == keep.as_str()) {
                continue;
            }
            let path = entry.path();
            let result = if entry.file_type().await.map_err(io_err)?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            result.map_err(|source| SandboxError::Workspace { path, source })?;
        }
        Ok(())
    }
}

enum MountEntry {
    Dir(PathBuf),
    File(PathBuf, String),
}

/// Flatten a tree into relative paths, rejecting keys that escape the root.
fn flatten(tree: &FileTree, prefix: &Path, out: &mut Vec<MountEntry>) -> Result<(), SandboxError> {
    for (key, node) in tree.iter() {
        FileTree::check_key(key)?;
        let path = prefix.join(key);
        match node {
            FileNode::File { contents } => out.push(MountEntry::File(path, contents.clone())),
            FileNode::Directory(sub) => {
                out.push(MountEntry::Dir(path.clone()));
                flatten(sub, &path, out)?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ExecutionSandbox for LocalSandbox {
    async fn mount(&self, project_id: &str, tree: &FileTree) -> Result<(), SandboxError> {
        let workspace = self.workspace(project_id)?;
        let mut entries = Vec::new();
        flatten(tree, Path::new(""), &mut entries)?;

        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|source| SandboxError::Workspace {
                path: workspace.clone(),
                source,
            })?;
        self.clear(&workspace).await?;

        for entry in entries {
            match entry {
                MountEntry::Dir(rel) => {
                    let path = workspace.join(rel);
                    tokio::fs::create_dir_all(&path)
                        .await
                        .map_err(|source| SandboxError::Workspace { path, source })?;
                }
                MountEntry::File(rel, contents) => {
                    let path = workspace.join(rel);
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await.map_err(|source| {
                            SandboxError::Workspace {
                                path: parent.to_path_buf(),
                                source,
                            }
                        })?;
                    }
                    tokio::fs::write(&path, contents)
                        .await
                        .map_err(|source| SandboxError::Workspace { path, source })?;
                }
            }
        }

        info!(project_id, files = tree.file_count(), workspace = %workspace.display(), "Workspace mounted");
        Ok(())
    }

    async fn spawn(
        &self,
        project_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<Box<dyn SandboxProcess>, SandboxError> {
        let workspace = self.workspace(project_id)?;
        let port = allocate_port().await.map_err(|source| SandboxError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let mut child = Command::new(command)
            .args(args)
            .current_dir(&workspace)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                command: command.to_string(),
                source,
            })?;
        info!(project_id, command, ?args, port, pid = child.id(), "Sandbox process spawned");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, tx.clone())));
        }

        let exited = CancellationToken::new();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let supervisor_tx = tx.clone();
        let supervisor_exited = exited.clone();
        let label = command.to_string();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                // fires on an explicit kill and when the handle is dropped
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(command = %label, error = %e, "Failed to kill sandbox process");
                    }
                    None
                }
            };
            for reader in readers {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
            }
            supervisor_exited.cancel();
            debug!(command = %label, ?code, "Sandbox process exited");
            let _ = supervisor_tx.send(ProcessEvent::Exited { code }).await;
        });

        let url = format!("http://{}:{}", self.public_host, port);
        tokio::spawn(probe_ready(port, url, tx, exited.clone(), self.probe_interval));

        Ok(Box::new(LocalProcess {
            events: Some(rx),
            kill: Some(kill_tx),
            exited,
        }))
    }
}

struct LocalProcess {
    events: Option<mpsc::Receiver<ProcessEvent>>,
    kill: Option<oneshot::Sender<()>>,
    exited: CancellationToken,
}

#[async_trait]
impl SandboxProcess for LocalProcess {
    fn take_events(&mut self) -> Option<mpsc::Receiver<ProcessEvent>> {
        self.events.take()
    }

    async fn terminate(&mut self) -> Result<(), SandboxError> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        tokio::time::timeout(TERMINATE_TIMEOUT, self.exited.cancelled())
            .await
            .map_err(|_| SandboxError::Timeout {
                what: "process exit".to_string(),
                secs: TERMINATE_TIMEOUT.as_secs(),
            })
    }
}

async fn allocate_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<ProcessEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        // keep draining the pipe even if nobody listens any more
        let _ = tx.send(ProcessEvent::Output(line)).await;
    }
}

/// Poll `port` until it accepts connections, then report readiness once.
async fn probe_ready(
    port: u16,
    url: String,
    tx: mpsc::Sender<ProcessEvent>,
    exited: CancellationToken,
    interval: Duration,
) {
    loop {
        if tx.is_closed() || exited.is_cancelled() {
            return;
        }
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            info!(port, %url, "Sandbox port is ready");
            let _ = tx.send(ProcessEvent::ServerReady { port, url }).await;
            return;
        }
        tokio::select! {
            _ = exited.cancelled() => return,
            _ = sleep(interval) => {}
        }
    }
}
