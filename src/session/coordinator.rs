//! Hands room snapshots to the execution sandbox and tracks the run.
//!
//! A run is: mount the snapshot, install dependencies when the manifest is
//! present, start the app, then report readiness and exit back to the room.
//! Starting a run terminates the previous one before anything is mounted.
//! Failures only degrade the preview; they never touch chat or editing.

use devroom_common::FileTree;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

use super::registry::RoomRegistry;
use super::room::{RunTicket, RunUpdate, SessionRoom};
use super::sandbox::{ExecutionSandbox, ProcessEvent, RunControl};
use crate::config::SandboxSection;
use crate::errors::{SandboxError, SessionError};

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub manifest: String,
    pub install: Vec<String>,
    pub start: Vec<String>,
    pub install_timeout: Duration,
    pub ready_timeout: Duration,
}

impl From<&SandboxSection> for RunSettings {
    fn from(section: &SandboxSection) -> Self {
        Self {
            manifest: section.manifest.clone(),
            install: section.install.clone(),
            start: section.start.clone(),
            install_timeout: Duration::from_secs(section.install_timeout_secs),
            ready_timeout: Duration::from_secs(section.ready_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStarted {
    pub run_id: u64,
    /// A live run was terminated to make way for this one.
    pub replaced: bool,
}

pub struct SandboxCoordinator {
    registry: Arc<RoomRegistry>,
    sandbox: Arc<dyn ExecutionSandbox>,
    settings: RunSettings,
}

impl SandboxCoordinator {
    pub fn new(
        registry: Arc<RoomRegistry>,
        sandbox: Arc<dyn ExecutionSandbox>,
        settings: RunSettings,
    ) -> Self {
        Self {
            registry,
            sandbox,
            settings,
        }
    }

    pub async fn run(
        &self,
        project_id: &str,
        requested_by: &str,
    ) -> Result<RunStarted, SessionError> {
        let room = self.registry.get(project_id)?;
        let RunTicket {
            run_id,
            control,
            driver,
            snapshot,
            previous,
        } = room.begin_run(requested_by).await?;

        let replaced = match previous {
            Some(previous) => {
                previous.terminate().await;
                true
            }
            None => false,
        };

        tokio::spawn(drive_run(
            room,
            self.sandbox.clone(),
            self.settings.clone(),
            run_id,
            control,
            driver,
            snapshot,
        ));
        Ok(RunStarted { run_id, replaced })
    }

    /// Terminate the live run, if any.
    pub async fn stop(&self, project_id: &str) -> Result<bool, SessionError> {
        let room = self.registry.get(project_id)?;
        match room.stop_run().await? {
            Some(control) => {
                control.terminate().await;
                info!(project_id, "Sandbox run stopped");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn drive_run(
    room: Arc<SessionRoom>,
    sandbox: Arc<dyn ExecutionSandbox>,
    settings: RunSettings,
    run_id: u64,
    control: RunControl,
    _driver: DropGuard,
    snapshot: FileTree,
) {
    let project_id = room.project_id().to_string();
    // a mount is never abandoned halfway; the next run clears the workspace
    // only after this task is gone
    let outcome = match sandbox.mount(&project_id, &snapshot).await {
        Err(e) => Err(e),
        Ok(()) if control.is_cancelled() => {
            debug!(%project_id, run_id, "Run cancelled after mount");
            return;
        }
        Ok(()) => tokio::select! {
            _ = control.cancelled() => {
                debug!(%project_id, run_id, "Run cancelled");
                return;
            }
            outcome = execute(&room, sandbox.as_ref(), &settings, run_id, &control, &snapshot) => outcome,
        },
    };

    match outcome {
        Ok(()) => {}
        Err(SandboxError::Superseded) => debug!(%project_id, run_id, "Run superseded"),
        Err(e) => {
            warn!(%project_id, run_id, error = %e, "Sandbox run failed");
            if let Some(mut process) = control.detach().await
                && let Err(kill_err) = process.terminate().await
            {
                warn!(%project_id, run_id, error = %kill_err, "Failed to stop process after failure");
            }
            let error = SessionError::from(e).to_string();
            room.update_run(run_id, RunUpdate::Failed { error }).await;
        }
    }
}

async fn execute(
    room: &SessionRoom,
    sandbox: &dyn ExecutionSandbox,
    settings: &RunSettings,
    run_id: u64,
    control: &RunControl,
    snapshot: &FileTree,
) -> Result<(), SandboxError> {
    let project_id = room.project_id();

    if snapshot.file_contents(&settings.manifest).is_some() {
        room.update_run(run_id, RunUpdate::Installing).await;
        let (program, args) = split_command(&settings.install)?;
        let mut install = sandbox.spawn(project_id, program, args).await?;
        let mut events = install.take_events().ok_or(SandboxError::EventsTaken)?;
        control.attach(install).await?;

        let code = tokio::time::timeout(
            settings.install_timeout,
            forward_until_exit(room, run_id, &mut events),
        )
        .await
        .map_err(|_| SandboxError::Timeout {
            what: format!("'{}' to finish", settings.install.join(" ")),
            secs: settings.install_timeout.as_secs(),
        })?;
        control.detach().await;

        if code != Some(0) {
            return Err(SandboxError::NonZeroExit {
                command: settings.install.join(" "),
                code,
            });
        }
        info!(project_id, run_id, "Dependencies installed");
    }

    let (program, args) = split_command(&settings.start)?;
    let mut start = sandbox.spawn(project_id, program, args).await?;
    let mut events = start.take_events().ok_or(SandboxError::EventsTaken)?;
    control.attach(start).await?;
    room.update_run(run_id, RunUpdate::Running).await;

    let deadline = tokio::time::sleep(settings.ready_timeout);
    tokio::pin!(deadline);
    let mut ready = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ProcessEvent::Output(line)) => room.run_output(run_id, line).await,
                Some(ProcessEvent::ServerReady { port, url }) => {
                    ready = true;
                    info!(project_id, run_id, port, %url, "Preview ready");
                    room.update_run(run_id, RunUpdate::Ready { url }).await;
                }
                Some(ProcessEvent::Exited { code }) => {
                    control.detach().await;
                    room.update_run(run_id, RunUpdate::Exited { code }).await;
                    return Ok(());
                }
                None => {
                    control.detach().await;
                    room.update_run(run_id, RunUpdate::Exited { code: None }).await;
                    return Ok(());
                }
            },
            _ = &mut deadline, if !ready => {
                return Err(SandboxError::Timeout {
                    what: format!("'{}' to accept connections", settings.start.join(" ")),
                    secs: settings.ready_timeout.as_secs(),
                });
            }
        }
    }
}

/// Relay output until the process exits; returns its exit code.
async fn forward_until_exit(
    room: &SessionRoom,
    run_id: u64,
    events: &mut mpsc::Receiver<ProcessEvent>,
) -> Option<i32> {
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Output(line) => room.run_output(run_id, line).await,
            ProcessEvent::ServerReady { .. } => {}
            ProcessEvent::Exited { code } => return code,
        }
    }
    None
}

fn split_command(command: &[String]) -> Result<(&str, &[String]), SandboxError> {
    command
        .split_first()
        .map(|(program, args)| (program.as_str(), args))
        .ok_or_else(|| SandboxError::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })
}
