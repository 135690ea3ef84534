//! Per-room write-behind queue.
//!
//! Rooms commit state in memory and enqueue the write here; a single writer
//! task per room drains the queue in order, so persistence never blocks a
//! broadcast and writes for one room never race each other.

use devroom_common::{FileTree, Message, RoomEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::persistence::PersistenceAdapter;
use super::transport::{Outbound, publish};
use crate::errors::DeliveryExhausted;

/// Most jobs folded into one writer pass.
const MAX_BATCH: usize = 32;

enum PersistJob {
    Message(Message),
    FileTree {
        tree: FileTree,
        version: u64,
        origin: String,
    },
    /// Retry the backlog and write `tree` unless `version` is already stored.
    Flush { tree: FileTree, version: u64 },
    Barrier(oneshot::Sender<()>),
}

/// Handle for enqueueing writes on a room's writer task.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl Persister {
    pub fn spawn(
        project_id: &str,
        adapter: Arc<PersistenceAdapter>,
        topic: broadcast::Sender<Outbound>,
        backlog_cap: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Writer {
            project_id: project_id.to_string(),
            adapter,
            topic,
            backlog: VecDeque::new(),
            backlog_cap: backlog_cap.max(1),
            persisted_version: 0,
        };
        let handle = tokio::spawn(writer.run(rx));
        (Self { tx }, handle)
    }

    pub fn message(&self, message: Message) {
        self.enqueue(PersistJob::Message(message));
    }

    pub fn file_tree(&self, tree: FileTree, version: u64, origin: impl Into<String>) {
        self.enqueue(PersistJob::FileTree {
            tree,
            version,
            origin: origin.into(),
        });
    }

    pub fn flush(&self, tree: FileTree, version: u64) {
        self.enqueue(PersistJob::Flush { tree, version });
    }

    /// Queue a final flush and release this handle; the writer exits once
    /// every other handle is gone and the queue is drained.
    pub fn close(self, tree: FileTree, version: u64) {
        self.flush(tree, version);
    }

    /// Wait until every job queued before this call has been processed.
    pub async fn sync(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(PersistJob::Barrier(tx));
        let _ = rx.await;
    }

    fn enqueue(&self, job: PersistJob) {
        if self.tx.send(job).is_err() {
            warn!("Persistence writer is gone; dropping write");
        }
    }
}

struct Writer {
    project_id: String,
    adapter: Arc<PersistenceAdapter>,
    topic: broadcast::Sender<Outbound>,
    /// Messages whose every save route failed, oldest first.
    backlog: VecDeque<Message>,
    backlog_cap: usize,
    persisted_version: u64,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PersistJob>) {
        let mut batch = Vec::new();
        loop {
            match rx.recv().await {
                Some(job) => batch.push(job),
                None => break,
            }
            while batch.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(job) => batch.push(job),
                    Err(_) => break,
                }
            }

            let newest_tree = batch
                .iter()
                .filter_map(|job| match job {
                    PersistJob::FileTree { version, .. } => Some(*version),
                    _ => None,
                })
                .max();

            for job in batch.drain(..) {
                self.process(job, newest_tree).await;
            }
        }

        if !self.backlog.is_empty() {
            warn!(
                project_id = %self.project_id,
                lost = self.backlog.len(),
                "Writer stopped with unsaved messages"
            );
        }
        debug!(project_id = %self.project_id, "Persistence writer finished");
    }

    async fn process(&mut self, job: PersistJob, newest_tree: Option<u64>) {
        match job {
            PersistJob::Message(message) => {
                // an older message still stuck in the backlog must land first
                let saved = match self.retry_backlog().await {
                    Ok(()) => self.adapter.save_message(&message).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = saved {
                    self.report_degraded(message.sender.id(), &e);
                    self.push_backlog(message);
                }
            }
            PersistJob::FileTree {
                tree,
                version,
                origin,
            } => {
                if newest_tree.is_some_and(|newest| version < newest) {
                    debug!(project_id = %self.project_id, version, "Skipping superseded file tree");
                    return;
                }
                self.write_tree(&tree, version, Some(&origin)).await;
            }
            PersistJob::Flush { tree, version } => {
                let _ = self.retry_backlog().await;
                if version > self.persisted_version {
                    self.write_tree(&tree, version, None).await;
                }
                info!(
                    project_id = %self.project_id,
                    version,
                    backlog = self.backlog.len(),
                    "Room flushed"
                );
            }
            PersistJob::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn write_tree(&mut self, tree: &FileTree, version: u64, origin: Option<&str>) {
        match self.adapter.save_file_tree(&self.project_id, tree).await {
            Ok(_) => self.persisted_version = self.persisted_version.max(version),
            Err(e) => {
                if let Some(origin) = origin {
                    self.report_degraded(origin, &e);
                }
            }
        }
    }

    /// Re-attempt backlogged messages in order, stopping at the first one
    /// that still cannot be delivered.
    async fn retry_backlog(&mut self) -> Result<(), DeliveryExhausted> {
        while let Some(message) = self.backlog.pop_front() {
            if let Err(e) = self.adapter.save_message(&message).await {
                self.backlog.push_front(message);
                return Err(e);
            }
            debug!(project_id = %self.project_id, message_id = %message.id, "Backlogged message saved");
        }
        Ok(())
    }

    fn push_backlog(&mut self, message: Message) {
        if self.backlog.len() >= self.backlog_cap
            && let Some(dropped) = self.backlog.pop_front()
        {
            warn!(
                project_id = %self.project_id,
                message_id = %dropped.id,
                "Persistence backlog full; dropping oldest unsaved message"
            );
        }
        self.backlog.push_back(message);
    }

    fn report_degraded(&self, participant_id: &str, err: &DeliveryExhausted) {
        warn!(
            project_id = %self.project_id,
            participant = participant_id,
            operation = %err.operation,
            attempted = err.attempted,
            last_error = %err.last_error,
            "Delivery degraded"
        );
        publish(
            &self.topic,
            Outbound::to_participant(
                participant_id,
                RoomEvent::DeliveryDegraded {
                    operation: err.operation.clone(),
                    attempted: err.attempted,
                    last_error: err.last_error.clone(),
                },
            ),
        );
    }
}
