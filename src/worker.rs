//! Dedicated capture thread.
//!
//! The worker owns the camera backend for its whole life: the backend is built
//! inside the thread and never leaves it, so the blocking dequeue happens here
//! and nowhere else. Requests come in over a channel; replies go out through a
//! [`ReplyMailbox`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::{CameraError, Result};
use crate::mailbox::ReplyMailbox;
use crate::protocol::{CommandKind, CommandToken, ReplyData, ReplyRecord};
use crate::snapshot::SnapshotWriter;
use crate::traits::CameraBackend;

/// How long `shutdown` waits for the thread before leaving it detached.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Device work the capture thread can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Capture one frame and write it to disk.
    Snapshot,
    /// Read the frame rate from the hardware.
    QueryFrameRate,
}

enum Message {
    Run {
        token: CommandToken,
        kind: CommandKind,
        operation: Operation,
    },
    Close,
}

/// Handle to the capture thread.
pub struct CaptureWorker {
    commands: Sender<Message>,
    mailbox: Arc<ReplyMailbox>,
    thread: Option<JoinHandle<()>>,
    // Disconnects when the thread exits.
    done: Receiver<()>,
    shutdown_grace: Duration,
}

impl CaptureWorker {
    /// Start the capture thread and build the backend on it.
    ///
    /// Returns once the backend is up; a setup failure is returned here and
    /// the thread is gone by the time this returns.
    pub fn spawn<B, F>(factory: F, writer: SnapshotWriter) -> Result<Self>
    where
        B: CameraBackend,
        F: FnOnce() -> Result<B> + Send + 'static,
    {
        let (commands, inbox) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let mailbox = Arc::new(ReplyMailbox::new());

        let thread = thread::Builder::new().name("capture-worker".to_owned()).spawn({
            let mailbox = Arc::clone(&mailbox);
            move || {
                let _done = done_tx;
                let backend = match factory() {
                    Ok(backend) => backend,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run(backend, writer, &inbox, &mailbox);
            }
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                mailbox,
                thread: Some(thread),
                done,
                shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            }),
            Ok(Err(err)) => {
                join(thread);
                Err(err)
            }
            Err(_) => {
                join(thread);
                Err(CameraError::WorkerGone)
            }
        }
    }

    /// Bound how long `shutdown` waits for an in-flight operation.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Mailbox the worker posts replies into.
    pub fn mailbox(&self) -> &Arc<ReplyMailbox> {
        &self.mailbox
    }

    /// Whether the capture thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Ask the worker to perform `operation`; the reply arrives in the mailbox.
    pub fn dispatch(
        &self,
        token: CommandToken,
        kind: CommandKind,
        operation: Operation,
    ) -> Result<()> {
        if !self.is_running() || self.mailbox.is_closed() {
            return Err(CameraError::WorkerGone);
        }
        self.commands
            .send(Message::Run {
                token,
                kind,
                operation,
            })
            .map_err(|_| CameraError::WorkerGone)
    }

    /// Stop the thread, closing the backend. Idempotent.
    ///
    /// Waits at most the shutdown grace for an operation already running on
    /// the thread. A thread still blocked after that is left detached; it
    /// closes its backend once the operation returns.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.commands.send(Message::Close);
        self.mailbox.close();

        match self.done.recv_timeout(self.shutdown_grace) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(grace = ?self.shutdown_grace, "capture worker still busy, detaching");
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => join(thread),
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        warn!("capture worker panicked");
    }
}

fn run<B: CameraBackend>(
    mut backend: B,
    mut writer: SnapshotWriter,
    inbox: &Receiver<Message>,
    mailbox: &ReplyMailbox,
) {
    info!("capture worker started");

    for message in inbox {
        let Message::Run {
            token,
            kind,
            operation,
        } = message
        else {
            break;
        };

        debug!(%token, %kind, "running command");
        let outcome = match operation {
            Operation::Snapshot => backend
                .capture_one()
                .and_then(|frame| writer.write(&frame))
                .map(ReplyData::Snapshot),
            Operation::QueryFrameRate => backend.query_frame_rate().map(ReplyData::FrameRate),
        };
        if let Err(err) = &outcome {
            warn!(%token, %kind, error = %err, "command failed");
        }

        if !mailbox.post(ReplyRecord {
            token,
            kind,
            outcome,
        }) {
            debug!(%token, "mailbox closed, reply dropped");
            break;
        }
    }

    backend.close();
    info!("capture worker stopped");
}
