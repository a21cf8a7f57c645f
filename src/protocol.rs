//! Single-flight command protocol on top of the capture worker.
//!
//! ```text
//! Idle --submit--> Armed --tick--> AwaitingReply --tick (reply ready)--> Idle
//! ```
//!
//! `tick` never blocks: device work runs on the [`CaptureWorker`] thread and
//! comes back through its reply mailbox, correlated by [`CommandToken`].

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{CameraError, Result};
use crate::mailbox::Taken;
use crate::snapshot::SnapshotInfo;
use crate::worker::{CaptureWorker, Operation};

/// Commands understood by the protocol, with their wire identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    /// Capture a frame and store it.
    Snapshot = 0x01,
    /// Set the frame rate (local, immediate).
    SetFrameRate = 0x02,
    /// Read the frame rate from the hardware.
    GetFrameRate = 0x03,
}

impl CommandKind {
    /// Wire identifier.
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Human readable name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::SetFrameRate => "set-frame-rate",
            Self::GetFrameRate => "get-frame-rate",
        }
    }
}

impl TryFrom<u8> for CommandKind {
    type Error = CameraError;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::Snapshot),
            0x02 => Ok(Self::SetFrameRate),
            0x03 => Ok(Self::GetFrameRate),
            other => Err(CameraError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters that can be dumped by identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParameterId {
    /// Current frame rate in frames per second.
    FrameRate = 0x01,
}

impl ParameterId {
    /// Every known parameter.
    pub const ALL: [Self; 1] = [Self::FrameRate];

    /// Wire identifier.
    pub const fn id(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ParameterId {
    type Error = CameraError;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::FrameRate),
            other => Err(CameraError::UnknownParameter(other)),
        }
    }
}

/// Correlates a submitted command with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandToken(pub u64);

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Successful command output.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyData {
    /// A snapshot was written.
    Snapshot(SnapshotInfo),
    /// Frame rate in frames per second.
    FrameRate(f64),
}

impl ReplyData {
    /// The written snapshot, if this is a snapshot reply.
    pub const fn as_snapshot(&self) -> Option<&SnapshotInfo> {
        match self {
            Self::Snapshot(info) => Some(info),
            Self::FrameRate(_) => None,
        }
    }
}

/// Reply handed from the worker to the protocol.
#[derive(Debug)]
pub struct ReplyRecord {
    /// Command the reply belongs to.
    pub token: CommandToken,
    /// Kind of that command.
    pub kind: CommandKind,
    /// What happened.
    pub outcome: Result<ReplyData>,
}

/// Terminal result of a command.
#[derive(Debug)]
pub struct CommandResult {
    /// Command the result belongs to.
    pub token: CommandToken,
    /// Kind of that command.
    pub kind: CommandKind,
    /// What happened.
    pub outcome: Result<ReplyData>,
}

impl CommandResult {
    /// Whether the command succeeded.
    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// `0` on success, the error's code otherwise.
    pub const fn code(&self) -> u8 {
        match &self.outcome {
            Ok(_) => 0,
            Err(err) => err.code(),
        }
    }
}

impl From<ReplyRecord> for CommandResult {
    fn from(record: ReplyRecord) -> Self {
        Self {
            token: record.token,
            kind: record.kind,
            outcome: record.outcome,
        }
    }
}

/// The one command allowed in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingCommand {
    /// Correlation token.
    pub token: CommandToken,
    /// Command kind.
    pub kind: CommandKind,
    /// Decoded `SetFrameRate` payload.
    pub requested_frame_rate: Option<f64>,
}

/// Where the protocol is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Ready for a command.
    Idle,
    /// A command was accepted and waits for the next tick.
    Armed,
    /// The command was issued; waiting for its reply.
    AwaitingReply,
}

/// Receives terminal command results.
pub trait ResultSink {
    /// Forward one result.
    fn publish(&mut self, result: &CommandResult);
}

/// Publishes results as log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn publish(&mut self, result: &CommandResult) {
        match &result.outcome {
            Ok(ReplyData::Snapshot(snapshot)) => info!(
                token = %result.token,
                command = %result.kind,
                path = %snapshot.path.display(),
                bytes = snapshot.bytes,
                "command completed"
            ),
            Ok(ReplyData::FrameRate(rate)) => info!(
                token = %result.token,
                command = %result.kind,
                frame_rate = rate,
                "command completed"
            ),
            Err(err) => warn!(
                token = %result.token,
                command = %result.kind,
                code = result.code(),
                error = %err,
                "command failed"
            ),
        }
    }
}

/// Command state machine driving one capture worker.
pub struct CommandProtocol {
    worker: CaptureWorker,
    state: ProtocolState,
    pending: Option<PendingCommand>,
    next_token: u64,
    frame_rate: f64,
    closed: bool,
}

impl CommandProtocol {
    /// Drive `worker`, starting from `initial_frame_rate`.
    pub const fn new(worker: CaptureWorker, initial_frame_rate: f64) -> Self {
        Self {
            worker,
            state: ProtocolState::Idle,
            pending: None,
            next_token: 1,
            frame_rate: initial_frame_rate,
            closed: false,
        }
    }

    /// Current state.
    pub const fn state(&self) -> ProtocolState {
        self.state
    }

    /// The command in flight, if any.
    pub const fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    /// Last known frame rate.
    pub const fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    /// Accept a command. Only valid while `Idle`.
    ///
    /// `SetFrameRate` takes exactly eight bytes, a native-endian IEEE-754
    /// double; the other commands take none. A rejected submission leaves the
    /// state untouched.
    pub fn submit(&mut self, kind: CommandKind, payload: &[u8]) -> Result<CommandToken> {
        if self.closed {
            return Err(CameraError::WorkerGone);
        }
        if self.state != ProtocolState::Idle {
            return Err(CameraError::Busy);
        }
        let requested_frame_rate = decode_payload(kind, payload)?;

        let token = CommandToken(self.next_token);
        self.next_token += 1;
        self.pending = Some(PendingCommand {
            token,
            kind,
            requested_frame_rate,
        });
        self.state = ProtocolState::Armed;
        debug!(%token, command = %kind, "command armed");
        Ok(token)
    }

    /// Accept a command by wire identifier.
    pub fn submit_raw(&mut self, id: u8, payload: &[u8]) -> Result<CommandToken> {
        self.submit(CommandKind::try_from(id)?, payload)
    }

    /// Advance the state machine by one step. Never blocks.
    ///
    /// Returns the terminal result when the pending command completes.
    pub fn tick(&mut self) -> Option<CommandResult> {
        match self.state {
            ProtocolState::Idle => None,
            ProtocolState::Armed => self.issue(),
            ProtocolState::AwaitingReply => self.collect(),
        }
    }

    /// Value of a parameter by wire identifier.
    pub fn dump_parameter(&self, id: u8) -> Result<f64> {
        match ParameterId::try_from(id)? {
            ParameterId::FrameRate => Ok(self.frame_rate),
        }
    }

    /// Every parameter with its current value.
    pub fn dump_parameters(&self) -> Vec<(ParameterId, f64)> {
        ParameterId::ALL
            .iter()
            .map(|&id| match id {
                ParameterId::FrameRate => (id, self.frame_rate),
            })
            .collect()
    }

    /// Discard any pending command and stop the worker. Idempotent.
    pub fn close(&mut self) {
        if let Some(pending) = self.pending.take() {
            warn!(token = %pending.token, command = %pending.kind, "discarding pending command");
        }
        self.state = ProtocolState::Idle;
        self.worker.shutdown();
        self.closed = true;
    }

    fn issue(&mut self) -> Option<CommandResult> {
        let pending = self.pending?;

        while let Some(stale) = self.worker.mailbox().take() {
            warn!(token = %stale.token, command = %stale.kind, "dropping stale reply");
        }

        let dispatched = match pending.kind {
            CommandKind::SetFrameRate => {
                let rate = pending.requested_frame_rate.unwrap_or(self.frame_rate);
                self.frame_rate = rate;
                info!(frame_rate = rate, "frame rate set");
                let record = ReplyRecord {
                    token: pending.token,
                    kind: pending.kind,
                    outcome: Ok(ReplyData::FrameRate(rate)),
                };
                if self.worker.mailbox().try_post(record).is_err() {
                    // Slot raced with a late worker reply; retry next tick.
                    return None;
                }
                Ok(())
            }
            CommandKind::Snapshot => {
                self.worker
                    .dispatch(pending.token, pending.kind, Operation::Snapshot)
            }
            CommandKind::GetFrameRate => {
                self.worker
                    .dispatch(pending.token, pending.kind, Operation::QueryFrameRate)
            }
        };

        match dispatched {
            Ok(()) => {
                self.state = ProtocolState::AwaitingReply;
                debug!(token = %pending.token, command = %pending.kind, "command issued");
                None
            }
            Err(err) => Some(self.finish(CommandResult {
                token: pending.token,
                kind: pending.kind,
                outcome: Err(err),
            })),
        }
    }

    fn collect(&mut self) -> Option<CommandResult> {
        let pending = self.pending?;

        match self.worker.mailbox().take_matching(pending.token) {
            Taken::Matched(record) => {
                if let (CommandKind::GetFrameRate, Ok(ReplyData::FrameRate(rate))) =
                    (record.kind, &record.outcome)
                {
                    self.frame_rate = *rate;
                }
                Some(self.finish(record.into()))
            }
            Taken::Stale(record) => {
                warn!(token = %record.token, expected = %pending.token, "dropping stale reply");
                None
            }
            Taken::Empty if !self.worker.is_running() => {
                Some(self.finish(CommandResult {
                    token: pending.token,
                    kind: pending.kind,
                    outcome: Err(CameraError::WorkerGone),
                }))
            }
            Taken::Empty => None,
        }
    }

    fn finish(&mut self, result: CommandResult) -> CommandResult {
        self.pending = None;
        self.state = ProtocolState::Idle;
        debug!(token = %result.token, code = result.code(), "command finished");
        result
    }
}

impl Drop for CommandProtocol {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_payload(kind: CommandKind, payload: &[u8]) -> Result<Option<f64>> {
    match kind {
        CommandKind::Snapshot | CommandKind::GetFrameRate => {
            if payload.is_empty() {
                Ok(None)
            } else {
                Err(CameraError::InvalidPayload {
                    command: kind.name(),
                    reason: format!("expected no payload, got {} bytes", payload.len()),
                })
            }
        }
        CommandKind::SetFrameRate => {
            let bytes = <[u8; 8]>::try_from(payload).map_err(|_| CameraError::InvalidPayload {
                command: kind.name(),
                reason: format!("expected 8 bytes, got {}", payload.len()),
            })?;
            let rate = f64::from_ne_bytes(bytes);
            if !rate.is_finite() || rate <= 0.0 {
                return Err(CameraError::InvalidPayload {
                    command: kind.name(),
                    reason: format!("frame rate must be positive and finite, got {rate}"),
                });
            }
            Ok(Some(rate))
        }
    }
}
