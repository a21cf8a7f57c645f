//! Single-slot reply hand-off between the capture worker and the command loop.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::protocol::{CommandToken, ReplyRecord};

#[derive(Default)]
struct Slot {
    record: Option<ReplyRecord>,
    closed: bool,
}

/// Outcome of [`ReplyMailbox::take_matching`].
#[derive(Debug)]
pub enum Taken {
    /// The slot held the reply for the requested token.
    Matched(ReplyRecord),
    /// The slot held a reply for some other command. It has been removed.
    Stale(ReplyRecord),
    /// Nothing was waiting.
    Empty,
}

/// One reply slot guarded by a mutex.
///
/// A poster waits while the slot is full; the command loop drains it without
/// blocking. Closing wakes any waiting poster and refuses further posts.
#[derive(Default)]
pub struct ReplyMailbox {
    slot: Mutex<Slot>,
    emptied: Condvar,
}

impl ReplyMailbox {
    /// An empty, open mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `record`, waiting for the slot to be emptied first.
    ///
    /// Returns `false` if the mailbox was closed before the record could be stored.
    pub fn post(&self, record: ReplyRecord) -> bool {
        let mut slot = self.lock();
        while slot.record.is_some() && !slot.closed {
            slot = self
                .emptied
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if slot.closed {
            return false;
        }
        slot.record = Some(record);
        true
    }

    /// Store `record` only if the slot is free; hands it back otherwise.
    pub fn try_post(&self, record: ReplyRecord) -> Result<(), ReplyRecord> {
        let mut slot = self.lock();
        if slot.closed || slot.record.is_some() {
            return Err(record);
        }
        slot.record = Some(record);
        Ok(())
    }

    /// Remove whatever record is waiting.
    pub fn take(&self) -> Option<ReplyRecord> {
        let record = self.lock().record.take();
        if record.is_some() {
            self.emptied.notify_all();
        }
        record
    }

    /// Remove the waiting record, classifying it against `token`.
    pub fn take_matching(&self, token: CommandToken) -> Taken {
        match self.take() {
            Some(record) if record.token == token => Taken::Matched(record),
            Some(record) => Taken::Stale(record),
            None => Taken::Empty,
        }
    }

    /// Whether a record is waiting.
    pub fn is_ready(&self) -> bool {
        self.lock().record.is_some()
    }

    /// Refuse further posts and wake any waiting poster.
    pub fn close(&self) {
        self.lock().closed = true;
        self.emptied.notify_all();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
