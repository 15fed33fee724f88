use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::net::{InputUpdate, Snapshot};

#[derive(Debug, Default)]
struct SnapshotState {
    latest: Option<Snapshot>,
    last_accepted: Option<u32>,
}

/// Holds the newest snapshot until the simulation thread takes it. Anything
/// not strictly newer than the last accepted snapshot is dropped, so
/// reordered datagrams never move the world backwards.
#[derive(Debug, Default)]
pub struct SnapshotSlot {
    inner: Mutex<SnapshotState>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SnapshotState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `snapshot` if it is newer than every snapshot offered before.
    pub fn offer(&self, snapshot: Snapshot) -> bool {
        let mut state = self.lock();
        if state
            .last_accepted
            .is_some_and(|last| snapshot.server_time <= last)
        {
            return false;
        }
        state.last_accepted = Some(snapshot.server_time);
        state.latest = Some(snapshot);
        true
    }

    pub fn take(&self) -> Option<Snapshot> {
        self.lock().latest.take()
    }

    pub fn last_accepted(&self) -> Option<u32> {
        self.lock().last_accepted
    }
}

/// Latest input waiting for the datagram thread. A newer input replaces an
/// unsent one, except that a pending jump is kept.
#[derive(Debug, Default)]
pub struct InputSlot {
    pending: Mutex<Option<InputUpdate>>,
}

impl InputSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, mut input: InputUpdate) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_some_and(|unsent| unsent.jump) {
            input.jump = true;
        }
        *pending = Some(input);
    }

    pub fn take(&self) -> Option<InputUpdate> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
