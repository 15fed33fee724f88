use std::time::{Duration, Instant};

use crate::net::TimeRequest;

/// Replies needed before the clock counts as synchronized.
pub const SYNC_SAMPLES: u32 = 10;
pub const PROBE_INTERVAL: Duration = Duration::from_millis(300);

/// Milliseconds elapsed since the clock was created. Wraps after ~49 days.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockState {
    /// Server time minus local time, in milliseconds.
    pub offset: i64,
    pub best_latency: Option<u32>,
    pub sample_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Lowest latency so far; the offset moved.
    Adopted { latency: u32 },
    /// Counted toward the threshold, offset unchanged.
    Counted { latency: u32 },
    /// Echoed time lies in the local future.
    Rejected,
    AlreadySynced,
}

/// Client side of round-trip time synchronization. Times passed in are
/// readings of the local [`MonotonicClock`].
#[derive(Debug, Clone)]
pub struct ClockSync {
    state: ClockState,
    required_samples: u32,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSync {
    pub fn new() -> Self {
        Self::with_samples(SYNC_SAMPLES)
    }

    pub fn with_samples(required_samples: u32) -> Self {
        Self {
            state: ClockState::default(),
            required_samples,
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state.sample_count >= self.required_samples
    }

    /// The next probe to send, or `None` once synchronized.
    pub fn probe(&self, local_now: u32) -> Option<TimeRequest> {
        (!self.is_synced()).then_some(TimeRequest {
            client_time: local_now,
            server_time: 0,
        })
    }

    pub fn on_reply(&mut self, reply: &TimeRequest, local_now: u32) -> SampleOutcome {
        if self.is_synced() {
            return SampleOutcome::AlreadySynced;
        }
        let Some(round_trip) = local_now.checked_sub(reply.client_time) else {
            return SampleOutcome::Rejected;
        };

        let latency = round_trip / 2;
        self.state.sample_count += 1;

        if self.state.best_latency.is_some_and(|best| latency >= best) {
            return SampleOutcome::Counted { latency };
        }

        self.state.offset = reply.server_time as i64 + latency as i64 - local_now as i64;
        self.state.best_latency = Some(latency);
        SampleOutcome::Adopted { latency }
    }

    /// Estimated server time at local time `local_now`.
    pub fn current_time(&self, local_now: u32) -> u32 {
        (local_now as i64 + self.state.offset) as u32
    }
}
