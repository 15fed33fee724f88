use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tandem::server::TickSchedule;
use tandem::{ServerWorld, SimulationBackend};

/// Drives the authoritative world from the main thread. Each frame feeds the
/// real elapsed time to the world's fixed-step accumulator.
pub struct SimulationLoop<B> {
    world: Arc<Mutex<ServerWorld<B>>>,
    schedule: TickSchedule,
    last_frame: Instant,
}

impl<B: SimulationBackend> SimulationLoop<B> {
    pub fn new(world: Arc<Mutex<ServerWorld<B>>>, frame_rate: u32) -> Self {
        let now = Instant::now();
        Self {
            world,
            schedule: TickSchedule::from_rate(frame_rate, now),
            last_frame: now,
        }
    }

    fn world(&self) -> MutexGuard<'_, ServerWorld<B>> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one frame if it is due. Returns the physics steps taken.
    pub fn poll(&mut self) -> u32 {
        let now = Instant::now();
        if !self.schedule.poll(now) {
            return 0;
        }
        let elapsed = now - self.last_frame;
        self.last_frame = now;
        self.world().update(elapsed.as_secs_f32())
    }

    pub fn until_next_frame(&self) -> Duration {
        self.schedule.timeout(Instant::now())
    }

    pub fn player_count(&self) -> usize {
        self.world().player_count()
    }
}
