use std::f32::consts::TAU;

/// Movement intent for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Intent {
    pub velocity: [f32; 2],
    pub rotation: f32,
    pub jump: bool,
}

/// Seconds per lap of the bot's circle.
const LAP: f32 = 8.0;
const JUMP_EVERY: f32 = 3.0;

/// Where movement comes from when there is no keyboard.
pub enum InputSource {
    Idle,
    /// Walks in a circle and hops every few seconds.
    Bot { elapsed: f32, next_jump: f32 },
}

impl InputSource {
    pub fn bot() -> Self {
        InputSource::Bot {
            elapsed: 0.0,
            next_jump: JUMP_EVERY,
        }
    }

    pub fn next(&mut self, dt: f32) -> Intent {
        match self {
            InputSource::Idle => Intent::default(),
            InputSource::Bot { elapsed, next_jump } => {
                *elapsed += dt;
                let heading = (*elapsed / LAP).fract() * TAU;
                let jump = *elapsed >= *next_jump;
                if jump {
                    *next_jump += JUMP_EVERY;
                }
                Intent {
                    velocity: [heading.cos(), heading.sin()],
                    rotation: heading,
                    jump,
                }
            }
        }
    }
}

/// Lets at most one intent per network tick through. Intents from the frames
/// in between fold into the next send, so a jump between ticks survives.
pub struct InputPacer {
    period: f32,
    accumulator: f32,
    pending_jump: bool,
}

impl InputPacer {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            period: 1.0 / tick_rate.max(1) as f32,
            accumulator: 0.0,
            pending_jump: false,
        }
    }

    pub fn offer(&mut self, intent: Intent, dt: f32) -> Option<Intent> {
        self.accumulator += dt.min(0.25);
        self.pending_jump |= intent.jump;
        if self.accumulator < self.period {
            return None;
        }

        self.accumulator -= self.period;
        // Never owe more than one send after a slow frame.
        if self.accumulator >= self.period {
            self.accumulator = 0.0;
        }
        Some(Intent {
            jump: std::mem::take(&mut self.pending_jump),
            ..intent
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_stands_still() {
        let mut source = InputSource::Idle;
        assert_eq!(source.next(1.0), Intent::default());
    }

    #[test]
    fn test_bot_turns_and_jumps_periodically() {
        let mut source = InputSource::bot();
        let mut jumps = 0;
        let mut headings = Vec::new();
        for _ in 0..600 {
            let intent = source.next(1.0 / 60.0);
            jumps += intent.jump as u32;
            headings.push(intent.rotation);
        }

        // Ten seconds: jumps at 3, 6 and 9.
        assert_eq!(jumps, 3);
        assert!(headings.iter().any(|&h| h > 3.0));
    }

    #[test]
    fn test_pacer_sends_at_most_once_per_tick() {
        let mut source = InputSource::bot();
        let mut pacer = InputPacer::new(8);
        let dt = 1.0 / 60.0;

        let sends = (0..60)
            .filter_map(|_| pacer.offer(source.next(dt), dt))
            .count();
        assert!((7..=8).contains(&sends), "sends = {}", sends);
    }

    #[test]
    fn test_pacer_keeps_jump_from_skipped_frames() {
        let mut pacer = InputPacer::new(8);
        let jump = Intent {
            jump: true,
            ..Intent::default()
        };

        assert_eq!(pacer.offer(jump, 0.01), None);
        let sent = pacer.offer(Intent::default(), 0.2).unwrap();
        assert!(sent.jump);

        let next = pacer.offer(Intent::default(), 0.2).unwrap();
        assert!(!next.jump);
    }

    #[test]
    fn test_pacer_does_not_burst_after_a_stall() {
        let mut pacer = InputPacer::new(8);
        assert!(pacer.offer(Intent::default(), 5.0).is_some());
        assert!(pacer.offer(Intent::default(), 0.0).is_none());
    }
}
