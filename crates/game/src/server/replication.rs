use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::net::{ChannelError, Message, PlayerId, SendStatus, Snapshot, UnreliableChannel};

/// Fixed-period deadlines. Each deadline is one period after the previous
/// one rather than after the moment it was noticed, so late wakeups do not
/// accumulate into drift. A loop that falls a whole period behind skips the
/// missed ticks instead of bursting through them.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    period: Duration,
    next: Instant,
}

impl TickSchedule {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: now + period,
        }
    }

    pub fn from_rate(tick_rate: u32, now: Instant) -> Self {
        Self::new(Duration::from_secs(1) / tick_rate.max(1), now)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// How long to wait before the next tick is due.
    pub fn timeout(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// True if a tick is due at `now`; advances to the following deadline.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next += self.period;
        if self.next <= now {
            self.next = now + self.period;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    /// `failed` lists players whose address the OS refused.
    Published {
        recipients: usize,
        failed: Vec<PlayerId>,
    },
    /// The channel was not writable; this tick's snapshot is dropped.
    Skipped,
}

/// Sends one snapshot to every bound address. Nothing is buffered: if the
/// channel stops being writable partway, the remaining recipients miss this
/// tick. A refused destination only costs that player its snapshot.
pub fn replicate(
    channel: &mut UnreliableChannel,
    snapshot: Snapshot,
    targets: &[(PlayerId, SocketAddr)],
) -> Result<Replication, ChannelError> {
    if !channel.is_writable() {
        return Ok(Replication::Skipped);
    }

    let frame = Message::PlayersUpdate(snapshot).encode()?;
    let mut recipients = 0;
    let mut failed = Vec::new();
    for &(player_id, address) in targets {
        match channel.send_to(&frame, address)? {
            SendStatus::Sent => recipients += 1,
            SendStatus::Failed => failed.push(player_id),
            SendStatus::Skipped => break,
        }
    }

    if recipients == 0 && failed.is_empty() && !targets.is_empty() {
        return Ok(Replication::Skipped);
    }
    Ok(Replication::Published { recipients, failed })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::net::{Datagram, NetworkStats, PlayerState};

    const PERIOD: Duration = Duration::from_millis(125);

    #[test]
    fn test_tick_due_only_after_period() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(PERIOD, start);

        assert!(!schedule.poll(start + Duration::from_millis(124)));
        assert_eq!(
            schedule.timeout(start + Duration::from_millis(100)),
            Duration::from_millis(25)
        );
        assert!(schedule.poll(start + PERIOD));
        assert!(!schedule.poll(start + PERIOD));
    }

    #[test]
    fn test_late_wakeups_do_not_drift() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(PERIOD, start);
        let mut now = start;
        let mut ticks = 0;

        // Each wait overshoots its timeout by up to 40ms.
        for i in 0..400u64 {
            now += schedule.timeout(now) + Duration::from_millis(i * 7 % 41);
            if schedule.poll(now) {
                ticks += 1;
            }
            if now >= start + Duration::from_secs(10) {
                break;
            }
        }

        // 10s at 8Hz is 80 ticks; at most one is still pending.
        assert!((79..=80).contains(&ticks), "ticks = {}", ticks);
    }

    #[test]
    fn test_stall_skips_missed_ticks() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(PERIOD, start);

        let after_stall = start + Duration::from_secs(1);
        assert!(schedule.poll(after_stall));
        assert!(!schedule.poll(after_stall));
        assert_eq!(schedule.timeout(after_stall), PERIOD);
    }

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot {
            server_time: 5_000,
            ..Snapshot::default()
        };
        snapshot.players.insert(0, PlayerState::default());
        snapshot
    }

    #[test]
    fn test_unwritable_channel_skips_tick() {
        let mut channel =
            UnreliableChannel::bind("127.0.0.1:0".parse().unwrap(), Arc::new(NetworkStats::new()))
                .unwrap();
        let target = channel.local_addr().unwrap();

        let outcome = replicate(&mut channel, snapshot(), &[(0, target)]).unwrap();
        assert_eq!(outcome, Replication::Skipped);
        assert_eq!(channel.stats().snapshot().messages_sent, 0);
    }

    #[test]
    fn test_snapshot_reaches_every_target() {
        let stats = Arc::new(NetworkStats::new());
        let mut server =
            UnreliableChannel::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&stats)).unwrap();
        server.set_writable(true);
        let mut first =
            UnreliableChannel::bind("127.0.0.1:0".parse().unwrap(), Arc::new(NetworkStats::new()))
                .unwrap();
        let mut second =
            UnreliableChannel::bind("127.0.0.1:0".parse().unwrap(), Arc::new(NetworkStats::new()))
                .unwrap();
        let targets = [
            (0, first.local_addr().unwrap()),
            (1, second.local_addr().unwrap()),
        ];

        let outcome = replicate(&mut server, snapshot(), &targets).unwrap();
        assert_eq!(
            outcome,
            Replication::Published {
                recipients: 2,
                failed: Vec::new(),
            }
        );

        for receiver in [&mut first, &mut second] {
            let start = Instant::now();
            let message = loop {
                match receiver.recv(Some).unwrap() {
                    Datagram::Received { message, .. } => break message,
                    _ if start.elapsed() > Duration::from_millis(500) => {
                        panic!("snapshot never arrived")
                    }
                    _ => std::thread::sleep(Duration::from_millis(1)),
                }
            };
            assert_eq!(message, Message::PlayersUpdate(snapshot()));
        }
    }

    #[test]
    fn test_refused_target_does_not_stop_the_rest() {
        let mut server =
            UnreliableChannel::bind("127.0.0.1:0".parse().unwrap(), Arc::new(NetworkStats::new()))
                .unwrap();
        server.set_writable(true);
        let mut good =
            UnreliableChannel::bind("127.0.0.1:0".parse().unwrap(), Arc::new(NetworkStats::new()))
                .unwrap();
        let targets = [
            (3, SocketAddr::from(([127, 0, 0, 1], 0))),
            (1, good.local_addr().unwrap()),
        ];

        let outcome = replicate(&mut server, snapshot(), &targets).unwrap();
        assert_eq!(
            outcome,
            Replication::Published {
                recipients: 1,
                failed: vec![3],
            }
        );
        assert_eq!(server.stats().snapshot().failed_sends, 1);

        let start = Instant::now();
        loop {
            match good.recv(Some).unwrap() {
                Datagram::Received { message, .. } => {
                    assert_eq!(message, Message::PlayersUpdate(snapshot()));
                    break;
                }
                _ if start.elapsed() > Duration::from_millis(500) => {
                    panic!("snapshot never arrived")
                }
                _ => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}
