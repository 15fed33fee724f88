use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use super::events::ClientEvent;
use super::slot::{InputSlot, SnapshotSlot};
use crate::clock::{ClockState, ClockSync, MonotonicClock, SampleOutcome, PROBE_INTERVAL};
use crate::net::{
    ChannelError, ChannelState, Chat, ClientInfo, Datagram, InputUpdate, Message, NetworkStats,
    Outbox, ProtocolError, ReliableChannel, Snapshot, StartupError, StatsSnapshot,
    UnreliableChannel, WriteStatus, RELIABLE_PORT, TICK_RATE, UNRELIABLE_PORT,
};

const STREAM: Token = Token(0);
const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub server: IpAddr,
    pub reliable_port: u16,
    pub unreliable_port: u16,
    pub tick_rate: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server: IpAddr::V4(Ipv4Addr::LOCALHOST),
            reliable_port: RELIABLE_PORT,
            unreliable_port: UNRELIABLE_PORT,
            tick_rate: TICK_RATE,
        }
    }
}

fn lock_clock(clock: &Mutex<ClockSync>) -> MutexGuard<'_, ClockSync> {
    clock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client end of both channels. Connecting starts two I/O threads; the
/// caller talks to them through the outbox, the input slot, the snapshot
/// slot and the event receiver.
pub struct NetworkClient {
    outbox: Outbox,
    input: Arc<InputSlot>,
    snapshots: Arc<SnapshotSlot>,
    clock: MonotonicClock,
    sync: Arc<Mutex<ClockSync>>,
    reliable_stats: Arc<NetworkStats>,
    unreliable_stats: Arc<NetworkStats>,
    events: Receiver<ClientEvent>,
    running: Arc<AtomicBool>,
    udp_waker: Arc<Waker>,
    wakers: Vec<Arc<Waker>>,
    threads: Vec<JoinHandle<()>>,
}

impl NetworkClient {
    pub fn connect(config: ConnectionConfig) -> Result<Self, StartupError> {
        let reliable_stats = Arc::new(NetworkStats::new());
        let unreliable_stats = Arc::new(NetworkStats::new());
        let running = Arc::new(AtomicBool::new(true));
        let clock = MonotonicClock::new();
        let sync = Arc::new(Mutex::new(ClockSync::new()));
        let input = Arc::new(InputSlot::new());
        let snapshots = Arc::new(SnapshotSlot::new());
        let (event_tx, events) = crossbeam_channel::unbounded();

        let local_ip = match config.server {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let datagrams = DatagramLoop::bind(
            SocketAddr::new(local_ip, 0),
            SocketAddr::new(config.server, config.unreliable_port),
            clock,
            Arc::clone(&sync),
            Arc::clone(&input),
            Arc::clone(&snapshots),
            Arc::clone(&unreliable_stats),
            event_tx.clone(),
            Arc::clone(&running),
        )?;
        let udp_port = datagrams
            .channel
            .local_addr()
            .map_err(StartupError::Poll)?
            .port();

        let stream = StreamLoop::connect(
            SocketAddr::new(config.server, config.reliable_port),
            udp_port,
            Arc::clone(&reliable_stats),
            event_tx,
            Arc::clone(&running),
        )?;

        let outbox = stream.channel.outbox().clone();
        let udp_waker = Arc::clone(&datagrams.waker);
        let wakers = vec![Arc::clone(&stream.waker), Arc::clone(&datagrams.waker)];

        let mut client = Self {
            outbox,
            input,
            snapshots,
            clock,
            sync,
            reliable_stats,
            unreliable_stats,
            events,
            running,
            udp_waker,
            wakers,
            threads: Vec::new(),
        };

        let handle = std::thread::Builder::new()
            .name("reliable".into())
            .spawn(move || stream.run())
            .map_err(|e| StartupError::Spawn("reliable", e))?;
        client.threads.push(handle);

        let handle = std::thread::Builder::new()
            .name("unreliable".into())
            .spawn(move || datagrams.run())
            .map_err(|e| StartupError::Spawn("unreliable", e))?;
        client.threads.push(handle);

        Ok(client)
    }

    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events
    }

    /// The server id in the line is a placeholder; the server fills in the
    /// real sender.
    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        self.outbox.enqueue(&Message::Chat(Chat {
            player_id: 0,
            text: text.into(),
        }))
    }

    pub fn send_ping(&self) -> Result<(), ProtocolError> {
        self.outbox.enqueue(&Message::Ping)
    }

    /// Hands the latest input to the datagram thread.
    pub fn send_input(&self, input: InputUpdate) {
        self.input.put(input);
        if let Err(e) = self.udp_waker.wake() {
            log::warn!("Failed to wake datagram thread: {}", e);
        }
    }

    pub fn take_snapshot(&self) -> Option<Snapshot> {
        self.snapshots.take()
    }

    pub fn is_synced(&self) -> bool {
        lock_clock(&self.sync).is_synced()
    }

    pub fn clock_state(&self) -> ClockState {
        lock_clock(&self.sync).state()
    }

    /// Estimated server time right now.
    pub fn current_time(&self) -> u32 {
        lock_clock(&self.sync).current_time(self.clock.now_ms())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.reliable_stats
            .snapshot()
            .merged(self.unreliable_stats.snapshot())
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        for waker in &self.wakers {
            if let Err(e) = waker.wake() {
                log::warn!("Failed to wake event loop: {}", e);
            }
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Network thread panicked");
            }
        }
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown();
        }
    }
}

struct StreamLoop {
    poll: Poll,
    waker: Arc<Waker>,
    channel: ReliableChannel<TcpStream>,
    udp_port: u16,
    events: Sender<ClientEvent>,
    running: Arc<AtomicBool>,
}

impl StreamLoop {
    fn connect(
        addr: SocketAddr,
        udp_port: u16,
        stats: Arc<NetworkStats>,
        events: Sender<ClientEvent>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, StartupError> {
        let mut stream =
            TcpStream::connect(addr).map_err(|source| StartupError::Connect { addr, source })?;
        let poll = Poll::new().map_err(StartupError::Poll)?;
        poll.registry()
            .register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)
            .map_err(StartupError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(StartupError::Poll)?);

        let outbox = Outbox::new(Some(Arc::clone(&waker)));
        Ok(Self {
            poll,
            waker,
            channel: ReliableChannel::connecting(stream, outbox, stats),
            udp_port,
            events,
            running,
        })
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(16);

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.disconnect(format!("poll failed: {}", e));
                return;
            }

            let mut readable = false;
            let mut writable = false;
            for event in events.iter() {
                if event.token() == STREAM {
                    readable |= event.is_readable() || event.is_read_closed() || event.is_error();
                    writable |= event.is_writable();
                }
            }

            if writable {
                if let Err(e) = self.finish_connect() {
                    self.disconnect(format!("connect failed: {}", e));
                    return;
                }
                self.channel.set_writable(true);
            }

            if readable {
                let mut inbound = Vec::new();
                match self.channel.drain_inbound(|message| inbound.push(message)) {
                    Ok(open) => {
                        for message in inbound {
                            self.handle(message);
                        }
                        if !open {
                            self.disconnect("server closed the connection".into());
                            return;
                        }
                    }
                    Err(e) => {
                        self.disconnect(e.to_string());
                        return;
                    }
                }
            }

            match self.channel.flush() {
                Ok(WriteStatus::Closed) => {
                    self.disconnect("server closed the connection".into());
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    self.disconnect(e.to_string());
                    return;
                }
            }
        }
        self.channel.close();
    }

    /// A non-blocking connect reports completion as writability. A pending
    /// error or a missing peer address means it did not succeed.
    fn finish_connect(&mut self) -> Result<(), ChannelError> {
        if self.channel.state() != ChannelState::Connecting {
            return Ok(());
        }
        if let Some(e) = self.channel.stream().take_error()? {
            return Err(e.into());
        }
        match self.channel.stream().peer_addr() {
            Ok(peer) => {
                log::info!("Connected to {}", peer);
                self.channel.mark_connected();
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::ServerAccept => {
                let info = Message::ClientInfo(ClientInfo {
                    udp_port: self.udp_port,
                });
                if let Err(e) = self.channel.outbox().enqueue(&info) {
                    log::error!("Failed to queue client info: {}", e);
                }
                self.emit(ClientEvent::Accepted);
            }
            Message::ServerFull => {
                log::warn!("Server is full");
                self.emit(ClientEvent::ServerFull);
            }
            Message::JoinGame(join) => self.emit(ClientEvent::Joined {
                player_id: join.player_id,
                active_players: join.active_players,
            }),
            Message::NewPlayer(notice) => self.emit(ClientEvent::PlayerJoined {
                player_id: notice.player_id,
            }),
            Message::PlayerQuit(notice) => self.emit(ClientEvent::PlayerLeft {
                player_id: notice.player_id,
            }),
            Message::Chat(chat) => self.emit(ClientEvent::Chat {
                player_id: chat.player_id,
                text: chat.text,
            }),
            other => log::debug!(
                "Ignoring {:?} on the reliable channel",
                other.message_type()
            ),
        }
    }

    fn disconnect(&mut self, reason: String) {
        log::warn!("Disconnected: {}", reason);
        self.channel.close();
        self.emit(ClientEvent::Disconnected { reason });
    }
}

struct DatagramLoop {
    poll: Poll,
    waker: Arc<Waker>,
    channel: UnreliableChannel,
    server: SocketAddr,
    clock: MonotonicClock,
    sync: Arc<Mutex<ClockSync>>,
    input: Arc<InputSlot>,
    snapshots: Arc<SnapshotSlot>,
    events: Sender<ClientEvent>,
    running: Arc<AtomicBool>,
    next_probe: Instant,
}

impl DatagramLoop {
    #[allow(clippy::too_many_arguments)]
    fn bind(
        local: SocketAddr,
        server: SocketAddr,
        clock: MonotonicClock,
        sync: Arc<Mutex<ClockSync>>,
        input: Arc<InputSlot>,
        snapshots: Arc<SnapshotSlot>,
        stats: Arc<NetworkStats>,
        events: Sender<ClientEvent>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, StartupError> {
        let mut channel = UnreliableChannel::bind(local, stats)?;
        let poll = Poll::new().map_err(StartupError::Poll)?;
        poll.registry()
            .register(
                channel.socket_mut(),
                SOCKET,
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(StartupError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(StartupError::Poll)?;

        Ok(Self {
            poll,
            waker: Arc::new(waker),
            channel,
            server,
            clock,
            sync,
            input,
            snapshots,
            events,
            running,
            next_probe: Instant::now(),
        })
    }

    fn synced(&self) -> bool {
        lock_clock(&self.sync).is_synced()
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(16);

        while self.running.load(Ordering::Acquire) {
            // Once synchronized, only input or incoming datagrams wake us.
            let timeout = (!self.synced())
                .then(|| self.next_probe.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.fail(format!("poll failed: {}", e));
                return;
            }

            let mut readable = false;
            for event in events.iter() {
                if event.token() == SOCKET {
                    if event.is_writable() {
                        self.channel.set_writable(true);
                    }
                    readable |= event.is_readable();
                }
            }

            if let Err(e) = self.tick(readable) {
                self.fail(e.to_string());
                return;
            }
        }
    }

    fn tick(&mut self, readable: bool) -> Result<(), ChannelError> {
        if readable {
            self.drain()?;
        }

        if let Some(input) = self.input.take() {
            self.channel
                .send_message(&Message::InputUpdate(input), self.server)?;
        }

        let now = Instant::now();
        if now >= self.next_probe {
            let probe = lock_clock(&self.sync).probe(self.clock.now_ms());
            if let Some(probe) = probe {
                self.channel
                    .send_message(&Message::TimeRequest(probe), self.server)?;
            }
            self.next_probe = now + PROBE_INTERVAL;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), ChannelError> {
        let server = self.server;
        loop {
            match self.channel.recv(|from| (from == server).then_some(()))? {
                Datagram::Drained => return Ok(()),
                Datagram::Discarded { from, reason } => {
                    log::debug!("Discarded datagram from {}: {:?}", from, reason);
                }
                Datagram::Received { message, .. } => self.handle(message),
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::TimeRequest(reply) => {
                let mut sync = lock_clock(&self.sync);
                let outcome = sync.on_reply(&reply, self.clock.now_ms());
                log::trace!("Clock sample: {:?}", outcome);
                let state = sync.state();
                let just_synced = matches!(
                    outcome,
                    SampleOutcome::Adopted { .. } | SampleOutcome::Counted { .. }
                ) && sync.is_synced();
                drop(sync);

                if just_synced {
                    let latency = state.best_latency.unwrap_or(0);
                    log::info!(
                        "Clock synchronized: offset {}ms, latency {}ms",
                        state.offset,
                        latency
                    );
                    let _ = self.events.send(ClientEvent::Synced {
                        offset: state.offset,
                        latency,
                    });
                }
            }
            Message::PlayersUpdate(snapshot) => {
                let server_time = snapshot.server_time;
                if !self.snapshots.offer(snapshot) {
                    log::trace!("Stale snapshot {} dropped", server_time);
                }
            }
            other => log::debug!(
                "Ignoring {:?} on the unreliable channel",
                other.message_type()
            ),
        }
    }

    fn fail(&self, reason: String) {
        log::error!("Datagram channel failed: {}", reason);
        let _ = self.events.send(ClientEvent::Disconnected { reason });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_default_config_targets_standard_ports() {
        let config = ConnectionConfig::default();
        assert_eq!(config.reliable_port, 5555);
        assert_eq!(config.unreliable_port, 4444);
        assert_eq!(config.tick_rate, 8);
    }

    #[test]
    fn test_connect_refused_reports_disconnect() {
        // Grab a free port, then close it so nothing is listening.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut client = NetworkClient::connect(ConnectionConfig {
            reliable_port: port,
            unreliable_port: port,
            ..ConnectionConfig::default()
        })
        .unwrap();

        let event = client
            .events()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(matches!(event, ClientEvent::Disconnected { .. }), "{:?}", event);
        client.shutdown();
    }
}
