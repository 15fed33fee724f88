use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use super::events::{DisconnectReason, ServerEvent};
use super::replication::{replicate, Replication, TickSchedule};
use super::session::{restamp_chat, SessionRegistry};
use super::world::ServerWorld;
use crate::clock::MonotonicClock;
use crate::net::{
    ChannelError, ChannelState, Datagram, JoinGame, Message, NetworkStats, Outbox, PlayerId,
    PlayerNotice, ReliableChannel, SendStatus, StartupError, StatsSnapshot, TimeRequest,
    UnreliableChannel, WriteStatus, RELIABLE_PORT, TICK_RATE, UNRELIABLE_PORT,
};
use crate::sim::SimulationBackend;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;
const SOCKET: Token = Token(0);

#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    pub bind: IpAddr,
    pub reliable_port: u16,
    pub unreliable_port: u16,
    /// Snapshots published per second.
    pub tick_rate: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reliable_port: RELIABLE_PORT,
            unreliable_port: UNRELIABLE_PORT,
            tick_rate: TICK_RATE,
        }
    }
}

fn lock_world<B>(world: &Mutex<ServerWorld<B>>) -> MutexGuard<'_, ServerWorld<B>> {
    world.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The server's two event loops. Each runs on its own thread and owns its
/// sockets; everything else reaches them through the session registry, the
/// shared world and the event receiver.
pub struct NetworkServer {
    registry: Arc<SessionRegistry>,
    reliable_stats: Arc<NetworkStats>,
    unreliable_stats: Arc<NetworkStats>,
    reliable_addr: SocketAddr,
    unreliable_addr: SocketAddr,
    clock: MonotonicClock,
    events: Receiver<ServerEvent>,
    running: Arc<AtomicBool>,
    wakers: Vec<Arc<Waker>>,
    threads: Vec<JoinHandle<()>>,
}

impl NetworkServer {
    pub fn start<B>(
        config: NetworkConfig,
        world: Arc<Mutex<ServerWorld<B>>>,
    ) -> Result<Self, StartupError>
    where
        B: SimulationBackend + Send + 'static,
    {
        let registry = Arc::new(SessionRegistry::new());
        let reliable_stats = Arc::new(NetworkStats::new());
        let unreliable_stats = Arc::new(NetworkStats::new());
        let running = Arc::new(AtomicBool::new(true));
        let clock = MonotonicClock::new();
        let (event_tx, events) = crossbeam_channel::unbounded();
        let (fault_tx, fault_rx) = crossbeam_channel::unbounded();

        let reliable = ReliableLoop::bind(
            SocketAddr::new(config.bind, config.reliable_port),
            Arc::clone(&registry),
            Arc::clone(&world),
            Arc::clone(&reliable_stats),
            event_tx.clone(),
            fault_rx,
            Arc::clone(&running),
        )?;
        let unreliable = UnreliableLoop::bind(
            SocketAddr::new(config.bind, config.unreliable_port),
            config.tick_rate,
            clock,
            Arc::clone(&registry),
            world,
            Arc::clone(&unreliable_stats),
            event_tx,
            Faults {
                tx: fault_tx,
                waker: Arc::clone(&reliable.waker),
            },
            Arc::clone(&running),
        )?;

        let reliable_addr = reliable.local_addr()?;
        let unreliable_addr = unreliable
            .channel
            .local_addr()
            .map_err(StartupError::Poll)?;
        let wakers = vec![Arc::clone(&reliable.waker), Arc::clone(&unreliable.waker)];

        let mut server = Self {
            registry,
            reliable_stats,
            unreliable_stats,
            reliable_addr,
            unreliable_addr,
            clock,
            events,
            running,
            wakers,
            threads: Vec::new(),
        };

        let handle = std::thread::Builder::new()
            .name("reliable".into())
            .spawn(move || reliable.run())
            .map_err(|e| StartupError::Spawn("reliable", e))?;
        server.threads.push(handle);

        let handle = std::thread::Builder::new()
            .name("unreliable".into())
            .spawn(move || unreliable.run())
            .map_err(|e| StartupError::Spawn("unreliable", e))?;
        server.threads.push(handle);

        log::info!(
            "Listening on {} (reliable) and {} (unreliable)",
            reliable_addr,
            unreliable_addr
        );
        Ok(server)
    }

    pub fn reliable_addr(&self) -> SocketAddr {
        self.reliable_addr
    }

    pub fn unreliable_addr(&self) -> SocketAddr {
        self.unreliable_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Receiver<ServerEvent> {
        &self.events
    }

    /// Milliseconds since the server started, as stamped into snapshots.
    pub fn server_time(&self) -> u32 {
        self.clock.now_ms()
    }

    pub fn reliable_stats(&self) -> StatsSnapshot {
        self.reliable_stats.snapshot()
    }

    pub fn unreliable_stats(&self) -> StatsSnapshot {
        self.unreliable_stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clears the run flag, wakes both loops and waits for them to exit.
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

impl Drop for NetworkServer {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown();
        }
    }
}

struct Connection {
    /// `None` for a connection turned away because the server was full.
    player_id: Option<PlayerId>,
    joined: bool,
    peer: SocketAddr,
    channel: ReliableChannel<TcpStream>,
}

struct ReliableLoop<B> {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    registry: Arc<SessionRegistry>,
    world: Arc<Mutex<ServerWorld<B>>>,
    stats: Arc<NetworkStats>,
    events: Sender<ServerEvent>,
    /// Players whose datagram address stopped working.
    faults: Receiver<PlayerId>,
    running: Arc<AtomicBool>,
}

impl<B: SimulationBackend> ReliableLoop<B> {
    fn bind(
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        world: Arc<Mutex<ServerWorld<B>>>,
        stats: Arc<NetworkStats>,
        events: Sender<ServerEvent>,
        faults: Receiver<PlayerId>,
        running: Arc<AtomicBool>,
    ) -> Result<Self, StartupError> {
        let mut listener = TcpListener::bind(addr).map_err(|source| StartupError::Bind {
            what: "reliable listener",
            addr,
            source,
        })?;
        let poll = Poll::new().map_err(StartupError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(StartupError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(StartupError::Poll)?;

        Ok(Self {
            poll,
            listener,
            waker: Arc::new(waker),
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
            registry,
            world,
            stats,
            events,
            faults,
            running,
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, StartupError> {
        self.listener.local_addr().map_err(StartupError::Poll)
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(128);

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("Reliable poll failed: {}", e);
                self.emit(ServerEvent::Error {
                    message: format!("reliable poll failed: {}", e),
                });
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending(),
                    WAKER => {}
                    token => {
                        let readable =
                            event.is_readable() || event.is_read_closed() || event.is_error();
                        self.handle_ready(token, readable, event.is_writable());
                    }
                }
            }

            self.drop_faulted();
            // Outboxes may have been filled from other threads.
            self.flush_all();
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token, DisconnectReason::Shutdown);
        }
        log::info!("Reliable loop stopped");
    }

    fn drop_faulted(&mut self) {
        while let Ok(player_id) = self.faults.try_recv() {
            let token = self
                .connections
                .iter()
                .find(|(_, connection)| connection.player_id == Some(player_id))
                .map(|(&token, _)| token);
            if let Some(token) = token {
                log::warn!("Dropping player {}: datagram address unusable", player_id);
                self.close(token, DisconnectReason::Error);
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Accept failed: {}", e);
                    self.emit(ServerEvent::Error {
                        message: format!("accept failed: {}", e),
                    });
                    return;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                log::debug!("Could not disable Nagle for {}: {}", peer, e);
            }
            let token = Token(self.next_token);
            self.next_token += 1;
            if let Err(e) = self.poll.registry().register(
                &mut stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                log::warn!("Failed to register connection from {}: {}", peer, e);
                continue;
            }

            let outbox = Outbox::new(Some(Arc::clone(&self.waker)));
            let connection = match self.registry.allocate(outbox.clone()) {
                Some(player_id) => {
                    log::info!("Player {} connected from {}", player_id, peer);
                    if let Err(e) = outbox.enqueue(&Message::ServerAccept) {
                        log::error!("Failed to queue accept for {}: {}", peer, e);
                    }
                    self.emit(ServerEvent::ClientConnected {
                        player_id,
                        addr: peer,
                    });
                    Connection {
                        player_id: Some(player_id),
                        joined: false,
                        peer,
                        channel: ReliableChannel::open(stream, outbox, Arc::clone(&self.stats)),
                    }
                }
                None => {
                    log::warn!("Rejecting {}: server full", peer);
                    if let Err(e) = outbox.enqueue(&Message::ServerFull) {
                        log::error!("Failed to queue rejection for {}: {}", peer, e);
                    }
                    let mut channel =
                        ReliableChannel::open(stream, outbox, Arc::clone(&self.stats));
                    channel.begin_close();
                    self.emit(ServerEvent::ConnectionRejected { addr: peer });
                    Connection {
                        player_id: None,
                        joined: false,
                        peer,
                        channel,
                    }
                }
            };
            self.connections.insert(token, connection);
        }
    }

    fn handle_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        if writable {
            connection.channel.set_writable(true);
        }
        if !readable {
            return;
        }

        let mut inbound = Vec::new();
        let result = connection.channel.drain_inbound(|message| inbound.push(message));
        let player_id = connection.player_id;
        let peer = connection.peer;

        if let Some(player_id) = player_id {
            for message in inbound {
                self.handle_message(token, player_id, peer, message);
            }
        }

        match result {
            Ok(true) => {}
            Ok(false) => self.close(token, DisconnectReason::Graceful),
            Err(e) => {
                log::warn!("Connection from {} failed: {}", peer, e);
                self.close(token, DisconnectReason::Error);
            }
        }
    }

    fn handle_message(
        &mut self,
        token: Token,
        player_id: PlayerId,
        peer: SocketAddr,
        message: Message,
    ) {
        match message {
            Message::ClientInfo(info) => {
                self.join(token, player_id, SocketAddr::new(peer.ip(), info.udp_port));
            }
            Message::Chat(_) if !self.is_joined(token) => {
                log::debug!("Ignoring chat from player {} before join", player_id);
            }
            Message::Chat(chat) => {
                let chat = restamp_chat(chat, player_id);
                log::info!("[chat] player {}: {}", player_id, chat.text);
                self.emit(ServerEvent::Chat {
                    player_id,
                    text: chat.text.clone(),
                });
                if let Err(e) = self.registry.broadcast(&Message::Chat(chat), None) {
                    log::warn!("Failed to relay chat from player {}: {}", player_id, e);
                }
            }
            Message::Ping => {
                log::info!("Ping from player {}", player_id);
                self.emit(ServerEvent::Ping { player_id });
            }
            other => {
                log::debug!(
                    "Ignoring {:?} from player {} on the reliable channel",
                    other.message_type(),
                    player_id
                );
            }
        }
    }

    fn is_joined(&self, token: Token) -> bool {
        self.connections
            .get(&token)
            .is_some_and(|connection| connection.joined)
    }

    fn join(&mut self, token: Token, player_id: PlayerId, udp_address: SocketAddr) {
        if let Err(e) = self.registry.bind_address(player_id, udp_address) {
            log::warn!("Player {} sent an unusable address: {}", player_id, e);
            return;
        }
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };
        if connection.joined {
            log::info!("Player {} rebound to {}", player_id, udp_address);
            return;
        }
        connection.joined = true;

        lock_world(&self.world).add_player(player_id);

        let join = JoinGame {
            player_id,
            active_players: self.registry.joined_ids(),
        };
        if let Err(e) = connection.channel.outbox().enqueue(&Message::JoinGame(join)) {
            log::error!("Failed to queue join for player {}: {}", player_id, e);
        }
        if let Err(e) = self
            .registry
            .broadcast(&Message::NewPlayer(PlayerNotice { player_id }), Some(player_id))
        {
            log::error!("Failed to announce player {}: {}", player_id, e);
        }

        log::info!("Player {} joined from {}", player_id, udp_address);
        self.emit(ServerEvent::PlayerJoined {
            player_id,
            udp_address,
        });
    }

    fn flush_all(&mut self) {
        let mut finished = Vec::new();
        for (&token, connection) in &mut self.connections {
            match connection.channel.flush() {
                Ok(WriteStatus::Closed) => finished.push((token, DisconnectReason::Graceful)),
                Ok(_) => {
                    if connection.channel.state() == ChannelState::Closing
                        && connection.channel.is_drained()
                    {
                        finished.push((token, DisconnectReason::Graceful));
                    }
                }
                Err(e) => {
                    log::warn!("Write to {} failed: {}", connection.peer, e);
                    finished.push((token, DisconnectReason::Error));
                }
            }
        }
        for (token, reason) in finished {
            self.close(token, reason);
        }
    }

    /// Tears down one connection. For a player this frees the id, drops the
    /// datagram binding and the body, and tells everyone else.
    fn close(&mut self, token: Token, reason: DisconnectReason) {
        let Some(mut connection) = self.connections.remove(&token) else {
            return;
        };
        if let Err(e) = self
            .poll
            .registry()
            .deregister(connection.channel.stream_mut())
        {
            log::debug!("Deregister of {} failed: {}", connection.peer, e);
        }
        connection.channel.close();

        let Some(player_id) = connection.player_id else {
            return;
        };
        let was_joined = self.registry.release(player_id).unwrap_or(false);
        lock_world(&self.world).remove_player(player_id);

        if was_joined {
            let quit = Message::PlayerQuit(PlayerNotice { player_id });
            if let Err(e) = self.registry.broadcast(&quit, None) {
                log::error!("Failed to announce departure of {}: {}", player_id, e);
            }
        }

        log::info!("Player {} {}", player_id, reason.as_str());
        self.emit(ServerEvent::ClientDisconnected { player_id, reason });
    }
}

struct UnreliableLoop<B> {
    poll: Poll,
    waker: Arc<Waker>,
    channel: UnreliableChannel,
    schedule: TickSchedule,
    clock: MonotonicClock,
    registry: Arc<SessionRegistry>,
    world: Arc<Mutex<ServerWorld<B>>>,
    events: Sender<ServerEvent>,
    faults: Faults,
    running: Arc<AtomicBool>,
}

/// Hands players with a refused datagram address over to the reliable loop,
/// which owns their connections.
struct Faults {
    tx: Sender<PlayerId>,
    waker: Arc<Waker>,
}

impl Faults {
    fn report(&self, players: &[PlayerId]) {
        if players.is_empty() {
            return;
        }
        for &player_id in players {
            let _ = self.tx.send(player_id);
        }
        if let Err(e) = self.waker.wake() {
            log::warn!("Failed to wake reliable loop: {}", e);
        }
    }
}

impl<B: SimulationBackend> UnreliableLoop<B> {
    #[allow(clippy::too_many_arguments)]
    fn bind(
        addr: SocketAddr,
        tick_rate: u32,
        clock: MonotonicClock,
        registry: Arc<SessionRegistry>,
        world: Arc<Mutex<ServerWorld<B>>>,
        stats: Arc<NetworkStats>,
        events: Sender<ServerEvent>,
        faults: Faults,
        running: Arc<AtomicBool>,
    ) -> Result<Self, StartupError> {
        let mut channel = UnreliableChannel::bind(addr, stats)?;
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
            schedule: TickSchedule::from_rate(tick_rate, Instant::now()),
            clock,
            registry,
            world,
            events,
            faults,
            running,
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(64);

        while self.running.load(Ordering::Acquire) {
            let timeout = self.schedule.timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.fail(format!("unreliable poll failed: {}", e));
                break;
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

            if readable {
                if let Err(e) = self.drain() {
                    self.fail(format!("unreliable receive failed: {}", e));
                    break;
                }
            }

            if self.schedule.poll(Instant::now()) {
                if let Err(e) = self.publish() {
                    self.fail(format!("snapshot send failed: {}", e));
                    break;
                }
            }
        }
        log::info!("Unreliable loop stopped");
    }

    fn fail(&self, message: String) {
        log::error!("{}", message);
        let _ = self.events.send(ServerEvent::Error { message });
    }

    fn drain(&mut self) -> Result<(), ChannelError> {
        loop {
            let registry = &self.registry;
            match self.channel.recv(|addr| registry.resolve(addr))? {
                Datagram::Drained => return Ok(()),
                Datagram::Discarded { from, reason } => {
                    log::debug!("Discarded datagram from {}: {:?}", from, reason);
                }
                Datagram::Received {
                    source,
                    from,
                    message,
                } => self.handle(source, from, message)?,
            }
        }
    }

    fn handle(
        &mut self,
        player_id: PlayerId,
        from: SocketAddr,
        message: Message,
    ) -> Result<(), ChannelError> {
        match message {
            Message::TimeRequest(request) => {
                let reply = Message::TimeRequest(TimeRequest {
                    client_time: request.client_time,
                    server_time: self.clock.now_ms(),
                });
                if self.channel.send_message(&reply, from)? == SendStatus::Failed {
                    self.faults.report(&[player_id]);
                }
            }
            Message::InputUpdate(input) => {
                if self.registry.accept_input(player_id, input.local_time) {
                    lock_world(&self.world).submit_input(player_id, input);
                } else {
                    log::trace!(
                        "Stale input {} from player {}",
                        input.local_time,
                        player_id
                    );
                }
            }
            other => {
                log::debug!(
                    "Ignoring {:?} from player {} on the unreliable channel",
                    other.message_type(),
                    player_id
                );
            }
        }
        Ok(())
    }

    fn publish(&mut self) -> Result<(), ChannelError> {
        let targets = self.registry.udp_targets();
        if targets.is_empty() {
            return Ok(());
        }

        let snapshot = lock_world(&self.world).snapshot(self.clock.now_ms());
        match replicate(&mut self.channel, snapshot, &targets)? {
            Replication::Skipped => log::trace!("Snapshot skipped: socket not writable"),
            Replication::Published { failed, .. } => self.faults.report(&failed),
        }
        Ok(())
    }
}
