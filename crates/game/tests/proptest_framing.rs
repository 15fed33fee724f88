use std::io::{self, Read, Write};
use std::sync::Arc;

use proptest::prelude::*;

use tandem::client::SnapshotSlot;
use tandem::net::{
    Chat, ClientInfo, InputUpdate, JoinGame, Message, NetworkStats, Outbox, PlayerNotice,
    PlayerState, ReliableChannel, Snapshot, TimeRequest,
};
use tandem::server::SessionRegistry;

/// Serves a byte buffer in caller-chosen chunk sizes, reporting would-block
/// between chunks the way a non-blocking socket does.
struct ChunkedStream {
    data: Vec<u8>,
    pos: usize,
    chunks: Vec<usize>,
    next_chunk: usize,
    blocked: bool,
}

impl ChunkedStream {
    fn new(data: Vec<u8>, chunks: Vec<usize>) -> Self {
        Self {
            data,
            pos: 0,
            chunks,
            next_chunk: 0,
            blocked: false,
        }
    }
}

impl Read for ChunkedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.data.len() || self.blocked {
            self.blocked = false;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let chunk = self.chunks[self.next_chunk % self.chunks.len()];
        self.next_chunk += 1;
        self.blocked = true;

        let n = chunk.min(buf.len()).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for ChunkedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn player_state() -> impl Strategy<Value = PlayerState> {
    (
        prop::array::uniform3(-100.0f32..100.0),
        prop::array::uniform3(-20.0f32..20.0),
        -3.2f32..3.2,
    )
        .prop_map(|(position, velocity, rotation)| PlayerState {
            position,
            velocity,
            rotation,
        })
}

fn message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (any::<u32>(), -1.0f32..1.0, -1.0f32..1.0, any::<bool>()).prop_map(
            |(local_time, x, z, jump)| Message::InputUpdate(InputUpdate {
                local_time,
                velocity: [x, z],
                rotation: x * 3.0,
                jump,
            })
        ),
        (any::<u32>(), any::<u32>()).prop_map(|(client_time, server_time)| {
            Message::TimeRequest(TimeRequest {
                client_time,
                server_time,
            })
        }),
        (
            any::<u32>(),
            prop::collection::btree_map(0u8..5, player_state(), 0..5)
        )
            .prop_map(|(server_time, players)| Message::PlayersUpdate(Snapshot {
                server_time,
                players,
            })),
        Just(Message::Ping),
        Just(Message::ServerAccept),
        Just(Message::ServerFull),
        any::<u16>().prop_map(|udp_port| Message::ClientInfo(ClientInfo { udp_port })),
        (0u8..5, prop::collection::vec(0u8..5, 0..5)).prop_map(|(player_id, active_players)| {
            Message::JoinGame(JoinGame {
                player_id,
                active_players,
            })
        }),
        (0u8..5).prop_map(|player_id| Message::NewPlayer(PlayerNotice { player_id })),
        (0u8..5).prop_map(|player_id| Message::PlayerQuit(PlayerNotice { player_id })),
        (0u8..5, ".{0,200}").prop_map(|(player_id, text)| Message::Chat(Chat { player_id, text })),
    ]
}

proptest! {
    #[test]
    fn framing_survives_arbitrary_chunking(
        messages in prop::collection::vec(message(), 1..20),
        chunks in prop::collection::vec(1usize..64, 1..16),
    ) {
        let stream: Vec<u8> = messages
            .iter()
            .flat_map(|m| m.encode().unwrap())
            .collect();

        let mut channel = ReliableChannel::open(
            ChunkedStream::new(stream, chunks),
            Outbox::new(None),
            Arc::new(NetworkStats::new()),
        );

        let mut received = Vec::new();
        // Every read either makes progress or reports would-block.
        for _ in 0..100_000 {
            prop_assert!(channel.drain_inbound(|m| received.push(m)).unwrap());
            if received.len() == messages.len() {
                break;
            }
        }
        prop_assert_eq!(received, messages);
        prop_assert_eq!(channel.buffered(), 0);
    }

    #[test]
    fn decode_never_panics_on_garbage(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = Message::decode(&bytes);
    }

    #[test]
    fn accepted_input_times_strictly_increase(times in prop::collection::vec(any::<u32>(), 1..50)) {
        let registry = SessionRegistry::new();
        let id = registry.allocate(Outbox::new(None)).unwrap();

        let mut last: Option<u32> = None;
        for time in times {
            let accepted = registry.accept_input(id, time);
            prop_assert_eq!(accepted, last.is_none_or(|last| time > last));
            if accepted {
                last = Some(time);
            }
        }
    }

    #[test]
    fn snapshot_slot_never_goes_backwards(times in prop::collection::vec(any::<u32>(), 1..50)) {
        let slot = SnapshotSlot::new();
        let mut newest: Option<u32> = None;

        for server_time in times {
            let offered = slot.offer(Snapshot { server_time, ..Snapshot::default() });
            prop_assert_eq!(offered, newest.is_none_or(|n| server_time > n));
            if offered {
                newest = Some(server_time);
            }
            prop_assert_eq!(slot.last_accepted(), newest);
        }
    }
}
