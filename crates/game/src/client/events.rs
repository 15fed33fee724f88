use crate::net::PlayerId;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server took the connection; the datagram port has been sent.
    Accepted,
    ServerFull,
    Joined {
        player_id: PlayerId,
        active_players: Vec<PlayerId>,
    },
    PlayerJoined {
        player_id: PlayerId,
    },
    PlayerLeft {
        player_id: PlayerId,
    },
    Chat {
        player_id: PlayerId,
        text: String,
    },
    /// Clock synchronization finished.
    Synced {
        offset: i64,
        latency: u32,
    },
    Disconnected {
        reason: String,
    },
}
