use std::net::SocketAddr;

use crate::net::PlayerId;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected {
        player_id: PlayerId,
        addr: SocketAddr,
    },
    PlayerJoined {
        player_id: PlayerId,
        udp_address: SocketAddr,
    },
    ConnectionRejected {
        addr: SocketAddr,
    },
    ClientDisconnected {
        player_id: PlayerId,
        reason: DisconnectReason,
    },
    Chat {
        player_id: PlayerId,
        text: String,
    },
    Ping {
        player_id: PlayerId,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Error,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Error => "dropped after an error",
            DisconnectReason::Shutdown => "server shut down",
        }
    }
}
