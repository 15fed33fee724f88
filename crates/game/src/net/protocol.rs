use std::collections::BTreeMap;

use rkyv::util::AlignedVec;
use rkyv::{rancor, Archive, Deserialize, Serialize};

pub const RELIABLE_PORT: u16 = 5555;
pub const UNRELIABLE_PORT: u16 = 4444;
pub const TICK_RATE: u32 = 8;
pub const MAX_PLAYERS: usize = 5;
pub const MAX_DATAGRAM_SIZE: usize = 1200;

pub const LENGTH_FIELD_SIZE: usize = 2;
pub const TYPE_FIELD_SIZE: usize = 1;
pub const HEADER_SIZE: usize = LENGTH_FIELD_SIZE + TYPE_FIELD_SIZE;

pub type PlayerId = u8;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes does not fit the length field")]
    FrameTooLarge(usize),
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("buffer of {0} bytes is shorter than the header")]
    Truncated(usize),
    #[error("declared length {declared} does not match buffer length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("{0:?} carries no payload but {1} bytes were attached")]
    UnexpectedPayload(MessageType, usize),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

impl ProtocolError {
    /// True for errors caused by bytes received from a peer, as opposed to
    /// errors building an outbound frame.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Self::FrameTooLarge(_) | Self::Serialize(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    InputUpdate = 0,
    TimeRequest = 1,
    PlayersUpdate = 2,
    Ping = 3,
    ServerAccept = 4,
    ServerFull = 5,
    ClientInfo = 6,
    JoinGame = 7,
    NewPlayer = 8,
    PlayerQuit = 9,
    Chat = 10,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => Self::InputUpdate,
            1 => Self::TimeRequest,
            2 => Self::PlayersUpdate,
            3 => Self::Ping,
            4 => Self::ServerAccept,
            5 => Self::ServerFull,
            6 => Self::ClientInfo,
            7 => Self::JoinGame,
            8 => Self::NewPlayer,
            9 => Self::PlayerQuit,
            10 => Self::Chat,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Player intent for one client tick. `velocity` is the planar (x, z) move
/// direction; the server normalizes it.
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct InputUpdate {
    pub local_time: u32,
    pub velocity: [f32; 2],
    pub rotation: f32,
    pub jump: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct TimeRequest {
    pub client_time: u32,
    pub server_time: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PlayerState {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub rotation: f32,
}

#[derive(Debug, Clone, PartialEq, Default, Archive, Serialize, Deserialize)]
pub struct Snapshot {
    pub server_time: u32,
    pub players: BTreeMap<PlayerId, PlayerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ClientInfo {
    pub udp_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct JoinGame {
    pub player_id: PlayerId,
    pub active_players: Vec<PlayerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PlayerNotice {
    pub player_id: PlayerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Chat {
    pub player_id: PlayerId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    InputUpdate(InputUpdate),
    TimeRequest(TimeRequest),
    PlayersUpdate(Snapshot),
    Ping,
    ServerAccept,
    ServerFull,
    ClientInfo(ClientInfo),
    JoinGame(JoinGame),
    NewPlayer(PlayerNotice),
    PlayerQuit(PlayerNotice),
    Chat(Chat),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::InputUpdate(_) => MessageType::InputUpdate,
            Self::TimeRequest(_) => MessageType::TimeRequest,
            Self::PlayersUpdate(_) => MessageType::PlayersUpdate,
            Self::Ping => MessageType::Ping,
            Self::ServerAccept => MessageType::ServerAccept,
            Self::ServerFull => MessageType::ServerFull,
            Self::ClientInfo(_) => MessageType::ClientInfo,
            Self::JoinGame(_) => MessageType::JoinGame,
            Self::NewPlayer(_) => MessageType::NewPlayer,
            Self::PlayerQuit(_) => MessageType::PlayerQuit,
            Self::Chat(_) => MessageType::Chat,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Reads the total length declared by a frame header.
pub fn declared_length(header: &[u8; LENGTH_FIELD_SIZE]) -> usize {
    u16::from_le_bytes(*header) as usize
}

pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = match message {
        Message::InputUpdate(m) => rkyv::to_bytes::<rancor::Error>(m),
        Message::TimeRequest(m) => rkyv::to_bytes::<rancor::Error>(m),
        Message::PlayersUpdate(m) => rkyv::to_bytes::<rancor::Error>(m),
        Message::ClientInfo(m) => rkyv::to_bytes::<rancor::Error>(m),
        Message::JoinGame(m) => rkyv::to_bytes::<rancor::Error>(m),
        Message::NewPlayer(m) | Message::PlayerQuit(m) => rkyv::to_bytes::<rancor::Error>(m),
        Message::Chat(m) => rkyv::to_bytes::<rancor::Error>(m),
        Message::Ping | Message::ServerAccept | Message::ServerFull => Ok(AlignedVec::new()),
    }
    .map_err(ProtocolError::Serialize)?;

    let total = HEADER_SIZE + payload.len();
    let length = u16::try_from(total).map_err(|_| ProtocolError::FrameTooLarge(total))?;

    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.push(message.message_type() as u8);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

macro_rules! unpack {
    ($ty:ty, $payload:expr) => {
        rkyv::from_bytes::<$ty, rancor::Error>($payload).map_err(ProtocolError::Deserialize)?
    };
}

pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated(bytes.len()));
    }

    let declared = declared_length(&[bytes[0], bytes[1]]);
    if declared != bytes.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }

    let kind = MessageType::try_from(bytes[LENGTH_FIELD_SIZE])?;

    // Payload starts at an odd offset; rkyv needs it aligned.
    let mut payload = AlignedVec::<16>::with_capacity(bytes.len() - HEADER_SIZE);
    payload.extend_from_slice(&bytes[HEADER_SIZE..]);

    let message = match kind {
        MessageType::InputUpdate => Message::InputUpdate(unpack!(InputUpdate, &payload)),
        MessageType::TimeRequest => Message::TimeRequest(unpack!(TimeRequest, &payload)),
        MessageType::PlayersUpdate => Message::PlayersUpdate(unpack!(Snapshot, &payload)),
        MessageType::ClientInfo => Message::ClientInfo(unpack!(ClientInfo, &payload)),
        MessageType::JoinGame => Message::JoinGame(unpack!(JoinGame, &payload)),
        MessageType::NewPlayer => Message::NewPlayer(unpack!(PlayerNotice, &payload)),
        MessageType::PlayerQuit => Message::PlayerQuit(unpack!(PlayerNotice, &payload)),
        MessageType::Chat => Message::Chat(unpack!(Chat, &payload)),
        MessageType::Ping | MessageType::ServerAccept | MessageType::ServerFull => {
            if !payload.is_empty() {
                return Err(ProtocolError::UnexpectedPayload(kind, payload.len()));
            }
            match kind {
                MessageType::Ping => Message::Ping,
                MessageType::ServerAccept => Message::ServerAccept,
                _ => Message::ServerFull,
            }
        }
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> Snapshot {
        let mut players = BTreeMap::new();
        players.insert(
            0,
            PlayerState {
                position: [0.0, 1.25, 2.0],
                velocity: [3.0, 0.0, 0.0],
                rotation: 1.5,
            },
        );
        players.insert(
            3,
            PlayerState {
                position: [-4.0, 2.0, 7.5],
                velocity: [0.0, -1.0, 0.5],
                rotation: -0.25,
            },
        );
        Snapshot {
            server_time: 48_250,
            players,
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = encode(&Message::Ping).unwrap();
        assert_eq!(frame, vec![3, 0, MessageType::Ping as u8]);

        let frame = encode(&Message::ClientInfo(ClientInfo { udp_port: 50_000 })).unwrap();
        let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(declared, frame.len());
        assert_eq!(frame[2], MessageType::ClientInfo as u8);
    }

    #[test]
    fn test_every_message_round_trips() {
        let messages = vec![
            Message::InputUpdate(InputUpdate {
                local_time: 1234,
                velocity: [0.5, -1.0],
                rotation: 3.0,
                jump: true,
            }),
            Message::TimeRequest(TimeRequest {
                client_time: 10,
                server_time: 99_000,
            }),
            Message::PlayersUpdate(sample_snapshot()),
            Message::Ping,
            Message::ServerAccept,
            Message::ServerFull,
            Message::ClientInfo(ClientInfo { udp_port: 4444 }),
            Message::JoinGame(JoinGame {
                player_id: 2,
                active_players: vec![0, 1, 2],
            }),
            Message::NewPlayer(PlayerNotice { player_id: 4 }),
            Message::PlayerQuit(PlayerNotice { player_id: 1 }),
            Message::Chat(Chat {
                player_id: 3,
                text: "hello there".to_string(),
            }),
        ];

        for message in messages {
            let frame = message.encode().unwrap();
            let decoded = Message::decode(&frame).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let mut frame = encode(&Message::NewPlayer(PlayerNotice { player_id: 1 })).unwrap();
        frame.push(0);
        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::LengthMismatch { .. }));
        assert!(err.is_malformed());

        let frame = encode(&Message::ServerAccept).unwrap();
        assert!(matches!(
            decode(&frame[..2]),
            Err(ProtocolError::Truncated(2))
        ));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let frame = [3u8, 0, 11];
        assert!(matches!(decode(&frame), Err(ProtocolError::UnknownType(11))));
    }

    #[test]
    fn test_empty_types_reject_payload() {
        let frame = [5u8, 0, MessageType::ServerFull as u8, 1, 2];
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::UnexpectedPayload(MessageType::ServerFull, 2))
        ));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let frame = [5u8, 0, MessageType::Chat as u8, 0xff, 0xff];
        let err = decode(&frame).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn test_oversized_chat_does_not_encode() {
        let message = Message::Chat(Chat {
            player_id: 0,
            text: "x".repeat(u16::MAX as usize),
        });
        let err = encode(&message).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
        assert!(!err.is_malformed());
    }
}
