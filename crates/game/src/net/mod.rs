mod error;
mod protocol;
mod reliable;
mod stats;
mod unreliable;

pub use error::{ChannelError, StartupError};
pub use protocol::{
    decode, declared_length, encode, Chat, ClientInfo, InputUpdate, JoinGame, Message,
    MessageType, PlayerId, PlayerNotice, PlayerState, ProtocolError, Snapshot, TimeRequest,
    HEADER_SIZE, LENGTH_FIELD_SIZE, MAX_DATAGRAM_SIZE, MAX_PLAYERS, RELIABLE_PORT, TICK_RATE,
    TYPE_FIELD_SIZE, UNRELIABLE_PORT,
};
pub use reliable::{ChannelState, Outbox, ReadStatus, ReliableChannel, WriteStatus};
pub use stats::{NetworkStats, StatsSnapshot};
pub use unreliable::{Datagram, DiscardReason, SendStatus, UnreliableChannel};
