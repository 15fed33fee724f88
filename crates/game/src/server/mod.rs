mod events;
mod network;
mod replication;
mod session;
mod world;

pub use events::{DisconnectReason, ServerEvent};
pub use network::{NetworkConfig, NetworkServer};
pub use replication::{replicate, Replication, TickSchedule};
pub use session::{restamp_chat, BindError, SessionInfo, SessionRegistry};
pub use world::ServerWorld;
