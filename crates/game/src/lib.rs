pub mod client;
pub mod clock;
pub mod net;
pub mod physics;
pub mod server;
pub mod sim;

pub use client::{ClientEvent, ClientWorld, ConnectionConfig, NetworkClient};
pub use clock::{ClockState, ClockSync, MonotonicClock, SampleOutcome};
pub use net::{
    ChannelError, Message, MessageType, NetworkStats, PlayerId, ProtocolError, Snapshot,
    StartupError, StatsSnapshot,
};
pub use physics::{PhysicsWorld, RapierBackend};
pub use server::{NetworkConfig, NetworkServer, ServerEvent, ServerWorld, SessionRegistry};
pub use sim::{KinematicWorld, Kinematics, SimulationBackend};
