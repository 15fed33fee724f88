mod events;
mod network;
mod reconcile;
mod slot;
mod world;

pub use events::ClientEvent;
pub use network::{ConnectionConfig, NetworkClient};
pub use reconcile::{
    classify, lookahead, reconcile, Band, Correction, ACCEPT_THRESHOLD, BLEND_THRESHOLD,
    MAX_LOOKAHEAD,
};
pub use slot::{InputSlot, SnapshotSlot};
pub use world::ClientWorld;
