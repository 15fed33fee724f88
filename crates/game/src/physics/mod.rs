mod backend;
mod world;

pub use backend::RapierBackend;
pub use world::PhysicsWorld;
