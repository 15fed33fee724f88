mod kinematic;

use glam::Vec3;

use crate::net::{PlayerId, PlayerState};

pub use kinematic::KinematicWorld;

pub const GRAVITY: f32 = -9.81;
/// Fixed physics step used by both the server and the client loops.
pub const FIXED_DT: f32 = 1.0 / 60.0;
pub const MOVE_SPEED: f32 = 3.0;
pub const JUMP_IMPULSE: f32 = 7.0;
pub const PLAYER_HALF_EXTENTS: Vec3 = Vec3::new(0.5, 0.75, 0.5);
/// Box volume at unit density.
pub const PLAYER_MASS: f32 = 8.0 * 0.5 * 0.75 * 0.5;
/// Height of a player's centre when resting on the ground slab.
pub const STANDING_HEIGHT: f32 = 1.25;

/// Where a player's body appears when its entity is created.
pub fn spawn_position(id: PlayerId) -> Vec3 {
    Vec3::new(id as f32, STANDING_HEIGHT, 2.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Kinematics {
    pub position: Vec3,
    pub velocity: Vec3,
    /// Yaw in radians.
    pub rotation: f32,
}

impl From<PlayerState> for Kinematics {
    fn from(state: PlayerState) -> Self {
        Self {
            position: Vec3::from_array(state.position),
            velocity: Vec3::from_array(state.velocity),
            rotation: state.rotation,
        }
    }
}

impl From<Kinematics> for PlayerState {
    fn from(kinematics: Kinematics) -> Self {
        Self {
            position: kinematics.position.to_array(),
            velocity: kinematics.velocity.to_array(),
            rotation: kinematics.rotation,
        }
    }
}

/// The physics the network layer drives. Entities are addressed by player
/// id; operations on an unknown id are ignored.
pub trait SimulationBackend {
    fn create_entity(&mut self, id: PlayerId);
    fn destroy_entity(&mut self, id: PlayerId);
    fn has_entity(&self, id: PlayerId) -> bool;
    fn entity_ids(&self) -> Vec<PlayerId>;

    fn kinematics(&self, id: PlayerId) -> Option<Kinematics>;
    fn set_kinematics(&mut self, id: PlayerId, kinematics: Kinematics);
    fn apply_impulse(&mut self, id: PlayerId, impulse: Vec3);
    fn set_gravity_enabled(&mut self, id: PlayerId, enabled: bool);

    fn step(&mut self, dt: f32);

    /// Runs `seed` forward by `duration` seconds with gravity suspended, in a
    /// context separate from the live one, and returns where it ends up.
    fn speculate(&mut self, seed: Kinematics, duration: f32) -> Vec3;
}

/// Velocity a movement intent produces: the planar direction scaled to
/// [`MOVE_SPEED`], keeping whatever vertical speed the body already has.
pub fn movement_velocity(planar: [f32; 2], current: Vec3) -> Vec3 {
    let horizontal = Vec3::new(planar[0], 0.0, planar[1]).normalize_or_zero() * MOVE_SPEED;
    Vec3::new(horizontal.x, current.y, horizontal.z)
}
