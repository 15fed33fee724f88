use std::collections::BTreeMap;

use glam::Vec3;

use super::{spawn_position, Kinematics, SimulationBackend, GRAVITY, PLAYER_MASS, STANDING_HEIGHT};
use crate::net::PlayerId;

#[derive(Debug, Clone, Copy)]
struct Body {
    kinematics: Kinematics,
    gravity: bool,
}

/// Collision-free integrator over a flat floor at standing height. Cheap and
/// fully deterministic, which makes it the backend of choice in tests.
#[derive(Debug, Clone, Default)]
pub struct KinematicWorld {
    bodies: BTreeMap<PlayerId, Body>,
    floor: Option<f32>,
}

impl KinematicWorld {
    pub fn new() -> Self {
        Self {
            bodies: BTreeMap::new(),
            floor: Some(STANDING_HEIGHT),
        }
    }

    /// No floor at all; bodies fall forever under gravity.
    pub fn without_floor() -> Self {
        Self::default()
    }

    fn integrate(&self, kinematics: &mut Kinematics, gravity: bool, dt: f32) {
        if gravity {
            kinematics.velocity.y += GRAVITY * dt;
        }
        kinematics.position += kinematics.velocity * dt;

        if let Some(floor) = self.floor {
            if kinematics.position.y < floor {
                kinematics.position.y = floor;
                kinematics.velocity.y = kinematics.velocity.y.max(0.0);
            }
        }
    }
}

impl SimulationBackend for KinematicWorld {
    fn create_entity(&mut self, id: PlayerId) {
        self.bodies.entry(id).or_insert(Body {
            kinematics: Kinematics {
                position: spawn_position(id),
                ..Kinematics::default()
            },
            gravity: true,
        });
    }

    fn destroy_entity(&mut self, id: PlayerId) {
        self.bodies.remove(&id);
    }

    fn has_entity(&self, id: PlayerId) -> bool {
        self.bodies.contains_key(&id)
    }

    fn entity_ids(&self) -> Vec<PlayerId> {
        self.bodies.keys().copied().collect()
    }

    fn kinematics(&self, id: PlayerId) -> Option<Kinematics> {
        self.bodies.get(&id).map(|body| body.kinematics)
    }

    fn set_kinematics(&mut self, id: PlayerId, kinematics: Kinematics) {
        if let Some(body) = self.bodies.get_mut(&id) {
            body.kinematics = kinematics;
        }
    }

    fn apply_impulse(&mut self, id: PlayerId, impulse: Vec3) {
        if let Some(body) = self.bodies.get_mut(&id) {
            body.kinematics.velocity += impulse / PLAYER_MASS;
        }
    }

    fn set_gravity_enabled(&mut self, id: PlayerId, enabled: bool) {
        if let Some(body) = self.bodies.get_mut(&id) {
            body.gravity = enabled;
        }
    }

    fn step(&mut self, dt: f32) {
        let mut bodies = std::mem::take(&mut self.bodies);
        for body in bodies.values_mut() {
            self.integrate(&mut body.kinematics, body.gravity, dt);
        }
        self.bodies = bodies;
    }

    fn speculate(&mut self, seed: Kinematics, duration: f32) -> Vec3 {
        let mut scratch = seed;
        self.integrate(&mut scratch, false, duration.max(0.0));
        scratch.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::JUMP_IMPULSE;

    #[test]
    fn test_entities_spawn_on_the_floor() {
        let mut world = KinematicWorld::new();
        world.create_entity(3);
        world.step(0.5);

        let kinematics = world.kinematics(3).unwrap();
        assert_eq!(kinematics.position, spawn_position(3));
        assert_eq!(world.entity_ids(), vec![3]);
    }

    #[test]
    fn test_jump_rises_then_lands() {
        let mut world = KinematicWorld::new();
        world.create_entity(0);
        world.apply_impulse(0, Vec3::new(0.0, JUMP_IMPULSE, 0.0));

        world.step(0.1);
        assert!(world.kinematics(0).unwrap().position.y > STANDING_HEIGHT);

        for _ in 0..120 {
            world.step(1.0 / 60.0);
        }
        assert_eq!(world.kinematics(0).unwrap().position.y, STANDING_HEIGHT);
    }

    #[test]
    fn test_speculation_leaves_live_state_alone() {
        let mut world = KinematicWorld::new();
        world.create_entity(1);
        let before = world.kinematics(1).unwrap();

        let seed = Kinematics {
            position: Vec3::new(0.0, 3.0, 0.0),
            velocity: Vec3::new(2.0, 0.0, 0.0),
            rotation: 0.0,
        };
        let future = world.speculate(seed, 0.5);

        assert_eq!(future, Vec3::new(1.0, 3.0, 0.0));
        assert_eq!(world.kinematics(1).unwrap(), before);
    }

    #[test]
    fn test_unknown_ids_are_ignored() {
        let mut world = KinematicWorld::new();
        world.set_kinematics(4, Kinematics::default());
        world.apply_impulse(4, Vec3::Y);
        world.destroy_entity(4);
        assert!(world.kinematics(4).is_none());
    }
}
