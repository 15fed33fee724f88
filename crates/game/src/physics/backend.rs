use std::collections::BTreeMap;

use glam::Vec3;
use rapier3d::prelude::RigidBodyHandle;

use super::PhysicsWorld;
use crate::net::PlayerId;
use crate::sim::{spawn_position, Kinematics, SimulationBackend, PLAYER_HALF_EXTENTS};

#[derive(Debug, Clone, Copy)]
struct EntityRecord {
    handle: RigidBodyHandle,
    rotation: f32,
}

/// Rapier-backed simulation. Speculation runs in a second world holding
/// only the level geometry, so live bodies never see it.
pub struct RapierBackend {
    live: PhysicsWorld,
    scratch: PhysicsWorld,
    entities: BTreeMap<PlayerId, EntityRecord>,
}

impl Default for RapierBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RapierBackend {
    pub fn new() -> Self {
        Self {
            live: PhysicsWorld::with_arena(),
            scratch: PhysicsWorld::with_arena(),
            entities: BTreeMap::new(),
        }
    }

    pub fn world(&self) -> &PhysicsWorld {
        &self.live
    }
}

impl SimulationBackend for RapierBackend {
    fn create_entity(&mut self, id: PlayerId) {
        if self.entities.contains_key(&id) {
            return;
        }
        let handle = self.live.add_player(spawn_position(id), PLAYER_HALF_EXTENTS);
        self.entities.insert(
            id,
            EntityRecord {
                handle,
                rotation: 0.0,
            },
        );
    }

    fn destroy_entity(&mut self, id: PlayerId) {
        if let Some(record) = self.entities.remove(&id) {
            self.live.remove_body(record.handle);
        }
    }

    fn has_entity(&self, id: PlayerId) -> bool {
        self.entities.contains_key(&id)
    }

    fn entity_ids(&self) -> Vec<PlayerId> {
        self.entities.keys().copied().collect()
    }

    fn kinematics(&self, id: PlayerId) -> Option<Kinematics> {
        let record = self.entities.get(&id)?;
        Some(Kinematics {
            position: self.live.body_position(record.handle)?,
            velocity: self.live.body_velocity(record.handle)?,
            rotation: record.rotation,
        })
    }

    fn set_kinematics(&mut self, id: PlayerId, kinematics: Kinematics) {
        let Some(record) = self.entities.get_mut(&id) else {
            return;
        };
        record.rotation = kinematics.rotation;
        let handle = record.handle;
        self.live
            .set_body_pose(handle, kinematics.position, kinematics.rotation);
        self.live.set_body_velocity(handle, kinematics.velocity);
    }

    fn apply_impulse(&mut self, id: PlayerId, impulse: Vec3) {
        if let Some(record) = self.entities.get(&id) {
            self.live.apply_impulse(record.handle, impulse);
        }
    }

    fn set_gravity_enabled(&mut self, id: PlayerId, enabled: bool) {
        if let Some(record) = self.entities.get(&id) {
            self.live
                .set_gravity_scale(record.handle, if enabled { 1.0 } else { 0.0 });
        }
    }

    fn step(&mut self, dt: f32) {
        self.live.advance(dt);
    }

    fn speculate(&mut self, seed: Kinematics, duration: f32) -> Vec3 {
        let handle = self.scratch.add_player(seed.position, PLAYER_HALF_EXTENTS);
        self.scratch.set_gravity_scale(handle, 0.0);
        self.scratch.set_body_velocity(handle, seed.velocity);

        self.scratch.advance(duration);

        let future = self.scratch.body_position(handle).unwrap_or(seed.position);
        self.scratch.remove_body(handle);
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FIXED_DT, JUMP_IMPULSE};

    #[test]
    fn test_player_rests_on_ground() {
        let mut backend = RapierBackend::new();
        backend.create_entity(2);

        for _ in 0..120 {
            backend.step(FIXED_DT);
        }

        let kinematics = backend.kinematics(2).unwrap();
        assert!((kinematics.position.y - 1.25).abs() < 0.05);
        assert!((kinematics.position.x - 2.0).abs() < 0.05);
    }

    #[test]
    fn test_set_kinematics_round_trips() {
        let mut backend = RapierBackend::new();
        backend.create_entity(0);

        let target = Kinematics {
            position: Vec3::new(-5.0, 4.0, 6.0),
            velocity: Vec3::new(1.0, 0.0, -1.0),
            rotation: 1.2,
        };
        backend.set_kinematics(0, target);

        let read = backend.kinematics(0).unwrap();
        assert!((read.position - target.position).length() < 1e-4);
        assert!((read.velocity - target.velocity).length() < 1e-4);
        assert_eq!(read.rotation, 1.2);
    }

    #[test]
    fn test_speculation_does_not_touch_live_world() {
        let mut backend = RapierBackend::new();
        backend.create_entity(1);
        let before = backend.kinematics(1).unwrap();
        let bodies_before = backend.world().bodies.len();

        let seed = Kinematics {
            position: Vec3::new(-10.0, 5.0, -10.0),
            velocity: Vec3::new(3.0, 0.0, 0.0),
            rotation: 0.0,
        };
        let future = backend.speculate(seed, 0.5);

        // No gravity in the scratch pass: height holds, x advances 1.5.
        assert!((future.y - 5.0).abs() < 1e-3);
        assert!((future.x - -8.5).abs() < 0.05);
        assert_eq!(backend.kinematics(1).unwrap(), before);
        assert_eq!(backend.world().bodies.len(), bodies_before);
    }

    #[test]
    fn test_jump_impulse_lifts_player() {
        let mut backend = RapierBackend::new();
        backend.create_entity(3);
        backend.step(FIXED_DT);

        backend.apply_impulse(3, Vec3::new(0.0, JUMP_IMPULSE, 0.0));
        backend.step(FIXED_DT);

        assert!(backend.kinematics(3).unwrap().velocity.y > 1.0);
    }

    #[test]
    fn test_gravity_can_be_suspended() {
        let mut backend = RapierBackend::new();
        backend.create_entity(4);
        backend.set_kinematics(
            4,
            Kinematics {
                position: Vec3::new(-20.0, 10.0, -20.0),
                ..Kinematics::default()
            },
        );
        backend.set_gravity_enabled(4, false);
        backend.step(0.5);
        assert!((backend.kinematics(4).unwrap().position.y - 10.0).abs() < 1e-3);

        backend.set_gravity_enabled(4, true);
        backend.step(0.5);
        assert!(backend.kinematics(4).unwrap().position.y < 9.0);
    }

    #[test]
    fn test_destroy_removes_body() {
        let mut backend = RapierBackend::new();
        backend.create_entity(0);
        backend.create_entity(1);
        backend.destroy_entity(0);

        assert!(!backend.has_entity(0));
        assert_eq!(backend.entity_ids(), vec![1]);
        assert_eq!(backend.world().bodies.len(), 1);
    }
}
