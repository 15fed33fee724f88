use std::collections::BTreeMap;

use glam::Vec3;

use crate::net::{InputUpdate, PlayerId, Snapshot};
use crate::sim::{movement_velocity, Kinematics, SimulationBackend, FIXED_DT, JUMP_IMPULSE};

/// Authoritative world state: the backend plus the latest unconsumed input
/// per player.
pub struct ServerWorld<B> {
    backend: B,
    pending: BTreeMap<PlayerId, InputUpdate>,
    accumulator: f32,
}

impl<B: SimulationBackend> ServerWorld<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            pending: BTreeMap::new(),
            accumulator: 0.0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn add_player(&mut self, id: PlayerId) {
        self.backend.create_entity(id);
    }

    pub fn remove_player(&mut self, id: PlayerId) {
        self.pending.remove(&id);
        self.backend.destroy_entity(id);
    }

    pub fn player_count(&self) -> usize {
        self.backend.entity_ids().len()
    }

    /// Replaces the pending input for `id`. A jump that has not been applied
    /// yet survives the overwrite.
    pub fn submit_input(&mut self, id: PlayerId, mut input: InputUpdate) {
        if self.pending.get(&id).is_some_and(|pending| pending.jump) {
            input.jump = true;
        }
        self.pending.insert(id, input);
    }

    pub fn pending_input(&self, id: PlayerId) -> Option<&InputUpdate> {
        self.pending.get(&id)
    }

    /// Consumes every pending input: rotation, planar velocity and the jump
    /// impulse.
    pub fn apply_inputs(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (id, input) in pending {
            let Some(current) = self.backend.kinematics(id) else {
                continue;
            };

            self.backend.set_kinematics(
                id,
                Kinematics {
                    position: current.position,
                    velocity: movement_velocity(input.velocity, current.velocity),
                    rotation: input.rotation,
                },
            );
            if input.jump {
                self.backend
                    .apply_impulse(id, Vec3::new(0.0, JUMP_IMPULSE, 0.0));
            }
        }
    }

    /// Applies inputs, then runs as many fixed steps as `frame_time` covers.
    /// Returns the number of steps taken.
    pub fn update(&mut self, frame_time: f32) -> u32 {
        self.apply_inputs();

        self.accumulator += frame_time;
        let mut steps = 0;
        while self.accumulator >= FIXED_DT {
            self.accumulator -= FIXED_DT;
            self.backend.step(FIXED_DT);
            steps += 1;
        }
        steps
    }

    /// Every player's kinematics, stamped with `server_time`.
    pub fn snapshot(&self, server_time: u32) -> Snapshot {
        let players = self
            .backend
            .entity_ids()
            .into_iter()
            .filter_map(|id| {
                self.backend
                    .kinematics(id)
                    .map(|kinematics| (id, kinematics.into()))
            })
            .collect();

        Snapshot {
            server_time,
            players,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{KinematicWorld, MOVE_SPEED, PLAYER_MASS};

    fn input(local_time: u32, velocity: [f32; 2], jump: bool) -> InputUpdate {
        InputUpdate {
            local_time,
            velocity,
            rotation: 0.5,
            jump,
        }
    }

    fn world_with(ids: &[PlayerId]) -> ServerWorld<KinematicWorld> {
        let mut world = ServerWorld::new(KinematicWorld::new());
        for &id in ids {
            world.add_player(id);
        }
        world
    }

    #[test]
    fn test_jump_survives_overwrite_until_applied() {
        let mut world = world_with(&[0]);
        world.submit_input(0, input(1, [1.0, 0.0], true));
        world.submit_input(0, input(2, [0.0, 1.0], false));

        let pending = world.pending_input(0).unwrap();
        assert!(pending.jump);
        assert_eq!(pending.velocity, [0.0, 1.0]);

        world.apply_inputs();
        assert!(world.pending_input(0).is_none());
        let velocity = world.backend().kinematics(0).unwrap().velocity;
        assert!((velocity.y - JUMP_IMPULSE / PLAYER_MASS).abs() < 1e-5);

        // Consumed: the next input does not inherit it.
        world.submit_input(0, input(3, [0.0, 1.0], false));
        assert!(!world.pending_input(0).unwrap().jump);
    }

    #[test]
    fn test_input_sets_velocity_and_rotation() {
        let mut world = world_with(&[1]);
        world.submit_input(1, input(1, [0.0, -5.0], false));
        world.apply_inputs();

        let kinematics = world.backend().kinematics(1).unwrap();
        assert_eq!(kinematics.velocity, Vec3::new(0.0, 0.0, -MOVE_SPEED));
        assert_eq!(kinematics.rotation, 0.5);
    }

    #[test]
    fn test_update_steps_fixed_increments() {
        let mut world = world_with(&[0]);
        world.submit_input(0, input(1, [1.0, 0.0], false));

        assert_eq!(world.update(FIXED_DT * 2.5), 2);
        assert_eq!(world.update(FIXED_DT * 0.6), 1);

        let x = world.backend().kinematics(0).unwrap().position.x;
        assert!((x - MOVE_SPEED * FIXED_DT * 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_snapshot_covers_every_player() {
        let mut world = world_with(&[0, 3]);
        let snapshot = world.snapshot(1_000);
        assert_eq!(snapshot.server_time, 1_000);
        assert_eq!(snapshot.players.keys().copied().collect::<Vec<_>>(), vec![0, 3]);

        world.remove_player(0);
        assert_eq!(world.snapshot(1_125).players.len(), 1);
    }

    #[test]
    fn test_input_for_removed_player_is_dropped() {
        let mut world = world_with(&[2]);
        world.submit_input(2, input(1, [1.0, 0.0], true));
        world.remove_player(2);
        assert!(world.pending_input(2).is_none());
        world.apply_inputs();
        assert_eq!(world.player_count(), 0);
    }
}
