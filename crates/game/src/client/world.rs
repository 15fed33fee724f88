use glam::Vec3;

use super::reconcile::{reconcile, Correction};
use crate::net::{InputUpdate, PlayerId, Snapshot};
use crate::sim::{movement_velocity, Kinematics, SimulationBackend, FIXED_DT, JUMP_IMPULSE};

/// The client's copy of the world: every known player as a backend entity,
/// the local one driven directly by input and all of them pulled toward
/// server snapshots.
pub struct ClientWorld<B> {
    backend: B,
    local_id: Option<PlayerId>,
    tick_rate: u32,
    accumulator: f32,
}

impl<B: SimulationBackend> ClientWorld<B> {
    pub fn new(backend: B, tick_rate: u32) -> Self {
        Self {
            backend,
            local_id: None,
            tick_rate,
            accumulator: 0.0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn local_id(&self) -> Option<PlayerId> {
        self.local_id
    }

    pub fn players(&self) -> Vec<PlayerId> {
        self.backend.entity_ids()
    }

    pub fn kinematics(&self, id: PlayerId) -> Option<Kinematics> {
        self.backend.kinematics(id)
    }

    /// Adopts the id the server assigned and creates an entity for everyone
    /// already in the game, this client included.
    pub fn join(&mut self, player_id: PlayerId, active_players: &[PlayerId]) {
        self.local_id = Some(player_id);
        self.backend.create_entity(player_id);
        for &id in active_players {
            self.backend.create_entity(id);
        }
    }

    pub fn add_player(&mut self, id: PlayerId) {
        self.backend.create_entity(id);
    }

    pub fn remove_player(&mut self, id: PlayerId) {
        if self.local_id == Some(id) {
            log::warn!("Server reported our own player {} leaving", id);
        }
        self.backend.destroy_entity(id);
    }

    /// Predicts the local player's response to `input` without waiting for
    /// the server.
    pub fn apply_local_input(&mut self, input: &InputUpdate) {
        let Some(id) = self.local_id else {
            return;
        };
        let Some(current) = self.backend.kinematics(id) else {
            return;
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
            self.backend.apply_impulse(id, Vec3::new(0.0, JUMP_IMPULSE, 0.0));
        }
    }

    pub fn update(&mut self, frame_time: f32) -> u32 {
        self.accumulator += frame_time;
        let mut steps = 0;
        while self.accumulator >= FIXED_DT {
            self.accumulator -= FIXED_DT;
            self.backend.step(FIXED_DT);
            steps += 1;
        }
        steps
    }

    pub fn reconcile(&mut self, snapshot: &Snapshot, client_time: u32) -> Vec<(PlayerId, Correction)> {
        reconcile(&mut self.backend, snapshot, client_time, self.tick_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::PlayerState;
    use crate::sim::{spawn_position, KinematicWorld, MOVE_SPEED};

    fn joined() -> ClientWorld<KinematicWorld> {
        let mut world = ClientWorld::new(KinematicWorld::new(), 8);
        world.join(1, &[0, 1, 3]);
        world
    }

    #[test]
    fn test_join_creates_roster() {
        let world = joined();

        assert_eq!(world.local_id(), Some(1));
        assert_eq!(world.players(), vec![0, 1, 3]);
    }

    #[test]
    fn test_roster_follows_notices() {
        let mut world = joined();
        world.add_player(4);
        world.remove_player(0);

        assert_eq!(world.players(), vec![1, 3, 4]);
    }

    #[test]
    fn test_local_input_moves_only_local_player() {
        let mut world = joined();
        world.apply_local_input(&InputUpdate {
            local_time: 10,
            velocity: [0.0, -2.0],
            rotation: 0.25,
            jump: false,
        });
        world.update(0.5);

        let local = world.kinematics(1).unwrap();
        assert_eq!(local.velocity, Vec3::new(0.0, 0.0, -MOVE_SPEED));
        assert!(local.position.z < spawn_position(1).z);
        assert_eq!(local.rotation, 0.25);
        assert_eq!(world.kinematics(3).unwrap().position, spawn_position(3));
    }

    #[test]
    fn test_input_before_join_is_ignored() {
        let mut world = ClientWorld::new(KinematicWorld::new(), 8);
        world.apply_local_input(&InputUpdate {
            local_time: 1,
            velocity: [1.0, 0.0],
            rotation: 0.0,
            jump: true,
        });

        assert!(world.players().is_empty());
    }

    #[test]
    fn test_snapshot_corrects_remote_player() {
        let mut world = joined();
        let mut snapshot = Snapshot {
            server_time: 100,
            ..Snapshot::default()
        };
        snapshot.players.insert(
            3,
            PlayerState {
                position: [9.0, 1.25, 9.0],
                velocity: [0.0; 3],
                rotation: 0.0,
            },
        );

        let corrections = world.reconcile(&snapshot, 100);

        assert_eq!(corrections, vec![(3, Correction::Teleport)]);
        assert_eq!(
            world.kinematics(3).unwrap().position,
            Vec3::new(9.0, 1.25, 9.0)
        );
    }
}
