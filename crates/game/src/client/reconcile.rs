use glam::Vec3;

use crate::net::{PlayerId, Snapshot};
use crate::sim::{Kinematics, SimulationBackend};

/// Below this distance the snapshot is taken as-is.
pub const ACCEPT_THRESHOLD: f32 = 0.01;
/// At or beyond this distance the entity jumps straight to the snapshot.
pub const BLEND_THRESHOLD: f32 = 0.8;
/// Cap on how far behind the client clock a snapshot may be projected, in
/// seconds.
pub const MAX_LOOKAHEAD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    Accept,
    /// Steer toward where the snapshot will be one tick from now.
    Blend { velocity: Vec3 },
    Teleport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Accept,
    Blend,
    Teleport,
}

pub fn classify(distance: f32) -> Band {
    if distance < ACCEPT_THRESHOLD {
        Band::Accept
    } else if distance < BLEND_THRESHOLD {
        Band::Blend
    } else {
        Band::Teleport
    }
}

/// Seconds to project a snapshot forward: how far it trails the client's
/// synchronized clock, clamped, plus one replication tick.
pub fn lookahead(client_time: u32, server_time: u32, tick_rate: u32) -> f32 {
    let behind_ms = client_time.wrapping_sub(server_time) as i32;
    let behind = (behind_ms as f32 / 1000.0).clamp(0.0, MAX_LOOKAHEAD);
    behind + 1.0 / tick_rate.max(1) as f32
}

/// Pulls every known entity toward the authoritative snapshot. Entries for
/// ids without a local entity are skipped.
pub fn reconcile<B: SimulationBackend>(
    backend: &mut B,
    snapshot: &Snapshot,
    client_time: u32,
    tick_rate: u32,
) -> Vec<(PlayerId, Correction)> {
    let mut corrections = Vec::with_capacity(snapshot.players.len());

    for (&id, &state) in &snapshot.players {
        let Some(current) = backend.kinematics(id) else {
            continue;
        };
        let authoritative = Kinematics::from(state);
        let distance = current.position.distance(authoritative.position);

        let band = classify(distance);
        let correction = match band {
            Band::Accept | Band::Teleport => {
                backend.set_kinematics(id, authoritative);
                backend.set_gravity_enabled(id, true);
                if band == Band::Accept {
                    Correction::Accept
                } else {
                    log::debug!("Player {} off by {:.2}, snapping", id, distance);
                    Correction::Teleport
                }
            }
            Band::Blend => {
                let horizon = lookahead(client_time, snapshot.server_time, tick_rate);
                let future = backend.speculate(authoritative, horizon);
                let velocity = (future - current.position) * tick_rate as f32;

                backend.set_kinematics(
                    id,
                    Kinematics {
                        position: current.position,
                        velocity,
                        rotation: authoritative.rotation,
                    },
                );
                backend.set_gravity_enabled(id, false);
                Correction::Blend { velocity }
            }
        };
        corrections.push((id, correction));
    }

    corrections
}
