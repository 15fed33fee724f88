use glam::Vec3;
use rapier3d::prelude::*;

use crate::sim::FIXED_DT;

/// Smallest leftover step worth integrating.
const MIN_REMAINDER: Real = 1e-5;

pub struct PhysicsWorld {
    pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    pub bodies: RigidBodySet,
    pub colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    gravity: Vector,
}

impl Default for PhysicsWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsWorld {
    pub fn new() -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = FIXED_DT;

        Self {
            pipeline: PhysicsPipeline::new(),
            integration_parameters,
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            gravity: Vector::new(0.0, crate::sim::GRAVITY, 0.0),
        }
    }

    /// The shared level: a ground slab and one block beside the spawn row.
    pub fn with_arena() -> Self {
        let mut world = Self::new();
        world.add_static_box(Vec3::ZERO, Vec3::new(30.0, 0.5, 30.0));
        world.add_static_box(Vec3::new(2.0, 1.0, 0.0), Vec3::splat(0.5));
        world
    }

    pub fn step(&mut self) {
        self.pipeline.step(
            self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            &(),
            &(),
        );
    }

    /// Advances by `dt` seconds: whole fixed steps, then one shorter step for
    /// what is left over.
    pub fn advance(&mut self, dt: Real) {
        if dt <= 0.0 {
            return;
        }

        let whole = (dt / FIXED_DT).floor();
        for _ in 0..whole as u32 {
            self.step();
        }

        let remainder = dt - whole * FIXED_DT;
        if remainder > MIN_REMAINDER {
            self.integration_parameters.dt = remainder;
            self.step();
            self.integration_parameters.dt = FIXED_DT;
        }
    }

    pub fn add_static_box(&mut self, position: Vec3, half_extents: Vec3) -> ColliderHandle {
        let collider = ColliderBuilder::cuboid(half_extents.x, half_extents.y, half_extents.z)
            .translation(Vector::new(position.x, position.y, position.z))
            .build();
        self.colliders.insert(collider)
    }

    /// A dynamic box that never tips over. Friction is zero so a body keeps
    /// the velocity it was given while sliding on the ground.
    pub fn add_player(&mut self, position: Vec3, half_extents: Vec3) -> RigidBodyHandle {
        let body = RigidBodyBuilder::dynamic()
            .translation(Vector::new(position.x, position.y, position.z))
            .lock_rotations()
            .build();

        let handle = self.bodies.insert(body);

        let collider = ColliderBuilder::cuboid(half_extents.x, half_extents.y, half_extents.z)
            .friction(0.0)
            .restitution(0.0)
            .build();

        self.colliders
            .insert_with_parent(collider, handle, &mut self.bodies);

        handle
    }

    pub fn remove_body(&mut self, handle: RigidBodyHandle) {
        self.bodies.remove(
            handle,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
    }

    pub fn set_body_pose(&mut self, handle: RigidBodyHandle, position: Vec3, yaw: Real) {
        if let Some(body) = self.bodies.get_mut(handle) {
            let half = yaw * 0.5;
            let rot = Rotation::from_xyzw(0.0, half.sin(), 0.0, half.cos()).normalize();
            let new_pose = Pose::from_parts(Vector::new(position.x, position.y, position.z), rot);
            body.set_position(new_pose, true);
        }
    }

    pub fn set_body_velocity(&mut self, handle: RigidBodyHandle, velocity: Vec3) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_linvel(Vector::new(velocity.x, velocity.y, velocity.z), true);
        }
    }

    pub fn set_gravity_scale(&mut self, handle: RigidBodyHandle, scale: Real) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_gravity_scale(scale, true);
        }
    }

    pub fn apply_impulse(&mut self, handle: RigidBodyHandle, impulse: Vec3) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.apply_impulse(Vector::new(impulse.x, impulse.y, impulse.z), true);
        }
    }

    pub fn body_position(&self, handle: RigidBodyHandle) -> Option<Vec3> {
        self.bodies.get(handle).map(|b| {
            let t = b.translation();
            Vec3::new(t.x, t.y, t.z)
        })
    }

    pub fn body_velocity(&self, handle: RigidBodyHandle) -> Option<Vec3> {
        self.bodies.get(handle).map(|b| {
            let v = b.linvel();
            Vec3::new(v.x, v.y, v.z)
        })
    }
}
