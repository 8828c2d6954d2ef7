//! Physics abstraction.
//!
//! The concrete physics implementation (collision shapes, solver,
//! broadphase) is an engine integration detail and out of scope for the
//! replication core; what's specified here is the collaborator surface the
//! core depends on: a deterministic step, impulses/velocity for prediction,
//! and ray casts + a contact stream for lag-compensated hit validation.

use crate::{ecs::EntityId, ecs::World, math::Vec3};

/// Physics parameters.
#[derive(Debug, Clone, Copy)]
pub struct PhysicsConfig {
    pub gravity: Vec3,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, 0.0, -9.81),
        }
    }
}

/// Bitmask groups used by `collision_group`/`collision_mask` filtering.
pub type CollisionGroup = u32;

/// Result of a ray test against the physics world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub entity: EntityId,
    pub point: Vec3,
    pub normal: Vec3,
    pub distance: f32,
}

/// A contact begin/end event, pushed to the per-step contact stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContactEvent {
    Began { a: EntityId, b: EntityId },
    Ended { a: EntityId, b: EntityId },
}

/// Physics stepper trait: the engine collaborator consumed by the
/// prediction/reconciliation loop and by rewind hit validation.
pub trait PhysicsBackend: Send + Sync {
    fn step(&mut self, world: &mut World, dt_sec: f32);

    fn world_velocity(&self, entity: EntityId) -> Vec3 {
        let _ = entity;
        Vec3::ZERO
    }

    fn world_angular(&self, entity: EntityId) -> Vec3 {
        let _ = entity;
        Vec3::ZERO
    }

    fn mass(&self, entity: EntityId) -> f32 {
        let _ = entity;
        1.0
    }

    fn apply_impulse(&mut self, entity: EntityId, impulse: Vec3) {
        let _ = (entity, impulse);
    }

    /// Casts a ray from `origin` along `direction` (expected normalized) up
    /// to `max_distance`, honoring `mask` against each candidate's
    /// `collision_group`. Used by rewind hit validation: the caller first
    /// rolls the world back to a past tick, then calls this, then restores.
    fn ray_test(&self, origin: Vec3, direction: Vec3, max_distance: f32, mask: CollisionGroup) -> Option<RayHit> {
        let _ = (origin, direction, max_distance, mask);
        None
    }

    fn collision_group(&self, entity: EntityId) -> CollisionGroup {
        let _ = entity;
        0
    }

    fn collision_mask(&self, entity: EntityId) -> CollisionGroup {
        let _ = entity;
        u32::MAX
    }

    /// Contacts that began or ended during the most recent `step`.
    fn drain_contacts(&mut self) -> Vec<ContactEvent> {
        Vec::new()
    }
}

/// No-op physics, used in tests and as the default before an engine
/// integration is wired in.
#[derive(Default)]
pub struct NullPhysics;

impl PhysicsBackend for NullPhysics {
    fn step(&mut self, _world: &mut World, _dt_sec: f32) {}
}

/// Animation layer playback mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayMode {
    Play,
    Loop,
    PingPong,
}

/// How a layer's pose blends with layers below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Interpolate,
    Add,
}

/// Animation collaborator: per-layer clip playback, queried by the rewind
/// system so a ring-buffer snapshot can capture "active animation + frame"
/// alongside position/orientation.
pub trait AnimationBackend: Send + Sync {
    fn play(
        &mut self,
        entity: EntityId,
        name: &str,
        start: f32,
        end: f32,
        layer: u8,
        mode: PlayMode,
        blend: BlendMode,
        weight: f32,
        speed: f32,
    );

    fn stop(&mut self, entity: EntityId, layer: u8);
    fn is_playing(&self, entity: EntityId, layer: u8) -> bool;
    fn current_frame(&self, entity: EntityId, layer: u8) -> Option<f32>;
}

/// No-op animation backend.
#[derive(Default)]
pub struct NullAnimation;

impl AnimationBackend for NullAnimation {
    fn play(
        &mut self,
        _entity: EntityId,
        _name: &str,
        _start: f32,
        _end: f32,
        _layer: u8,
        _mode: PlayMode,
        _blend: BlendMode,
        _weight: f32,
        _speed: f32,
    ) {
    }

    fn stop(&mut self, _entity: EntityId, _layer: u8) {}

    fn is_playing(&self, _entity: EntityId, _layer: u8) -> bool {
        false
    }

    fn current_frame(&self, _entity: EntityId, _layer: u8) -> Option<f32> {
        None
    }
}

/// Transform hierarchy collaborator: world position/orientation plus
/// parenting, as consumed by rewind snapshots and RPC-driven attachment.
pub trait TransformBackend: Send + Sync {
    fn world_position(&self, entity: EntityId) -> Vec3;
    fn world_orientation(&self, entity: EntityId) -> crate::math::Quat;
    fn parent(&self, entity: EntityId) -> Option<EntityId>;
    fn set_parent(&mut self, entity: EntityId, parent: Option<EntityId>);
    fn set_world_position(&mut self, entity: EntityId, position: Vec3);
    fn set_world_orientation(&mut self, entity: EntityId, orientation: crate::math::Quat);
}
