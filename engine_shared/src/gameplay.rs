//! Canonical class schemas shared by client and server.
//!
//! Both ends of the wire need the *same* [`ClassSchema`] for a class to
//! agree on attribute order and function indices, so the schemas live here
//! rather than being built independently by each crate. Grounded on the
//! attribute/function tables `original_source/game_system/entities.py`
//! registers for its pawn/controller/replication-info classes; position is
//! split into three `Float` attributes since [`AttrValue`] has no native
//! vector variant.

use std::sync::Arc;

use crate::replicable::ReplicableId;
use crate::schema::{AttributeDescriptor, ClassSchema, FunctionDescriptor, ReplicationCondition, TypeRegistry};
use crate::serialise::{AttrValue, Constraint, TypeFlag};
use crate::world::Netmode;

/// The owning client predicts its own pawn's pose locally and corrects it
/// via `correct_move`; it has no use for the server's unconditional
/// attribute replication of the same fields, so those attributes skip the
/// owner the way a `COND_SkipOwner` replication condition would.
fn skip_owner() -> ReplicationCondition {
    Arc::new(|is_owner: bool, _is_initial: bool| !is_owner)
}

pub const PAWN_CLASS: &str = "Pawn";
pub const CONTROLLER_CLASS: &str = "PlayerController";
pub const CLOCK_CLASS: &str = "Clock";

pub const ATTR_HEALTH: &str = "health";
pub const ATTR_POSITION_X: &str = "position_x";
pub const ATTR_POSITION_Y: &str = "position_y";
pub const ATTR_POSITION_Z: &str = "position_z";
pub const ATTR_YAW: &str = "yaw";
pub const ATTR_PAWN: &str = "pawn";
pub const ATTR_ELAPSED: &str = "elapsed";

/// Client-to-server: upload a predicted move for the server to validate.
pub const FN_SUBMIT_MOVE: &str = "submit_move";
/// Server-to-client: the client's predicted pose diverged past tolerance.
pub const FN_CORRECT_MOVE: &str = "correct_move";

/// Forced id for the singleton clock replicable (see
/// [`crate::scene::MAX_REPLICABLES`]; 255 is reserved from dynamic
/// allocation precisely so a well-known singleton can claim it).
pub const CLOCK_REPLICABLE_ID: ReplicableId = ReplicableId(255);

/// A pawn's position/orientation/health, owned and predicted by its
/// controlling client (`Role::AutonomousProxy`) and authoritative on the
/// server (`Role::Authority`).
pub fn pawn_schema() -> ClassSchema {
    ClassSchema::new(
        PAWN_CLASS,
        vec![
            AttributeDescriptor::new(ATTR_HEALTH, TypeFlag::uint(Constraint::with_max_value(1000)), AttrValue::UInt(100)),
            AttributeDescriptor::new(ATTR_POSITION_X, TypeFlag::float(true), AttrValue::Float(0.0)).with_condition(skip_owner()),
            AttributeDescriptor::new(ATTR_POSITION_Y, TypeFlag::float(true), AttrValue::Float(0.0)).with_condition(skip_owner()),
            AttributeDescriptor::new(ATTR_POSITION_Z, TypeFlag::float(true), AttrValue::Float(0.0)).with_condition(skip_owner()),
            AttributeDescriptor::new(ATTR_YAW, TypeFlag::float(true), AttrValue::Float(0.0)).with_condition(skip_owner()),
        ],
        vec![
            FunctionDescriptor::new(FN_SUBMIT_MOVE, vec![], Netmode::Server, false),
            FunctionDescriptor::new(FN_CORRECT_MOVE, vec![], Netmode::Client, true),
        ],
    )
}

/// The connection's root replicable: owns a reference to its pawn. Carries
/// no movement state of its own.
pub fn controller_schema() -> ClassSchema {
    ClassSchema::new(
        CONTROLLER_CLASS,
        vec![AttributeDescriptor::new(ATTR_PAWN, TypeFlag::replicable(), AttrValue::Replicable(None)).notify()],
        vec![],
    )
}

/// Singleton server clock, forced onto [`CLOCK_REPLICABLE_ID`] so every
/// client can find it without a name lookup.
pub fn clock_schema() -> ClassSchema {
    ClassSchema::new(
        CLOCK_CLASS,
        vec![AttributeDescriptor::new(ATTR_ELAPSED, TypeFlag::float(true), AttrValue::Float(0.0))],
        vec![],
    )
}

/// Registers the gameplay schemas used by this crate's client and server
/// binaries, returning them in declaration order.
pub fn register_gameplay_schemas(registry: &mut TypeRegistry) -> (Arc<ClassSchema>, Arc<ClassSchema>, Arc<ClassSchema>) {
    let pawn = registry.register(pawn_schema());
    let controller = registry.register(controller_schema());
    let clock = registry.register(clock_schema());
    (pawn, controller, clock)
}
