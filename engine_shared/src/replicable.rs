//! Replicable instances, roles, and per-instance RPC queues.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::schema::ClassSchema;
use crate::serialise::AttrValue;

/// Unique id of a replicable within a scene (scene-scoped, 1 byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicableId(pub u8);

/// Role ordering: `None < DumbProxy < SimulatedProxy < AutonomousProxy < Authority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    None,
    DumbProxy,
    SimulatedProxy,
    AutonomousProxy,
    Authority,
}

/// A replicable's visibility/permission pair as seen from a given peer.
#[derive(Debug, Clone, Copy)]
pub struct Roles {
    pub local: Role,
    pub remote: Role,
}

impl Roles {
    pub fn new(local: Role, remote: Role) -> Self {
        Self { local, remote }
    }

    /// A peer only sees a replicable if its remote role is not `None`.
    pub fn visible_to_remote(&self) -> bool {
        self.remote != Role::None
    }
}

/// A queued outgoing RPC invocation: `(function_index, reliable, args)`.
pub type PendingRpc = (u8, bool, Bytes);

/// A network object: a class, an attribute value vector, an RPC queue, an
/// owner back-reference, and roles.
pub struct Replicable {
    pub id: ReplicableId,
    pub schema: Arc<ClassSchema>,
    pub values: Vec<AttrValue>,
    pub owner: Option<ReplicableId>,
    pub roles: Roles,
    pub is_dynamic: bool,
    pub pending_rpcs: VecDeque<PendingRpc>,
    /// Per-attribute write counter for `flag_on_assignment` ("complain")
    /// attributes, bumped on every [`Replicable::set`] call regardless of
    /// whether the new value differs from the old one. The channel compares
    /// this counter instead of hashing the value at replication time, per
    /// the design notes' "updated on every write" requirement.
    complain_versions: Vec<u64>,
}

impl Replicable {
    /// Creates an instance with every attribute slot deep-copied from the
    /// class schema's declared initial value.
    pub fn new(id: ReplicableId, schema: Arc<ClassSchema>, roles: Roles, is_dynamic: bool) -> Self {
        let values = schema.attributes.iter().map(|a| a.initial.clone()).collect();
        let complain_versions = vec![0u64; schema.attributes.len()];
        Self {
            id,
            schema,
            values,
            owner: None,
            roles,
            is_dynamic,
            pending_rpcs: VecDeque::new(),
            complain_versions,
        }
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        let index = self.schema.attribute_index(name)?;
        self.values.get(index)
    }

    pub fn set(&mut self, name: &str, value: AttrValue) -> bool {
        let Some(index) = self.schema.attribute_index(name) else {
            return false;
        };
        self.values[index] = value;
        if self.schema.attributes[index].flag_on_assignment {
            self.complain_versions[index] = self.complain_versions[index].wrapping_add(1);
        }
        true
    }

    /// The write-time version counter for the attribute at `index`, used by
    /// the channel in place of a content hash for `flag_on_assignment`
    /// attributes.
    pub fn complain_version(&self, index: usize) -> u64 {
        self.complain_versions.get(index).copied().unwrap_or(0)
    }

    /// Queues an outgoing RPC call for transmission on the next channel
    /// flush. `reliable` is dictated by the declaring function's
    /// reliability, not the caller.
    pub fn call_rpc(&mut self, function_index: u8, reliable: bool, args: Bytes) {
        self.pending_rpcs.push_back((function_index, reliable, args));
    }

    /// Names of attributes eligible for replication given role context and
    /// whether this is the channel's initial replication.
    ///
    /// Default policy (no per-attribute condition registered): every
    /// attribute is eligible. Classes that need relevance-by-owner or
    /// relevance-by-role filtering register a [`crate::schema::ReplicationCondition`]
    /// on the attribute descriptor.
    pub fn can_replicate(&self, is_owner: bool, is_initial: bool) -> Vec<String> {
        self.schema
            .attributes
            .iter()
            .filter(|attr| match &attr.condition {
                Some(cond) => cond(is_owner, is_initial),
                None => true,
            })
            .map(|attr| attr.name.clone())
            .collect()
    }
}
