//! A scene: the live set of replicables, their id pool, and the bus
//! carrying lifecycle notifications to channels and game logic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::event::EventBus;
use crate::replicable::{Replicable, ReplicableId, Roles};
use crate::schema::ClassSchema;

pub const MAX_REPLICABLES: usize = 255;

/// Emitted on the scene's event bus whenever a replicable is registered.
#[derive(Debug, Clone, Copy)]
pub struct ReplicableAdded(pub ReplicableId);

/// Emitted on the scene's event bus whenever a replicable is removed.
#[derive(Debug, Clone, Copy)]
pub struct ReplicableRemoved(pub ReplicableId);

/// The live object graph for one session. Ids below 255 are dynamically
/// allocated on a first-free basis; id 255 is reserved for the singleton
/// scene-info replicable (clock, tick rate) and is never handed out by
/// [`Scene::take_free_id`].
pub struct Scene {
    replicables: HashMap<ReplicableId, Replicable>,
    /// True for ids owned by local authority that may be reassigned if an
    /// incoming authoritative create contests them.
    locally_authoritative: HashSet<ReplicableId>,
    pub events: EventBus,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            replicables: HashMap::new(),
            locally_authoritative: HashSet::new(),
            events: EventBus::default(),
        }
    }

    /// Finds the lowest unused id in `0..255`.
    pub fn take_free_id(&self) -> Option<ReplicableId> {
        (0..MAX_REPLICABLES as u16)
            .map(|v| ReplicableId(v as u8))
            .find(|id| !self.replicables.contains_key(id))
    }

    /// Registers a replicable created locally (the caller is authoritative
    /// over it and it may be reassigned if contested by an incoming id).
    pub fn add_local(&mut self, schema: Arc<ClassSchema>, roles: Roles) -> Option<ReplicableId> {
        let id = self.take_free_id()?;
        self.locally_authoritative.insert(id);
        self.insert(Replicable::new(id, schema, roles, true));
        Some(id)
    }

    /// Registers a replicable with an id dictated by an incoming network
    /// message. If `id` is already occupied by a locally-authoritative
    /// (i.e. not yet confirmed by the remote authority) replicable, that
    /// replicable is reassigned to a fresh free id before the incoming one
    /// takes its place - this is id contest.
    pub fn add_remote(&mut self, id: ReplicableId, schema: Arc<ClassSchema>, roles: Roles) -> Result<(), &'static str> {
        if let Some(existing_id) = self.replicables.contains_key(&id).then_some(id) {
            if !self.locally_authoritative.contains(&existing_id) {
                return Err("id already owned by a confirmed remote replicable");
            }
            let Some(new_id) = (0..MAX_REPLICABLES as u16)
                .map(|v| ReplicableId(v as u8))
                .find(|candidate| *candidate != id && !self.replicables.contains_key(candidate))
            else {
                return Err("no free id to contest into");
            };
            let mut contested = self.replicables.remove(&existing_id).expect("checked above");
            self.locally_authoritative.remove(&existing_id);
            self.events.push(ReplicableRemoved(existing_id));
            contested.id = new_id;
            self.locally_authoritative.insert(new_id);
            self.replicables.insert(new_id, contested);
            self.events.push(ReplicableAdded(new_id));
            debug!(old = existing_id.0, new = new_id.0, "replicable id contested");
        }

        self.insert(Replicable::new(id, schema, roles, true));
        Ok(())
    }

    fn insert(&mut self, replicable: Replicable) {
        let id = replicable.id;
        self.replicables.insert(id, replicable);
        self.events.push(ReplicableAdded(id));
    }

    pub fn remove(&mut self, id: ReplicableId) -> Option<Replicable> {
        self.locally_authoritative.remove(&id);
        let removed = self.replicables.remove(&id);
        if removed.is_some() {
            self.events.push(ReplicableRemoved(id));
        }
        removed
    }

    pub fn get(&self, id: ReplicableId) -> Option<&Replicable> {
        self.replicables.get(&id)
    }

    pub fn get_mut(&mut self, id: ReplicableId) -> Option<&mut Replicable> {
        self.replicables.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Replicable> {
        self.replicables.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Replicable> {
        self.replicables.values_mut()
    }

    pub fn len(&self) -> usize {
        self.replicables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicables.is_empty()
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}
