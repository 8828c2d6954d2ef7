//! Per-class replication schema.
//!
//! A [`ClassSchema`] is built once, at type-registration time (not via
//! reflection or decorators): an attribute table plus a function table,
//! with replicated functions getting a stable index equal to their
//! position in the sorted-name order within their declaring class.

use std::collections::HashMap;
use std::sync::Arc;

use crate::serialise::{AttrValue, TypeFlag};
use crate::world::Netmode;

/// A closure deciding whether an attribute is eligible for replication
/// given `(is_owner, is_initial)`. Registered per-attribute so that a
/// class can express "owner only" or "initial only" fields without a
/// reflection layer.
pub type ReplicationCondition = Arc<dyn Fn(bool, bool) -> bool + Send + Sync>;

/// Declares one replicated attribute: its wire type, initial value, and
/// notification/complaint behaviour.
#[derive(Clone)]
pub struct AttributeDescriptor {
    pub name: String,
    pub type_flag: TypeFlag,
    pub initial: AttrValue,
    /// Invoke the instance's `on_replicated` hook after this attribute is
    /// applied from an inbound update.
    pub notify_on_replicated: bool,
    /// "Complain" attributes update their digest at write time (via the
    /// channel's per-instance write tracking) instead of being hashed lazily
    /// at replication time.
    pub flag_on_assignment: bool,
    pub condition: Option<ReplicationCondition>,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, type_flag: TypeFlag, initial: AttrValue) -> Self {
        Self {
            name: name.into(),
            type_flag,
            initial,
            notify_on_replicated: false,
            flag_on_assignment: false,
            condition: None,
        }
    }

    pub fn notify(mut self) -> Self {
        self.notify_on_replicated = true;
        self
    }

    pub fn complain(mut self) -> Self {
        self.flag_on_assignment = true;
        self
    }

    pub fn with_condition(mut self, condition: ReplicationCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Declares one replicated function: its ordered parameter list, the
/// netmode it targets, and its reliability.
#[derive(Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub params: Vec<(String, TypeFlag)>,
    pub target_netmode: Netmode,
    pub reliable: bool,
    /// Assigned by [`ClassSchema::new`] from sorted name order.
    pub index: u8,
    /// If true, any peer with visibility may invoke it; otherwise only the
    /// owning peer may.
    pub broadcastable: bool,
}

impl FunctionDescriptor {
    pub fn new(
        name: impl Into<String>,
        params: Vec<(String, TypeFlag)>,
        target_netmode: Netmode,
        reliable: bool,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            target_netmode,
            reliable,
            index: 0,
            broadcastable: false,
        }
    }

    pub fn broadcastable(mut self) -> Self {
        self.broadcastable = true;
        self
    }
}

/// Per-class attribute table + function table, built once at registration.
pub struct ClassSchema {
    pub name: String,
    pub attributes: Vec<AttributeDescriptor>,
    pub functions: Vec<FunctionDescriptor>,
    attribute_index: HashMap<String, usize>,
    function_index: HashMap<String, u8>,
}

impl ClassSchema {
    pub fn new(
        name: impl Into<String>,
        attributes: Vec<AttributeDescriptor>,
        mut functions: Vec<FunctionDescriptor>,
    ) -> Self {
        // Stable index = position in sorted-name order.
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        for (i, f) in functions.iter_mut().enumerate() {
            f.index = i as u8;
        }

        let attribute_index = attributes
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.clone(), i))
            .collect();
        let function_index = functions.iter().map(|f| (f.name.clone(), f.index)).collect();

        Self {
            name: name.into(),
            attributes,
            functions,
            attribute_index,
            function_index,
        }
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attribute_index.get(name).copied()
    }

    pub fn function_index(&self, name: &str) -> Option<u8> {
        self.function_index.get(name).copied()
    }

    pub fn function_by_index(&self, index: u8) -> Option<&FunctionDescriptor> {
        self.functions.get(index as usize)
    }
}

/// Process-wide map of class name to its schema, populated once at
/// start-up by an explicit registration step (never via reflection).
#[derive(Default)]
pub struct TypeRegistry {
    classes: HashMap<String, Arc<ClassSchema>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: ClassSchema) -> Arc<ClassSchema> {
        let schema = Arc::new(schema);
        self.classes.insert(schema.name.clone(), schema.clone());
        schema
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClassSchema>> {
        self.classes.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialise::Constraint;

    #[test]
    fn functions_get_stable_sorted_indices() {
        let schema = ClassSchema::new(
            "Weapon",
            vec![],
            vec![
                FunctionDescriptor::new("fire", vec![], Netmode::Server, true),
                FunctionDescriptor::new("ammo_update", vec![], Netmode::Client, false),
                FunctionDescriptor::new("equip", vec![], Netmode::Server, true),
            ],
        );

        assert_eq!(schema.function_index("ammo_update"), Some(0));
        assert_eq!(schema.function_index("equip"), Some(1));
        assert_eq!(schema.function_index("fire"), Some(2));
    }

    #[test]
    fn registry_lookup_by_name() {
        let mut registry = TypeRegistry::new();
        let schema = ClassSchema::new(
            "Pawn",
            vec![AttributeDescriptor::new(
                "health",
                TypeFlag::uint(Constraint::with_max_value(200)),
                AttrValue::UInt(100),
            )],
            vec![],
        );
        registry.register(schema);

        let found = registry.get("Pawn").expect("schema registered");
        assert_eq!(found.attribute_index("health"), Some(0));
        assert!(registry.get("Missing").is_none());
    }
}
