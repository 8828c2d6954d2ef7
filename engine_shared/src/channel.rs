//! Per-replicable channels: server-side delta computation, client-side
//! delta application, and shadow channels for replicables that have just
//! been destroyed.
//!
//! Grounded on `ReplicableChannelBase`/`ServerReplicableChannel`/
//! `ClientReplicableChannel`/`ShadowReplicableChannelBase` in the original
//! implementation's `channels.py`.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::bitfield::{FieldSpec, FlagSerialiser};
use crate::errors::DecodeError;
use crate::replicable::{PendingRpc, Replicable, Role};
use crate::schema::{ClassSchema, FunctionDescriptor};
use crate::serialise::AttrValue;
use crate::world::Netmode;
use std::sync::Arc;

/// A hash-like digest of an attribute value, used to detect whether it has
/// changed since the last time this channel replicated it. Values are
/// digested through their own `TypeFlag`'s wire encoding, so anything that
/// packs identically digests identically.
fn describe(value: &AttrValue, flag: &crate::serialise::TypeFlag) -> u64 {
    let mut buf = BytesMut::new();
    let _ = flag.pack(value, &mut buf);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    buf.as_ref().hash(&mut hasher);
    hasher.finish()
}

fn build_serialiser(schema: &ClassSchema) -> FlagSerialiser {
    let fields = schema
        .attributes
        .iter()
        .map(|a| FieldSpec::new(a.name.clone(), a.type_flag.clone()))
        .collect();
    FlagSerialiser::new(fields)
}

/// Whether `local_role` is the side a function targeting `target_netmode`
/// is allowed to execute on: `Netmode::Server` functions run only with
/// authority; `Netmode::Client` functions run only on the non-authority
/// (owning) peer.
fn role_permits(local_role: Role, target_netmode: Netmode) -> bool {
    match target_netmode {
        Netmode::Server => local_role == Role::Authority,
        Netmode::Client => local_role != Role::Authority,
    }
}

/// Decodes and dispatches a contiguous run of `[function_index][args]` RPC
/// calls, as produced by [`ServerReplicableChannel::dump_rpc_calls`] and its
/// `[replicable_id]` framing. `dispatch` is handed each call's function
/// descriptor, its argument bytes, and whether the call is authorized; it
/// must return the number of argument bytes it consumed so the cursor can
/// advance to the next call regardless of authorization.
///
/// A call executes only if the invoker has authority by role (see
/// [`role_permits`]) AND either the function is broadcastable or the
/// receiving peer is the replicable's owner. An unknown function index
/// aborts decoding the remainder of the body, since a contiguous run can no
/// longer be realigned once one call's length is unknown.
pub fn process_rpc_calls(
    schema: &ClassSchema,
    data: &[u8],
    local_role: Role,
    is_owner: bool,
    mut dispatch: impl FnMut(&FunctionDescriptor, &[u8], bool) -> Result<usize, DecodeError>,
) -> Result<(), DecodeError> {
    let mut offset = 0;
    while offset < data.len() {
        let function_index = data[offset];
        offset += 1;
        let Some(function) = schema.function_by_index(function_index) else {
            return Err(DecodeError::UnknownFunctionIndex(function_index));
        };
        let authorized = role_permits(local_role, function.target_netmode) && (function.broadcastable || is_owner);
        let consumed = dispatch(function, &data[offset..], authorized)?;
        offset += consumed;
    }
    Ok(())
}

/// Server-side per-(connection, replicable) channel: tracks the last
/// transmitted description of every attribute and drains the pending RPC
/// queue for framing.
pub struct ServerReplicableChannel {
    pub schema: Arc<ClassSchema>,
    serialiser: FlagSerialiser,
    last_replication_time: Option<Instant>,
    pub is_initial: bool,
    last_descriptions: HashMap<String, u64>,
    pub replication_update_period: Duration,
    pub base_priority: f64,
}

impl ServerReplicableChannel {
    pub fn new(schema: Arc<ClassSchema>, replication_update_period: Duration) -> Self {
        let serialiser = build_serialiser(&schema);
        // `flag_on_assignment` attributes are tracked by write-time version
        // counter (seeded at 0, matching a freshly constructed replicable's
        // `complain_version`), not by content hash.
        let last_descriptions = schema
            .attributes
            .iter()
            .map(|a| {
                let description = if a.flag_on_assignment { 0 } else { describe(&a.initial, &a.type_flag) };
                (a.name.clone(), description)
            })
            .collect();
        Self {
            schema,
            serialiser,
            last_replication_time: None,
            is_initial: true,
            last_descriptions,
            replication_update_period,
            base_priority: 1.0,
        }
    }

    pub fn is_awaiting_replication(&self, now: Instant) -> bool {
        if self.is_initial {
            return true;
        }
        match self.last_replication_time {
            None => true,
            Some(last) => now.duration_since(last) >= self.replication_update_period,
        }
    }

    /// Priority rises the longer a channel has waited past its update
    /// period, so starved channels eventually win the budget sort.
    pub fn priority(&self, now: Instant) -> f64 {
        let elapsed = match self.last_replication_time {
            None => return f64::INFINITY,
            Some(last) => now.duration_since(last).as_secs_f64(),
        };
        let period = self.replication_update_period.as_secs_f64().max(f64::EPSILON);
        self.base_priority + (elapsed / period - 1.0)
    }

    /// Computes the delta for this tick: attributes whose description
    /// changed since the last transmission, packed via the flag serialiser.
    /// Returns `None` if nothing changed (the dedup property).
    pub fn get_attributes(&mut self, replicable: &Replicable, is_owner: bool, now: Instant) -> Option<Bytes> {
        let can_replicate = replicable.can_replicate(is_owner, self.is_initial);

        let mut to_serialise: HashMap<String, Option<AttrValue>> = HashMap::new();
        for name in can_replicate {
            let Some(index) = self.schema.attribute_index(&name) else {
                continue;
            };
            let attr = &self.schema.attributes[index];
            let value = replicable.get(&name).cloned().unwrap_or_else(|| attr.initial.clone());

            // Complain attributes consult the per-instance write-time
            // counter instead of hashing the value lazily here.
            let new_description = if attr.flag_on_assignment {
                replicable.complain_version(index)
            } else {
                describe(&value, &attr.type_flag)
            };
            let last_description = self.last_descriptions.get(&name).copied();
            if last_description == Some(new_description) {
                continue;
            }

            self.last_descriptions.insert(name.clone(), new_description);
            to_serialise.insert(name, Some(value));
        }

        self.last_replication_time = Some(now);
        self.is_initial = false;

        if to_serialise.is_empty() {
            return None;
        }

        Some(Bytes::from(self.serialiser.pack(&to_serialise)))
    }

    /// Drains the replicable's pending RPC queue into concatenated
    /// `[function_index][args]` runs, split by reliability.
    pub fn dump_rpc_calls(&self, pending: &mut std::collections::VecDeque<PendingRpc>) -> (Bytes, Bytes) {
        let mut reliable = BytesMut::new();
        let mut unreliable = BytesMut::new();

        for (index, is_reliable, args) in pending.drain(..) {
            let target = if is_reliable { &mut reliable } else { &mut unreliable };
            target.extend_from_slice(&[index]);
            target.extend_from_slice(&args);
        }

        (reliable.freeze(), unreliable.freeze())
    }
}

/// Client-side channel: applies inbound deltas and collects attribute names
/// that require a notifier callback, in declaration order.
pub struct ClientReplicableChannel {
    pub schema: Arc<ClassSchema>,
    serialiser: FlagSerialiser,
    values: HashMap<String, AttrValue>,
}

impl ClientReplicableChannel {
    pub fn new(schema: Arc<ClassSchema>) -> Self {
        let serialiser = build_serialiser(&schema);
        let values = schema.attributes.iter().map(|a| (a.name.clone(), a.initial.clone())).collect();
        Self { schema, serialiser, values }
    }

    /// Applies an inbound attribute_update payload, returning the names of
    /// attributes that changed and are flagged `notify_on_replicated`, in
    /// the class's declaration order, plus the number of bytes consumed.
    pub fn read_attributes(&mut self, data: &[u8]) -> Result<(Vec<String>, usize), DecodeError> {
        let (updates, read) = self
            .serialiser
            .unpack(data, Some(&self.values))
            .map_err(|e| DecodeError::SerialisationFailure {
                what: self.schema.name.clone(),
                reason: e.to_string(),
            })?;

        let mut notify_names = Vec::new();
        let mut updated: HashMap<String, ()> = HashMap::new();
        for (name, value) in updates {
            if let Some(value) = value {
                self.values.insert(name.clone(), value);
            }
            updated.insert(name, ());
        }

        for attr in &self.schema.attributes {
            if updated.contains_key(&attr.name) && attr.notify_on_replicated {
                notify_names.push(attr.name.clone());
            }
        }

        Ok((notify_names, read))
    }

    pub fn value(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }
}

/// Placeholder retained after a replicable is destroyed, so late inbound
/// RPCs and acks targeting it can still be resolved without error during a
/// short grace window.
pub struct ShadowChannel {
    created_at: Instant,
    pub lifetime: Duration,
}

impl ShadowChannel {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            lifetime: Duration::from_secs(3),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.lifetime
    }
}

impl Default for ShadowChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicable::{Role, Roles};
    use crate::schema::AttributeDescriptor;
    use crate::serialise::{Constraint, TypeFlag};

    fn schema() -> Arc<ClassSchema> {
        Arc::new(ClassSchema::new(
            "Pawn",
            vec![
                AttributeDescriptor::new("health", TypeFlag::uint(Constraint::with_max_value(200)), AttrValue::UInt(100)).notify(),
                AttributeDescriptor::new("name", TypeFlag::string(32), AttrValue::Str(String::new())),
            ],
            vec![],
        ))
    }

    #[test]
    fn unchanged_attribute_emits_no_payload() {
        let schema = schema();
        let mut channel = ServerReplicableChannel::new(schema.clone(), Duration::from_millis(50));
        let mut replicable = Replicable::new(crate::replicable::ReplicableId(1), schema, Roles::new(Role::Authority, Role::SimulatedProxy), true);
        replicable.set("health", AttrValue::UInt(55));

        let now = Instant::now();
        let first = channel.get_attributes(&replicable, true, now);
        assert!(first.is_some(), "changed attribute must send on initial replication");

        let second = channel.get_attributes(&replicable, true, now);
        assert!(second.is_none(), "unchanged state must not re-send");
    }

    #[test]
    fn changed_attribute_round_trips_with_notify() {
        let schema = schema();
        let mut server_channel = ServerReplicableChannel::new(schema.clone(), Duration::from_millis(50));
        let mut replicable = Replicable::new(crate::replicable::ReplicableId(1), schema.clone(), Roles::new(Role::Authority, Role::SimulatedProxy), true);

        let now = Instant::now();
        let _ = server_channel.get_attributes(&replicable, true, now);

        replicable.set("health", AttrValue::UInt(42));
        let payload = server_channel.get_attributes(&replicable, true, now).expect("health changed");

        let mut client_channel = ClientReplicableChannel::new(schema);
        let (notify, read) = client_channel.read_attributes(&payload).unwrap();
        assert_eq!(read, payload.len());
        assert_eq!(notify, vec!["health".to_string()]);
        assert_eq!(client_channel.value("health"), Some(&AttrValue::UInt(42)));
    }

    #[test]
    fn complain_attribute_resends_even_when_rewritten_to_the_same_value() {
        let schema = Arc::new(ClassSchema::new(
            "Flagged",
            vec![AttributeDescriptor::new("hits", TypeFlag::uint(Constraint::with_max_value(200)), AttrValue::UInt(0)).complain()],
            vec![],
        ));
        let mut channel = ServerReplicableChannel::new(schema.clone(), Duration::from_millis(50));
        let mut replicable = Replicable::new(crate::replicable::ReplicableId(1), schema, Roles::new(Role::Authority, Role::SimulatedProxy), true);

        let now = Instant::now();
        let first = channel.get_attributes(&replicable, true, now);
        assert!(first.is_some(), "initial replication always sends");

        // Rewriting to the exact same value must still mark the attribute
        // dirty, because "complain" tracks writes, not content changes.
        replicable.set("hits", AttrValue::UInt(0));
        let second = channel.get_attributes(&replicable, true, now);
        assert!(second.is_some(), "a write must resend even without a value change");

        // Without a further write, the next tick has nothing new to send.
        let third = channel.get_attributes(&replicable, true, now);
        assert!(third.is_none());
    }

    #[test]
    fn shadow_channel_expires_after_lifetime() {
        let mut shadow = ShadowChannel::new();
        assert!(!shadow.is_expired());
        shadow.lifetime = Duration::from_secs(0);
        assert!(shadow.is_expired());
    }

    fn rpc_schema() -> ClassSchema {
        use crate::schema::FunctionDescriptor;
        use crate::world::Netmode;
        ClassSchema::new(
            "Weapon",
            vec![],
            vec![
                FunctionDescriptor::new("fire", vec![], Netmode::Server, false),
                FunctionDescriptor::new("ammo_update", vec![], Netmode::Client, false).broadcastable(),
            ],
        )
    }

    #[test]
    fn unauthorized_call_still_advances_the_cursor_but_does_not_execute() {
        let schema = rpc_schema();
        let fire_index = schema.function_index("fire").unwrap();
        // One byte of args, a non-owner caller: "fire" is not broadcastable
        // and targets the server, so a simulated proxy invoking it must be
        // decoded (cursor advances) without executing.
        let body = [fire_index, 0xAB];

        let mut executed = false;
        process_rpc_calls(&schema, &body, Role::Authority, false, |_function, args, authorized| {
            assert_eq!(args, &[0xAB]);
            if authorized {
                executed = true;
            }
            Ok(1)
        })
        .unwrap();

        assert!(!executed, "non-owner, non-broadcastable call must not execute");
    }

    #[test]
    fn owner_call_to_server_function_executes_when_role_has_authority() {
        let schema = rpc_schema();
        let fire_index = schema.function_index("fire").unwrap();
        let body = [fire_index, 0x01];

        let mut executed = false;
        process_rpc_calls(&schema, &body, Role::Authority, true, |_function, _args, authorized| {
            if authorized {
                executed = true;
            }
            Ok(1)
        })
        .unwrap();

        assert!(executed);
    }

    #[test]
    fn broadcastable_function_executes_without_ownership() {
        let schema = rpc_schema();
        let ammo_index = schema.function_index("ammo_update").unwrap();
        let body = [ammo_index, 0x02];

        let mut executed = false;
        process_rpc_calls(&schema, &body, Role::SimulatedProxy, false, |_function, _args, authorized| {
            if authorized {
                executed = true;
            }
            Ok(1)
        })
        .unwrap();

        assert!(executed);
    }

    #[test]
    fn unknown_function_index_aborts_remaining_body() {
        let schema = rpc_schema();
        let body = [200u8, 0x00];
        let result = process_rpc_calls(&schema, &body, Role::Authority, true, |_function, _args, _authorized| Ok(1));
        assert!(matches!(result, Err(DecodeError::UnknownFunctionIndex(200))));
    }
}
