//! Server implementation.
//!
//! Owns the authoritative [`engine_shared::scene::Scene`], one
//! [`engine_shared::connection::Connection`] and
//! [`engine_shared::handshake::ServerHandshake`] per peer, and the
//! per-connection [`ServerSceneChannel`] that packs deltas under a bandwidth
//! budget. Each [`GameServer::step`] runs one fixed-timestep tick in the
//! order the design notes fix: receive, decode and dispatch inbound
//! datagrams; apply the tick's validated moves; step the clock; record
//! rewind history; then collect and send outbound deltas.
//!
//! This implementation assumes a single locally-controlled pawn per
//! connection (see the matching note on [`engine_client::client::GameClient`]):
//! every spawned pawn/controller pair is given `Role::AutonomousProxy` as
//! its remote role regardless of which connection owns it, so relevance
//! filtering doesn't distinguish between viewers. A deployment with more
//! than one simultaneous client visible to each other would need per-viewer
//! role resolution; out of scope for this harness.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use tracing::{debug, info, warn};

use engine_shared::channel::process_rpc_calls;
use engine_shared::clock::ServerClock;
use engine_shared::config::EngineConfig;
use engine_shared::connection::Connection;
use engine_shared::console::{Console, CvarFlags, CvarValue};
use engine_shared::errors::NetworkError;
use engine_shared::gameplay::{
    register_gameplay_schemas, ATTR_ELAPSED, ATTR_PAWN, ATTR_POSITION_X, ATTR_POSITION_Y, ATTR_POSITION_Z, ATTR_YAW,
    CLOCK_REPLICABLE_ID, FN_CORRECT_MOVE, FN_SUBMIT_MOVE,
};
use engine_shared::handshake::{parse_request_netmode, HandshakeState, ServerHandshake};
use engine_shared::math::{Quat, Vec3};
use engine_shared::movement::{integrate, PlayerMove};
use engine_shared::net::GameSocket;
use engine_shared::packet::{DecodedPacket, ProtocolId};
use engine_shared::replicable::{Replicable, ReplicableId, Role, Roles};
use engine_shared::replication_manager::ServerSceneChannel;
use engine_shared::schema::{ClassSchema, TypeRegistry};
use engine_shared::serialise::AttrValue;
use engine_shared::world::{Netmode, PermissiveRules, Rules, World};

use crate::jitter::{BufferedMove, JitterBuffer};
use crate::reconcile::{Reconciler, ServerMoveResult};
use crate::rewind::{PawnSnapshot, RewindBuffer};

/// Per-peer server-side connection state.
struct ClientConnection {
    connection: Connection,
    handshake: ServerHandshake,
    scene_channel: ServerSceneChannel,
    jitter: JitterBuffer,
    reconciler: Reconciler,
    controller_id: Option<ReplicableId>,
    pawn_id: Option<ReplicableId>,
    /// Set once the client's handshake is rejected or it disconnects; the
    /// connection is reaped on the next tick after at least one flush, so
    /// the rejecting datagram has a chance to go out first.
    pending_removal: bool,
}

impl ClientConnection {
    fn new(replication_update_period: Duration, jitter_capacity: usize) -> Self {
        Self {
            connection: Connection::new(),
            handshake: ServerHandshake {
                state: HandshakeState::AwaitingHandshake,
                handshake_error: None,
            },
            scene_channel: ServerSceneChannel::new(replication_update_period),
            jitter: JitterBuffer::new(jitter_capacity.max(1), 0),
            reconciler: Reconciler::new(),
            controller_id: None,
            pawn_id: None,
            pending_removal: false,
        }
    }
}

/// Authoritative game server: one UDP socket demultiplexed by peer address,
/// one scene, one clock, one rewind buffer shared by every connection.
pub struct GameServer {
    socket: GameSocket,
    world: World,
    #[allow(dead_code)]
    registry: TypeRegistry,
    pawn_class: Arc<ClassSchema>,
    controller_class: Arc<ClassSchema>,
    correct_move_index: u8,
    clients: HashMap<SocketAddr, ClientConnection>,
    clock: ServerClock,
    rewind: RewindBuffer,
    pub console: Console,
    tick_duration: Duration,
    replication_update_period: Duration,
    jitter_capacity: usize,
    max_players: usize,
}

impl GameServer {
    /// Binds the server's socket at `cfg.server_addr` and registers the
    /// gameplay schemas and the singleton clock replicable.
    pub async fn bind(cfg: &EngineConfig) -> anyhow::Result<Self> {
        Self::bind_with_rules(cfg, Box::new(PermissiveRules)).await
    }

    /// As [`Self::bind`], but with a caller-supplied `Rules` collaborator
    /// (connection acceptance policy, relevance filtering).
    pub async fn bind_with_rules(cfg: &EngineConfig, rules: Box<dyn Rules>) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let socket = GameSocket::bind(addr).await?;

        let mut registry = TypeRegistry::new();
        let (pawn_class, controller_class, clock_class) = register_gameplay_schemas(&mut registry);
        let correct_move_index = pawn_class.function_index(FN_CORRECT_MOVE).expect("correct_move is registered");

        let mut world = World::new(rules);
        world
            .scene
            .add_remote(CLOCK_REPLICABLE_ID, clock_class, Roles::new(Role::Authority, Role::SimulatedProxy))
            .ok();

        let mut console = Console::new();
        Self::register_cvars(&mut console, cfg);

        info!(addr = %socket.local_addr()?, "server listening");

        Ok(Self {
            socket,
            world,
            registry,
            pawn_class,
            controller_class,
            correct_move_index,
            clients: HashMap::new(),
            clock: ServerClock::default(),
            rewind: RewindBuffer::new(),
            console,
            tick_duration: cfg.tick_duration(),
            replication_update_period: cfg.replication_update_period(),
            jitter_capacity: cfg.jitter_buffer_ticks,
            max_players: cfg.max_players,
        })
    }

    fn register_cvars(console: &mut Console, cfg: &EngineConfig) {
        console.register_cvar("sv_max_players", CvarValue::Int(cfg.max_players as i64), "Maximum concurrent connections", CvarFlags::SERVER_ONLY);
        console.register_cvar("sv_tick_hz", CvarValue::Int(cfg.tick_hz as i64), "Simulation tick rate", CvarFlags::SERVER_ONLY);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }

    /// Advances one fixed-timestep tick: receive/dispatch, apply moves, step
    /// the clock, record rewind history, collect and send outbound deltas,
    /// then reap any connection that ended the tick disconnected.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.pump_network().await?;
        self.process_moves();
        self.clock.tick(self.tick_duration);
        self.update_clock_replicable();
        self.record_rewind_snapshots();
        self.replicate_and_send().await?;
        self.reap_disconnected().await;
        Ok(())
    }

    /// Runs `ticks` steps back to back, waiting `tick_duration` between
    /// each so real time and simulated time stay roughly aligned. Tests that
    /// don't care about real-time pacing can call [`Self::step`] directly.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        for _ in 0..ticks {
            self.step().await?;
            tokio::time::sleep(self.tick_duration).await;
        }
        Ok(())
    }

    async fn pump_network(&mut self) -> anyhow::Result<()> {
        while let Some((payload, from)) = self.socket.try_recv()? {
            self.handle_datagram(from, payload).await?;
        }
        Ok(())
    }

    async fn handle_datagram(&mut self, from: SocketAddr, payload: Bytes) -> anyhow::Result<()> {
        if !self.clients.contains_key(&from) {
            if self.clients.len() >= self.max_players {
                debug!(%from, "dropping connection attempt: server full");
                return Ok(());
            }
            self.clients
                .insert(from, ClientConnection::new(self.replication_update_period, self.jitter_capacity));
        }

        let packets = {
            let client = self.clients.get_mut(&from).expect("inserted above");
            match client.connection.receive_datagram(payload) {
                Ok(packets) => packets,
                Err(err) => {
                    warn!(%from, error = %err, "malformed datagram");
                    return Ok(());
                }
            }
        };

        for packet in packets {
            self.handle_packet(from, packet).await;
        }

        if let Some(client) = self.clients.get_mut(&from) {
            for body in client.connection.drain_outbound(false) {
                self.socket.send_to(&body, from).await?;
            }
        }
        Ok(())
    }

    async fn handle_packet(&mut self, from: SocketAddr, packet: DecodedPacket) {
        match packet.protocol_id {
            ProtocolId::HandshakeRequest => self.handle_handshake_request(from, &packet.payload).await,
            ProtocolId::DisconnectRequest => {
                if let Some(client) = self.clients.get_mut(&from) {
                    client.handshake.receive_disconnect_request();
                    client.pending_removal = true;
                }
            }
            ProtocolId::RpcInvocation => self.handle_rpc(from, &packet.payload),
            ProtocolId::Heartbeat | ProtocolId::InvokeHandshake | ProtocolId::HandshakeSuccess | ProtocolId::HandshakeFailed | ProtocolId::SceneCreated | ProtocolId::SceneDestroyed | ProtocolId::ReplicableCreated | ProtocolId::ReplicableDestroyed | ProtocolId::AttributeUpdate => {
                debug!(protocol = ?packet.protocol_id, "unhandled packet on server");
            }
        }
    }

    async fn handle_handshake_request(&mut self, from: SocketAddr, payload: &Bytes) {
        let netmode = parse_request_netmode(payload);
        let pre_initialise = if netmode == Netmode::Server {
            Err(NetworkError::PeerIsServer(format!("{from} identified itself as a server peer")))
        } else if self.clients.len() > self.max_players {
            Err(NetworkError::PlayerLimitReached(format!("server full ({} players)", self.max_players)))
        } else {
            self.world.rules.pre_initialise(from, netmode).await
        };

        let Some(client) = self.clients.get_mut(&from) else { return };
        let reply = client.handshake.receive_handshake_request(pre_initialise);
        let state = client.handshake.state;
        client.connection.queue_packets(&[reply]);

        match state {
            HandshakeState::Connected => self.spawn_player(from).await,
            HandshakeState::Failed => {
                if let Some(client) = self.clients.get_mut(&from) {
                    client.pending_removal = true;
                }
            }
            _ => {}
        }
    }

    async fn spawn_player(&mut self, from: SocketAddr) {
        let controller_id = self
            .world
            .scene
            .add_local(self.controller_class.clone(), Roles::new(Role::Authority, Role::AutonomousProxy));
        let pawn_id = self
            .world
            .scene
            .add_local(self.pawn_class.clone(), Roles::new(Role::Authority, Role::AutonomousProxy));

        let (Some(controller_id), Some(pawn_id)) = (controller_id, pawn_id) else {
            warn!(%from, "scene full, rejecting connection after handshake");
            if let Some(client) = self.clients.get_mut(&from) {
                client.pending_removal = true;
            }
            return;
        };

        if let Some(controller) = self.world.scene.get_mut(controller_id) {
            controller.set(ATTR_PAWN, AttrValue::Replicable(Some(pawn_id)));
        }

        if let Some(client) = self.clients.get_mut(&from) {
            client.controller_id = Some(controller_id);
            client.pawn_id = Some(pawn_id);
        }

        self.world.rules.post_initialise(controller_id).await;
        info!(%from, controller = controller_id.0, pawn = pawn_id.0, "player spawned");
    }

    fn handle_rpc(&mut self, from: SocketAddr, payload: &Bytes) {
        if payload.is_empty() {
            return;
        }
        let id = ReplicableId(payload[0]);
        let body = &payload[1..];

        let Some(client) = self.clients.get_mut(&from) else { return };
        let is_owner = Some(id) == client.pawn_id;

        let mut accepted_move = None;
        let result = process_rpc_calls(&self.pawn_class, body, Role::Authority, is_owner, |function, args, authorized| {
            if function.name != FN_SUBMIT_MOVE {
                return Err(engine_shared::errors::DecodeError::UnknownFunctionIndex(function.index));
            }
            let (mv, consumed) = PlayerMove::unpack(args)?;
            if authorized {
                accepted_move = Some(mv);
            }
            Ok(consumed)
        });

        if let Err(err) = result {
            warn!(%from, error = %err, "malformed rpc body");
            return;
        }

        let Some(mv) = accepted_move else { return };
        let Some(client) = self.clients.get_mut(&from) else { return };

        // The backlog carries the last few sampled moves, oldest first,
        // ending at `mv.move_id` itself; pushing all of them (not just the
        // latest) lets a gap left by a dropped unreliable move packet be
        // filled in from the next packet that does arrive.
        let move_ids = mv.recent_move_ids();
        for (id, input) in move_ids.into_iter().zip(mv.recent_states.iter().cloned()) {
            let is_current = id == mv.move_id;
            client.jitter.push(BufferedMove {
                move_id: id,
                input,
                reported_position: is_current.then_some(mv.position),
                reported_yaw: is_current.then_some(mv.yaw),
            });
        }
    }

    fn process_moves(&mut self) {
        let dt = self.tick_duration.as_secs_f32();
        let addrs: Vec<SocketAddr> = self.clients.keys().copied().collect();

        for addr in addrs {
            let Some(client) = self.clients.get_mut(&addr) else { continue };
            let Some(pawn_id) = client.pawn_id else { continue };
            let Some(mv) = client.jitter.pop_next() else { continue };

            let Some(pawn) = self.world.scene.get(pawn_id) else { continue };
            let old_pos = pawn_position(pawn);
            let old_yaw = pawn_yaw(pawn);
            let (new_pos, new_yaw) = integrate(old_pos, old_yaw, &mv.input, dt);

            if let Some(pawn) = self.world.scene.get_mut(pawn_id) {
                pawn.set(ATTR_POSITION_X, AttrValue::Float(new_pos.x as f64));
                pawn.set(ATTR_POSITION_Y, AttrValue::Float(new_pos.y as f64));
                pawn.set(ATTR_POSITION_Z, AttrValue::Float(new_pos.z as f64));
                pawn.set(ATTR_YAW, AttrValue::Float(new_yaw as f64));
            }

            let velocity = Vec3::new((new_pos.x - old_pos.x) / dt, (new_pos.y - old_pos.y) / dt, (new_pos.z - old_pos.z) / dt);
            let angular_yaw = (new_yaw - old_yaw) / dt;
            let server_result = ServerMoveResult {
                move_id: mv.move_id,
                position: new_pos,
                yaw: new_yaw,
                velocity,
                angular_yaw,
            };

            // A move recovered from another packet's resend backlog carries
            // no independently reported pose (only the move the client
            // flagged as current does), so there's nothing to reconcile it
            // against; it's still integrated above to keep the pawn moving.
            let Some(client) = self.clients.get_mut(&addr) else { continue };
            if let (Some(position), Some(yaw)) = (mv.reported_position, mv.reported_yaw) {
                if let Some(correction) = client.reconciler.check(server_result, position, yaw) {
                    if let Some(pawn) = self.world.scene.get_mut(pawn_id) {
                        pawn.call_rpc(self.correct_move_index, true, correction.pack());
                    }
                }
            }
        }
    }

    fn update_clock_replicable(&mut self) {
        if let Some(clock) = self.world.scene.get_mut(CLOCK_REPLICABLE_ID) {
            clock.set(ATTR_ELAPSED, AttrValue::Float(self.clock.elapsed));
        }
    }

    fn record_rewind_snapshots(&mut self) {
        let now = Instant::now();
        let pawn_ids: Vec<ReplicableId> = self.clients.values().filter_map(|c| c.pawn_id).collect();
        for id in pawn_ids {
            if let Some(pawn) = self.world.scene.get(id) {
                let snapshot = PawnSnapshot {
                    position: pawn_position(pawn),
                    orientation: Quat::from_yaw(pawn_yaw(pawn)),
                    animation_frame: 0,
                };
                self.rewind.record(id, now, snapshot);
            }
        }
    }

    /// Rewinds every tracked pawn's pose to `current_tick - ping_in_ticks -
    /// 1` and hands the snapshots to `f` for lag-compensated hit validation,
    /// per the one-extra-tick margin the design notes specify.
    pub fn with_rewound<R>(&self, ping: Duration, f: impl FnOnce(&HashMap<ReplicableId, PawnSnapshot>) -> R) -> R {
        let ping_in_ticks = (ping.as_secs_f64() / self.tick_duration.as_secs_f64()).round() as u32;
        let offset = self.tick_duration * (ping_in_ticks + 1);
        let at = Instant::now().checked_sub(offset).unwrap_or_else(Instant::now);
        self.rewind.with_rewound(at, f)
    }

    async fn replicate_and_send(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        let addrs: Vec<SocketAddr> = self.clients.keys().copied().collect();

        for addr in addrs {
            let Some(client) = self.clients.get_mut(&addr) else { continue };
            if client.handshake.state != HandshakeState::Connected {
                continue;
            }

            let byte_budget = (client.connection.bandwidth * self.tick_duration.as_secs_f64()) as usize;
            let pawn_id = client.pawn_id;

            let World { scene, rules } = &mut self.world;
            let packets = client
                .scene_channel
                .collect_packets(scene, None, |viewer, replicable| rules.is_relevant(viewer, replicable), |replicable| Some(replicable.id) == pawn_id, byte_budget, now);

            client.connection.queue_packets(&packets);
            client.scene_channel.cull_shadow_channels();

            for body in client.connection.drain_outbound(true) {
                self.socket.send_to(&body, addr).await?;
            }
        }
        Ok(())
    }

    fn despawn_replicable(&mut self, id: ReplicableId) {
        self.world.scene.remove(id);
        let packet = DecodedPacket {
            protocol_id: ProtocolId::ReplicableDestroyed,
            reliable: true,
            payload: Bytes::copy_from_slice(&[id.0]),
        };
        for client in self.clients.values_mut() {
            client.scene_channel.on_replicable_removed(id);
            client.connection.queue_packets(std::slice::from_ref(&packet));
        }
    }

    async fn reap_disconnected(&mut self) {
        let mut to_remove = Vec::new();
        for (addr, client) in self.clients.iter() {
            let timed_out = client.connection.timed_out();
            let disconnected = client.pending_removal
                || matches!(client.handshake.state, HandshakeState::Failed | HandshakeState::Disconnected | HandshakeState::TimedOut);
            if timed_out || disconnected {
                to_remove.push(*addr);
            }
        }

        for addr in to_remove {
            let Some(client) = self.clients.remove(&addr) else { continue };
            if let Some(pawn_id) = client.pawn_id {
                self.despawn_replicable(pawn_id);
            }
            if let Some(controller_id) = client.controller_id {
                self.world.rules.post_disconnect(controller_id).await;
                self.despawn_replicable(controller_id);
            }
            info!(%addr, "client disconnected");
        }
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let mut out = vec![format!("Connected clients: {}", self.clients.len())];
                for (addr, client) in &self.clients {
                    out.push(format!("  {addr}: pawn={:?} state={:?}", client.pawn_id, client.handshake.state));
                }
                Ok(out)
            }
            "kick" => {
                let Some(addr_str) = tokens.get(1) else {
                    return Ok(vec!["usage: kick <addr>".to_string()]);
                };
                let Ok(addr) = addr_str.parse::<SocketAddr>() else {
                    return Ok(vec![format!("invalid address: {addr_str}")]);
                };
                if let Some(client) = self.clients.get_mut(&addr) {
                    client.pending_removal = true;
                    Ok(vec![format!("kicking {addr}")])
                } else {
                    Ok(vec![format!("no such connection: {addr}")])
                }
            }
            _ => self.console.exec(line),
        }
    }
}

fn pawn_position(pawn: &Replicable) -> Vec3 {
    let x = float_attr(pawn, ATTR_POSITION_X);
    let y = float_attr(pawn, ATTR_POSITION_Y);
    let z = float_attr(pawn, ATTR_POSITION_Z);
    Vec3::new(x, y, z)
}

fn pawn_yaw(pawn: &Replicable) -> f32 {
    float_attr(pawn, ATTR_YAW)
}

fn float_attr(pawn: &Replicable, name: &str) -> f32 {
    match pawn.get(name) {
        Some(AttrValue::Float(v)) => *v as f32,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_shared::replicable::Roles;

    #[test]
    fn pawn_position_defaults_to_zero_before_any_move() {
        let schema = Arc::new(engine_shared::gameplay::pawn_schema());
        let pawn = Replicable::new(ReplicableId(0), schema, Roles::new(Role::Authority, Role::AutonomousProxy), true);
        assert_eq!(pawn_position(&pawn), Vec3::ZERO);
        assert_eq!(pawn_yaw(&pawn), 0.0);
    }

    #[tokio::test]
    async fn bind_registers_clock_replicable_at_reserved_id() {
        let cfg = EngineConfig {
            server_addr: "127.0.0.1:0".to_string(),
            ..EngineConfig::default()
        };
        let server = GameServer::bind(&cfg).await.unwrap();
        assert!(server.world.scene.get(CLOCK_REPLICABLE_ID).is_some());
        assert_eq!(server.connected_count(), 0);
    }

    #[tokio::test]
    async fn server_full_rejects_new_connection_attempts() {
        let cfg = EngineConfig {
            server_addr: "127.0.0.1:0".to_string(),
            max_players: 0,
            ..EngineConfig::default()
        };
        let mut server = GameServer::bind(&cfg).await.unwrap();
        let from: SocketAddr = "127.0.0.1:1".parse().unwrap();
        server.handle_datagram(from, Bytes::new()).await.unwrap();
        assert_eq!(server.connected_count(), 0);
    }
}
