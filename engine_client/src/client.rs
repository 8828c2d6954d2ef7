//! Client implementation.
//!
//! The client drives one [`engine_shared::connection::Connection`] against
//! the server's socket, applies inbound attribute/RPC packets to a
//! [`ClientSceneChannel`], predicts its own pawn's movement locally via
//! [`Predictor`], and buffers remote pawns' poses for [`InterpBuffer`] to
//! smooth out.
//!
//! This implementation assumes a single locally-controlled pawn: the first
//! `Pawn`-class replicable the server creates is treated as this client's
//! own. A deployment serving more than one simultaneous client would need
//! the server to identify the owning connection's pawn explicitly; that's
//! out of scope for this harness.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use engine_shared::channel::process_rpc_calls;
use engine_shared::clock::ClockSync;
use engine_shared::config::EngineConfig;
use engine_shared::connection::Connection;
use engine_shared::console::{Console, CvarFlags, CvarValue};
use engine_shared::gameplay::{register_gameplay_schemas, ATTR_ELAPSED, ATTR_POSITION_X, ATTR_POSITION_Y, ATTR_POSITION_Z, ATTR_YAW, CLOCK_REPLICABLE_ID, FN_CORRECT_MOVE, FN_SUBMIT_MOVE};
use engine_shared::handshake::{ClientHandshake, HandshakeState};
use engine_shared::math::Vec3;
use engine_shared::movement::{Correction, InputState, PlayerMove};
use engine_shared::net::GameSocket;
use engine_shared::packet::{DecodedPacket, ProtocolId};
use engine_shared::replicable::{ReplicableId, Role};
use engine_shared::replication_manager::ClientSceneChannel;
use engine_shared::schema::{ClassSchema, TypeRegistry};
use engine_shared::serialise::{unpack_short_string, AttrValue};

use crate::interp::InterpBuffer;
use crate::predict::Predictor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Disconnected,
}

/// High-level game client: one connection, one scene view.
pub struct GameClient {
    socket: GameSocket,
    server: SocketAddr,
    connection: Connection,
    handshake: ClientHandshake,
    pub state: ClientState,
    scene_channel: ClientSceneChannel,
    registry: TypeRegistry,
    pawn_class: Arc<ClassSchema>,
    submit_move_index: u8,
    pub console: Console,
    pub clock: ClockSync,
    pub predictor: Predictor,
    pub interp: InterpBuffer,
    own_pawn: Option<ReplicableId>,
    tick_duration: Duration,
    notify_callback: Option<Box<dyn FnMut(ReplicableId, &[String]) + Send>>,
}

impl GameClient {
    /// Binds a socket, performs the handshake against `cfg.server_addr`, and
    /// blocks (with a short timeout) until the server accepts or rejects.
    pub async fn connect(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let server: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("valid bind address");
        let socket = GameSocket::bind(bind_addr).await?;

        let mut registry = TypeRegistry::new();
        let (pawn_class, _controller_class, _clock_class) = register_gameplay_schemas(&mut registry);
        let submit_move_index = pawn_class.function_index(FN_SUBMIT_MOVE).expect("submit_move is registered");

        let mut connection = Connection::new();
        let (handshake, initial) = ClientHandshake::new();
        connection.queue_packets(&[initial]);

        let mut console = Console::new();
        Self::register_cvars(&mut console);

        let mut client = Self {
            socket,
            server,
            connection,
            handshake,
            state: ClientState::Connecting,
            scene_channel: ClientSceneChannel::new(),
            registry,
            pawn_class,
            submit_move_index,
            console,
            clock: ClockSync::default(),
            predictor: Predictor::new(),
            interp: InterpBuffer::new(32),
            own_pawn: None,
            tick_duration: cfg.tick_duration(),
            notify_callback: None,
        };

        client.flush_outbound().await?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.state == ClientState::Connecting {
            if Instant::now() > deadline {
                bail!("handshake with {server} timed out");
            }
            client.pump_network().await?;
            if client.state == ClientState::Connecting {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        if client.state == ClientState::Disconnected {
            bail!("server rejected the connection");
        }

        info!(server = %server, "connected");
        Ok(client)
    }

    fn register_cvars(console: &mut Console) {
        console.register_cvar("cl_interp", CvarValue::Float(crate::interp::INTERP_DELAY_SECS as f64), "Interpolation delay", CvarFlags::NONE);
        console.register_cvar("cl_predict", CvarValue::Bool(true), "Enable client prediction", CvarFlags::NONE);
        console.register_cvar("name", CvarValue::String("Player".to_string()), "Player name", CvarFlags::NONE);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn own_pawn(&self) -> Option<ReplicableId> {
        self.own_pawn
    }

    pub fn predicted_pose(&self) -> (Vec3, f32) {
        (self.predictor.position(), self.predictor.yaw())
    }

    /// Registers the single notifier callback invoked after an
    /// `AttributeUpdate` packet is applied, with the names of whichever
    /// `notify`-flagged attributes changed (replaces any previously
    /// registered callback).
    pub fn on_attribute_notify(&mut self, callback: impl FnMut(ReplicableId, &[String]) + Send + 'static) {
        self.notify_callback = Some(Box::new(callback));
    }

    async fn flush_outbound(&mut self) -> anyhow::Result<()> {
        for body in self.connection.drain_outbound(true) {
            self.socket.send_to(&body, self.server).await?;
        }
        Ok(())
    }

    /// Drains pending inbound datagrams and flushes whatever got queued in
    /// response.
    pub async fn pump_network(&mut self) -> anyhow::Result<()> {
        while let Some((payload, from)) = self.socket.try_recv()? {
            if from != self.server {
                debug!(%from, "dropping datagram from unexpected peer");
                continue;
            }
            let packets = self.connection.receive_datagram(payload)?;
            for packet in packets {
                self.handle_packet(packet)?;
            }
        }
        self.flush_outbound().await
    }

    fn handle_packet(&mut self, packet: DecodedPacket) -> anyhow::Result<()> {
        match packet.protocol_id {
            ProtocolId::InvokeHandshake => {
                let reply = self.handshake.receive_multicast_ping();
                self.connection.queue_packets(&[reply]);
            }
            ProtocolId::HandshakeSuccess => {
                if self.handshake.receive_handshake_success() {
                    self.state = ClientState::Connected;
                }
            }
            ProtocolId::HandshakeFailed => {
                let err = self.handshake.receive_handshake_failed(&packet.payload)?;
                warn!(error = %err, "handshake rejected");
                self.state = ClientState::Disconnected;
            }
            ProtocolId::ReplicableCreated => self.on_replicable_created(&packet.payload)?,
            ProtocolId::ReplicableDestroyed => self.on_replicable_destroyed(&packet.payload)?,
            ProtocolId::AttributeUpdate => self.on_attribute_update(&packet.payload)?,
            ProtocolId::RpcInvocation => self.on_rpc(&packet.payload)?,
            ProtocolId::Heartbeat
            | ProtocolId::DisconnectRequest
            | ProtocolId::SceneCreated
            | ProtocolId::SceneDestroyed
            | ProtocolId::HandshakeRequest => {
                debug!(protocol = ?packet.protocol_id, "unhandled packet on client");
            }
        }
        Ok(())
    }

    fn on_replicable_created(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let id = ReplicableId(*payload.first().context("empty ReplicableCreated payload")?);
        let (name, _) = unpack_short_string(&payload[1..]).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let Some(schema) = self.registry.get(&name) else {
            warn!(class = %name, "replicable created with unregistered class");
            return Ok(());
        };
        let is_pawn = Arc::ptr_eq(&schema, &self.pawn_class);
        self.scene_channel.on_created(id, schema);
        if is_pawn && self.own_pawn.is_none() {
            self.own_pawn = Some(id);
            info!(id = id.0, "assigned own pawn");
        }
        Ok(())
    }

    fn on_replicable_destroyed(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let id = ReplicableId(*payload.first().context("empty ReplicableDestroyed payload")?);
        self.scene_channel.on_destroyed(id);
        self.interp.forget(id);
        if self.own_pawn == Some(id) {
            self.own_pawn = None;
        }
        Ok(())
    }

    fn on_attribute_update(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let id = ReplicableId(*payload.first().context("empty AttributeUpdate payload")?);
        let Some(channel) = self.scene_channel.channel_mut(id) else {
            debug!(id = id.0, "attribute update for unknown replicable");
            return Ok(());
        };
        let (notify_names, _) = channel.read_attributes(&payload[1..]).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        if !notify_names.is_empty() {
            if let Some(callback) = self.notify_callback.as_mut() {
                callback(id, &notify_names);
            }
        }

        if id == CLOCK_REPLICABLE_ID {
            if let Some(AttrValue::Float(elapsed)) = channel.value(ATTR_ELAPSED) {
                let ping = self.connection.latency_calculator.lock().unwrap().ping().unwrap_or_default();
                self.clock.on_server_update(*elapsed, ping);
            }
            return Ok(());
        }

        if Some(id) == self.own_pawn {
            // The owning pawn's pose is predicted locally; the server skips
            // replicating it back to us (see `skip_owner` in gameplay.rs).
            return Ok(());
        }

        let pose = match (channel.value(ATTR_POSITION_X), channel.value(ATTR_POSITION_Y), channel.value(ATTR_POSITION_Z), channel.value(ATTR_YAW)) {
            (Some(AttrValue::Float(x)), Some(AttrValue::Float(y)), Some(AttrValue::Float(z)), Some(AttrValue::Float(yaw))) => {
                Some((*x as f32, *y as f32, *z as f32, *yaw as f32))
            }
            _ => None,
        };
        if let Some((x, y, z, yaw)) = pose {
            self.interp.record(id, Instant::now(), Vec3::new(x, y, z), yaw);
        }
        Ok(())
    }

    fn on_rpc(&mut self, payload: &Bytes) -> anyhow::Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let id = ReplicableId(payload[0]);
        let body = &payload[1..];
        let is_owner = Some(id) == self.own_pawn;

        let mut correction = None;
        let local_role = if is_owner { Role::AutonomousProxy } else { Role::SimulatedProxy };
        process_rpc_calls(&self.pawn_class, body, local_role, is_owner, |function, args, authorized| {
            if function.name != FN_CORRECT_MOVE {
                return Err(engine_shared::errors::DecodeError::UnknownFunctionIndex(function.index));
            }
            let (decoded, consumed) = Correction::unpack(args)?;
            if authorized {
                correction = Some(decoded);
            }
            Ok(consumed)
        })
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        if let Some(correction) = correction {
            self.predictor.apply_correction(&correction, self.tick_duration.as_secs_f32());
        }
        Ok(())
    }

    fn send_submit_move(&mut self, mv: &PlayerMove) {
        let Some(pawn_id) = self.own_pawn else { return };
        let packed = mv.pack();
        let mut payload = BytesMut::with_capacity(2 + packed.len());
        payload.put_u8(pawn_id.0);
        payload.put_u8(self.submit_move_index);
        payload.extend_from_slice(&packed);
        let packet = DecodedPacket {
            protocol_id: ProtocolId::RpcInvocation,
            reliable: false,
            payload: payload.freeze(),
        };
        self.connection.queue_packets(&[packet]);
    }

    /// Advances one client tick: integrates `input` against the predicted
    /// pawn pose, uploads the resulting move, and flushes the network.
    pub async fn tick(&mut self, input: InputState) -> anyhow::Result<()> {
        self.clock.tick(self.tick_duration);
        if self.own_pawn.is_some() {
            let mv = self.predictor.sample(input, self.tick_duration.as_secs_f32());
            self.send_submit_move(&mv);
        }
        self.flush_outbound().await
    }

    pub async fn disconnect(&mut self) -> anyhow::Result<()> {
        let packet = DecodedPacket {
            protocol_id: ProtocolId::DisconnectRequest,
            reliable: true,
            payload: Bytes::new(),
        };
        self.connection.queue_packets(&[packet]);
        self.flush_outbound().await?;
        self.state = ClientState::Disconnected;
        Ok(())
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
                let mut out = Vec::new();
                out.push(format!("State: {:?}", self.state));
                out.push(format!("Own pawn: {:?}", self.own_pawn));
                out.push(format!("Estimated server time: {:.3}", self.clock.estimated_elapsed_server));
                Ok(out)
            }
            "disconnect" => {
                self.state = ClientState::Disconnected;
                Ok(vec!["Disconnected".to_string()])
            }
            _ => self.console.exec(line),
        }
    }
}

#[allow(unused)]
fn handshake_state_label(state: HandshakeState) -> &'static str {
    match state {
        HandshakeState::Init => "init",
        HandshakeState::AwaitingHandshake => "awaiting_handshake",
        HandshakeState::ReceivedHandshake => "received_handshake",
        HandshakeState::Connected => "connected",
        HandshakeState::Failed => "failed",
        HandshakeState::Disconnected => "disconnected",
        HandshakeState::TimedOut => "timed_out",
    }
}
