//! Full socket-based integration test for client <-> server communication:
//! handshake, pawn spawn, a few predicted moves, and replication back to the
//! client for a spectating view of the same state.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use engine_client::GameClient;
use engine_server::GameServer;
use engine_shared::config::EngineConfig;
use engine_shared::connection::{Connection, ACK_WINDOW};
use engine_shared::gameplay::{register_gameplay_schemas, FN_SUBMIT_MOVE, PAWN_CLASS};
use engine_shared::handshake::{ClientHandshake, HandshakeState};
use engine_shared::math::Vec3;
use engine_shared::movement::{Correction, InputState, PlayerMove};
use engine_shared::net::GameSocket;
use engine_shared::packet::{DecodedPacket, ProtocolId};
use engine_shared::replicable::ReplicableId;
use engine_shared::schema::TypeRegistry;
use engine_shared::serialise::unpack_short_string;

fn test_config(server_addr: &str) -> EngineConfig {
    EngineConfig {
        server_addr: server_addr.to_string(),
        tick_hz: 64,
        // Keep the test fast: a short replication period and jitter buffer
        // so a handful of ticks is enough to observe the full loop.
        replication_update_period_ms: 10,
        jitter_buffer_ticks: 2,
        ..EngineConfig::default()
    }
}

/// Handshake success: a client connects, receives `handshake_success`, and
/// is handed a controller/pawn pair by the server's `post_initialise` hook.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_spawns_a_controlled_pawn() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").with_test_writer().try_init();

    let mut server = GameServer::bind(&test_config("127.0.0.1:0")).await?;
    let server_addr = server.local_addr()?.to_string();

    let server_handle = tokio::spawn(async move {
        for _ in 0..10 {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    let client = GameClient::connect(&test_config(&server_addr)).await?;

    let mut server = server_handle.await??;
    assert_eq!(server.connected_count(), 1);
    assert_eq!(client.state, engine_client::client::ClientState::Connected);

    server.run_for_ticks(1).await?;
    Ok(())
}

/// A client that submits forward moves every tick predicts its pawn moving
/// away from the origin, and the server's authoritative replication of the
/// same pawn converges to a position that is never corrected away (no
/// divergence is introduced in this scenario, so no `correct_move` should be
/// necessary).
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn predicted_moves_advance_the_pawn_without_correction() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").with_test_writer().try_init();

    let mut server = GameServer::bind(&test_config("127.0.0.1:0")).await?;
    let server_addr = server.local_addr()?.to_string();

    let server_handle = tokio::spawn(async move {
        for _ in 0..40 {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    let mut client = GameClient::connect(&test_config(&server_addr)).await?;

    // `own_pawn` is assigned once the server's first post-handshake
    // replication tick delivers a `replicable_created` packet, which can
    // take a tick or two beyond the handshake itself.
    for _ in 0..20 {
        if client.own_pawn().is_some() {
            break;
        }
        client.pump_network().await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(client.own_pawn().is_some(), "handshake must eventually assign an own pawn");

    for _ in 0..20 {
        let mut input = InputState::new();
        input.set_range("forward", 1.0);
        client.tick(input).await?;
        client.pump_network().await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let server = server_handle.await??;
    assert_eq!(server.connected_count(), 1);

    let (predicted_pos, _yaw) = client.predicted_pose();
    assert!(predicted_pos.x > 0.0, "client should have predicted forward movement, got {predicted_pos:?}");

    Ok(())
}

/// The controller's `pawn` attribute is declared with `.notify()`; the
/// client's single notifier callback must fire with its name once the
/// server's `post_initialise` hook assigns the pawn and that update
/// replicates down.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attribute_notify_callback_fires_for_the_controllers_pawn_reference() -> anyhow::Result<()> {
    let mut server = GameServer::bind(&test_config("127.0.0.1:0")).await?;
    let server_addr = server.local_addr()?.to_string();

    let server_handle = tokio::spawn(async move {
        for _ in 0..30 {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    let mut client = GameClient::connect(&test_config(&server_addr)).await?;

    let notified = Arc::new(Mutex::new(Vec::new()));
    let notified_handle = notified.clone();
    client.on_attribute_notify(move |_id, names| {
        notified_handle.lock().unwrap().extend(names.iter().cloned());
    });

    for _ in 0..20 {
        client.pump_network().await?;
        if notified.lock().unwrap().iter().any(|n| n == "pawn") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let server = server_handle.await??;
    assert_eq!(server.connected_count(), 1);
    assert!(
        notified.lock().unwrap().iter().any(|n| n == "pawn"),
        "notifier callback must fire for the controller's notify-flagged pawn attribute"
    );
    Ok(())
}

/// Disconnect tears the connection down on both ends.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_disconnect_is_reaped_by_the_server() -> anyhow::Result<()> {
    let mut server = GameServer::bind(&test_config("127.0.0.1:0")).await?;
    let server_addr = server.local_addr()?.to_string();

    let server_handle = tokio::spawn(async move {
        for _ in 0..20 {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    let mut client = GameClient::connect(&test_config(&server_addr)).await?;
    client.disconnect().await?;

    let server = server_handle.await??;
    assert_eq!(server.connected_count(), 0);
    Ok(())
}

/// A bare-metal stand-in for [`GameClient`] that drives the handshake and
/// `submit_move` itself instead of going through the predictor, so a test can
/// report a deliberately wrong pose without the client's own prediction
/// masking it.
struct RawClient {
    socket: GameSocket,
    server: SocketAddr,
    connection: Connection,
    handshake: ClientHandshake,
    pawn_id: Option<ReplicableId>,
    submit_move_index: u8,
}

impl RawClient {
    async fn connect(server: SocketAddr) -> anyhow::Result<Self> {
        let socket = GameSocket::bind("0.0.0.0:0".parse().unwrap()).await?;

        let mut registry = TypeRegistry::new();
        let (pawn_class, _controller, _clock) = register_gameplay_schemas(&mut registry);
        let submit_move_index = pawn_class.function_index(FN_SUBMIT_MOVE).expect("submit_move is registered");

        let mut connection = Connection::new();
        let (handshake, initial) = ClientHandshake::new();
        connection.queue_packets(&[initial]);

        let mut client = Self {
            socket,
            server,
            connection,
            handshake,
            pawn_id: None,
            submit_move_index,
        };
        client.flush().await?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.handshake.state != HandshakeState::Connected {
            if Instant::now() > deadline {
                anyhow::bail!("handshake with {server} timed out");
            }
            client.pump(Duration::from_millis(200)).await?;
        }
        Ok(client)
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        for body in self.connection.drain_outbound(false) {
            self.socket.send_to(&body, self.server).await?;
        }
        Ok(())
    }

    /// Waits up to `timeout` for one datagram, applies handshake/pawn-id
    /// bookkeeping, and returns the packets it carried for further
    /// inspection.
    async fn pump(&mut self, timeout: Duration) -> anyhow::Result<Vec<DecodedPacket>> {
        let Some((payload, from)) = self.socket.recv_timeout(timeout).await? else {
            return Ok(Vec::new());
        };
        if from != self.server {
            return Ok(Vec::new());
        }
        let packets = self.connection.receive_datagram(payload)?;
        for packet in &packets {
            match packet.protocol_id {
                ProtocolId::InvokeHandshake => {
                    let reply = self.handshake.receive_multicast_ping();
                    self.connection.queue_packets(&[reply]);
                }
                ProtocolId::HandshakeSuccess => {
                    self.handshake.receive_handshake_success();
                }
                ProtocolId::ReplicableCreated => {
                    if let Some(&id_byte) = packet.payload.first() {
                        if let Ok((name, _)) = unpack_short_string(&packet.payload[1..]) {
                            if name == PAWN_CLASS && self.pawn_id.is_none() {
                                self.pawn_id = Some(ReplicableId(id_byte));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        self.flush().await?;
        Ok(packets)
    }

    fn send_submit_move(&mut self, mv: &PlayerMove) {
        let Some(pawn_id) = self.pawn_id else { return };
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
}

/// A client that reports a wildly wrong pose for a move gets corrected, and
/// replaying the moves sent after the corrected one against that real,
/// wire-decoded correction still advances the pose rather than keeping the
/// bogus reported position.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mispredicted_move_is_corrected_and_replay_converges() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").with_test_writer().try_init();

    let mut server = GameServer::bind(&test_config("127.0.0.1:0")).await?;
    let server_addr: SocketAddr = server.local_addr()?;

    let server_handle = tokio::spawn(async move {
        for _ in 0..60 {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    let mut client = RawClient::connect(server_addr).await?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.pawn_id.is_none() {
        if Instant::now() > deadline {
            anyhow::bail!("server never replicated an own pawn to the raw client");
        }
        client.pump(Duration::from_millis(200)).await?;
    }

    // The server's own integration of an empty input keeps the pawn at the
    // origin, so reporting move 0 at x=50 forces `Reconciler::check` past
    // tolerance.
    let bogus = PlayerMove {
        move_id: 0,
        latest_correction_id: 0,
        recent_states: vec![InputState::new()],
        position: Vec3::new(50.0, 0.0, 0.0),
        yaw: 0.0,
    };
    client.send_submit_move(&bogus);
    client.flush().await?;

    let mut correction = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while correction.is_none() && Instant::now() < deadline {
        for packet in client.pump(Duration::from_millis(200)).await? {
            if packet.protocol_id != ProtocolId::RpcInvocation || packet.payload.len() < 2 {
                continue;
            }
            // payload is [replicable_id][function_index][args...]; the
            // pawn's only server-to-client function is correct_move.
            if let Ok((decoded, _)) = Correction::unpack(&packet.payload[2..]) {
                correction = Some(decoded);
            }
        }
    }

    let correction = correction.expect("server must send a correction for a mispredicted move");
    assert_eq!(correction.move_id, 0);
    assert!(correction.position.x.abs() < 1e-3, "server's authoritative position should stay near the origin, got {correction:?}");

    // Replay the exchange directly against the wire-decoded correction: move
    // 0 (the corrected one) plus a forward move sent after it must still
    // advance the pose past the corrected baseline.
    let mut predictor = engine_client::predict::Predictor::new();
    predictor.sample(InputState::new(), 1.0);
    let mut forward = InputState::new();
    forward.set_range("forward", 1.0);
    predictor.sample(forward, 1.0);
    predictor.apply_correction(&correction, 1.0);

    assert!(
        predictor.position().x > correction.position.x,
        "replaying the move sent after the correction must advance past the corrected baseline"
    );

    let server = server_handle.await??;
    assert_eq!(server.connected_count(), 1);
    Ok(())
}

/// Losing two outstanding reliable sends in the same ack update requeues
/// both of them for resend but halves bandwidth only once, not once per lost
/// entry.
#[test]
fn lost_reliable_sends_are_requeued_and_bandwidth_halves_once() {
    let mut conn = Connection::new();
    let initial_bandwidth = conn.bandwidth;
    let growth = conn.packet_growth;

    let rpc = DecodedPacket {
        protocol_id: ProtocolId::RpcInvocation,
        reliable: true,
        payload: Bytes::from_static(b"submit_move"),
    };
    conn.queue_packets(&[rpc.clone()]);
    conn.queue_packets(&[rpc]);
    let _ = conn.drain_outbound(false);

    // The peer's ack_base lags far enough behind that both outstanding
    // sequences (1 and 2) fall outside the ack window together.
    let ack_base = 2u8.wrapping_add(ACK_WINDOW as u8 + 5);
    let mut header = BytesMut::new();
    header.put_u8(0);
    header.put_u8(ack_base);
    header.put_u32_le(0);
    conn.receive_datagram(header.freeze()).unwrap();

    assert!(conn.throttle_pending);
    assert_eq!(
        conn.bandwidth,
        (initial_bandwidth + growth * 2.0 + growth * 2.0) / 2.0,
        "two simultaneous losses must still only halve bandwidth once"
    );

    let requeued = conn.drain_outbound(false);
    assert_eq!(requeued.len(), 2, "both lost reliable bodies must be requeued for resend");
}

/// An outstanding sequence newer than the peer's reported `ack_base` (still
/// legitimately in flight, the common case on every datagram in normal
/// operation) must not be treated as lost.
#[test]
fn in_flight_sequence_newer_than_ack_base_survives_an_ack_update() {
    let mut conn = Connection::new();
    let initial_bandwidth = conn.bandwidth;

    let rpc = DecodedPacket {
        protocol_id: ProtocolId::RpcInvocation,
        reliable: true,
        payload: Bytes::from_static(b"submit_move"),
    };
    let seq = conn.queue_packets(&[rpc]);
    let _ = conn.drain_outbound(false);

    // The peer's ack_base lags behind our freshly sent sequence.
    let mut header = BytesMut::new();
    header.put_u8(0);
    header.put_u8(seq - 1);
    header.put_u32_le(0);
    conn.receive_datagram(header.freeze()).unwrap();

    assert!(!conn.throttle_pending, "an in-flight sequence must not trigger throttling");
    assert_eq!(conn.bandwidth, initial_bandwidth + conn.packet_growth, "bandwidth must only grow from the original send, not halve");

    // Resending nothing: the requeue path is only reachable for entries
    // judged dropped, so the next drain should be empty.
    assert!(conn.drain_outbound(false).is_empty());
}

/// A connection that throttles after a loss stops throttling (without
/// halving bandwidth again) once the tagged recovery sequence is acked.
#[test]
fn connection_recovers_from_throttling_once_tagged_sequence_acks() {
    let mut conn = Connection::new();

    let rpc = DecodedPacket {
        protocol_id: ProtocolId::RpcInvocation,
        reliable: true,
        payload: Bytes::from_static(b"x"),
    };
    conn.queue_packets(&[rpc]);
    let _ = conn.drain_outbound(false);

    let lost_ack_base = 1u8.wrapping_add(ACK_WINDOW as u8 + 5);
    let mut header = BytesMut::new();
    header.put_u8(0);
    header.put_u8(lost_ack_base);
    header.put_u32_le(0);
    conn.receive_datagram(header.freeze()).unwrap();
    assert!(conn.throttle_pending);
    let throttled_bandwidth = conn.bandwidth;

    let heartbeat = DecodedPacket {
        protocol_id: ProtocolId::Heartbeat,
        reliable: false,
        payload: Bytes::new(),
    };
    let tagged_seq = conn.queue_packets(&[heartbeat]);
    let _ = conn.drain_outbound(false);

    let mut ack_header = BytesMut::new();
    ack_header.put_u8(0);
    ack_header.put_u8(tagged_seq);
    ack_header.put_u32_le(0);
    conn.receive_datagram(ack_header.freeze()).unwrap();

    assert!(!conn.throttle_pending, "throttle must end once the tagged sequence is acked");
    assert!(conn.bandwidth >= throttled_bandwidth, "bandwidth must not halve again on recovery, only grow");
}

/// Rewinding a pawn's history by a ping-derived offset recalls an earlier,
/// smaller position than its current one for a pawn that's been moving
/// forward the whole test, the lag-compensation path spec scenario 5 hits.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rewind_recalls_a_pawns_earlier_position() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").with_test_writer().try_init();

    let mut server = GameServer::bind(&test_config("127.0.0.1:0")).await?;
    let server_addr = server.local_addr()?.to_string();

    let server_handle = tokio::spawn(async move {
        for _ in 0..60 {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    let mut client = GameClient::connect(&test_config(&server_addr)).await?;
    for _ in 0..20 {
        if client.own_pawn().is_some() {
            break;
        }
        client.pump_network().await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let pawn_id = client.own_pawn().expect("handshake must eventually assign an own pawn");

    for _ in 0..40 {
        let mut input = InputState::new();
        input.set_range("forward", 1.0);
        client.tick(input).await?;
        client.pump_network().await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let server = server_handle.await??;
    let (predicted_pos, _yaw) = client.predicted_pose();
    assert!(predicted_pos.x > 0.5, "pawn should have advanced well away from the origin by now, got {predicted_pos:?}");

    let rewound = server
        .with_rewound(Duration::from_millis(150), |poses| poses.get(&pawn_id).map(|snap| snap.position.x))
        .expect("rewind history should cover a pawn that's been moving this whole test");

    assert!(
        rewound < predicted_pos.x,
        "rewinding ~150ms plus one tick back must recall an earlier, smaller x than the live position, got rewound={rewound} current={}",
        predicted_pos.x
    );

    Ok(())
}
