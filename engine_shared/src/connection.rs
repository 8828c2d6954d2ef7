//! Reliable-ish UDP transport: sequence numbering, ack bitmap, bandwidth
//! throttling and latency estimation for one remote peer.
//!
//! Grounded directly on `Connection` in the original implementation: the
//! wrap-aware sequence comparison, the additive-increase/multiplicative-
//! decrease bandwidth model, and the tagged-throttle-sequence handshake
//! for ending a throttle period are all ported behaviour-for-behaviour.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::packet::{decode_collection, encode_collection, DecodedPacket};

pub const ACK_WINDOW: usize = 32;
const SEQUENCE_MAX: u16 = 255;

/// A packet awaiting acknowledgement, with its fate callbacks.
struct OutstandingEntry {
    reliable: bool,
    on_ack: Option<Box<dyn FnOnce() + Send>>,
    on_not_ack: Option<Box<dyn FnOnce() + Send>>,
    /// The original framed body, re-queued verbatim if this entry is later
    /// judged lost and it carried reliable content.
    body: Bytes,
}

/// Rolling round-trip time sampler: a sample is started when a heartbeat is
/// sent and stopped when it's acked, or discarded if it's never acked.
#[derive(Default)]
pub struct LatencyCalculator {
    next_id: u32,
    started: HashMap<u32, Instant>,
    pub estimated_rtt: Option<Duration>,
}

impl LatencyCalculator {
    pub fn start_sample(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.started.insert(id, Instant::now());
        id
    }

    pub fn stop_sample(&mut self, id: u32) {
        if let Some(start) = self.started.remove(&id) {
            self.estimated_rtt = Some(start.elapsed());
        }
    }

    pub fn ignore_sample(&mut self, id: u32) {
        self.started.remove(&id);
    }

    /// `info.ping = rtt / 2`.
    pub fn ping(&self) -> Option<Duration> {
        self.estimated_rtt.map(|rtt| rtt / 2)
    }
}

/// Transport state for one remote peer.
pub struct Connection {
    local_sequence: u8,
    remote_sequence: u8,
    received_window: VecDeque<u8>,
    requested_ack: HashMap<u8, OutstandingEntry>,
    pub bandwidth: f64,
    pub packet_growth: f64,
    tagged_throttle_sequence: Option<u8>,
    pub throttle_pending: bool,
    pub timeout_duration: Duration,
    pub last_received_time: Option<Instant>,
    outbound: Vec<Vec<u8>>,
    pub latency_calculator: Arc<Mutex<LatencyCalculator>>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            local_sequence: 0,
            remote_sequence: 0,
            received_window: VecDeque::with_capacity(ACK_WINDOW),
            requested_ack: HashMap::new(),
            bandwidth: 1000.0,
            packet_growth: 500.0,
            tagged_throttle_sequence: None,
            throttle_pending: false,
            timeout_duration: Duration::from_secs(10),
            last_received_time: None,
            outbound: Vec::new(),
            latency_calculator: Arc::new(Mutex::new(LatencyCalculator::default())),
        }
    }

    fn is_more_recent(base: u8, sequence: u8) -> bool {
        let half = SEQUENCE_MAX / 2;
        let base = base as i32;
        let sequence = sequence as i32;
        (base > sequence && (base - sequence) as u16 <= half) || (sequence > base && (sequence - base) as u16 > half)
    }

    /// Signed circular distance from `sequence` to `ack_base`, wrap-aware
    /// over the 8-bit sequence space. Positive when `sequence` is older than
    /// `ack_base`; negative when it is still ahead (in flight, not yet
    /// possibly acked).
    fn sequence_distance(ack_base: u8, sequence: u8) -> i16 {
        let diff = ack_base as i16 - sequence as i16;
        if diff > 128 {
            diff - 256
        } else if diff < -128 {
            diff + 256
        } else {
            diff
        }
    }

    fn outgoing_ack_bitmap(&self) -> u32 {
        let mut bitmap = 0u32;
        for index in 0..ACK_WINDOW {
            let packet_sqn = self.remote_sequence as i32 - (index as i32 + 1);
            if packet_sqn < 0 {
                continue;
            }
            if self.received_window.contains(&(packet_sqn as u8)) {
                bitmap |= 1 << index;
            }
        }
        bitmap
    }

    /// Queues a framed body (already packet-collection-encoded) for send,
    /// returning the sequence it was assigned.
    fn queue_body(&mut self, body: Bytes, reliable: bool, on_ack: Option<Box<dyn FnOnce() + Send>>, on_not_ack: Option<Box<dyn FnOnce() + Send>>) -> u8 {
        self.local_sequence = self.local_sequence.wrapping_add(1);
        let sequence = self.local_sequence;

        if self.throttle_pending && self.tagged_throttle_sequence.is_none() {
            self.tagged_throttle_sequence = Some(sequence);
        }

        let ack_bitmap = self.outgoing_ack_bitmap();

        let mut header = BytesMut::with_capacity(6 + body.len());
        header.put_u8(sequence);
        header.put_u8(self.remote_sequence);
        header.put_u32_le(ack_bitmap);
        header.extend_from_slice(&body);

        self.requested_ack.insert(
            sequence,
            OutstandingEntry {
                reliable,
                on_ack,
                on_not_ack,
                body,
            },
        );

        self.bandwidth += self.packet_growth;
        self.outbound.push(header.to_vec());
        sequence
    }

    /// Encodes and queues a set of decoded packets as one datagram.
    pub fn queue_packets(&mut self, packets: &[DecodedPacket]) -> u8 {
        let reliable = packets.iter().any(|p| p.reliable);
        let mut body = BytesMut::new();
        encode_collection(packets, &mut body);
        self.queue_body(body.freeze(), reliable, None, None)
    }

    fn update_reliable_information(&mut self, ack_base: u8, ack_bitmap: u32) {
        let mut missed_ack = false;

        for relative in 0..ACK_WINDOW {
            let absolute = ack_base.wrapping_sub(relative as u8 + 1);
            if (ack_bitmap & (1 << relative)) != 0 {
                if let Some(entry) = self.requested_ack.remove(&absolute) {
                    if let Some(cb) = entry.on_ack {
                        cb();
                    }
                    if self.tagged_throttle_sequence == Some(absolute) {
                        self.stop_throttling();
                    }
                }
            }
        }

        if let Some(entry) = self.requested_ack.remove(&ack_base) {
            if let Some(cb) = entry.on_ack {
                cb();
            }
            if self.tagged_throttle_sequence == Some(ack_base) {
                self.stop_throttling();
            }
        }

        let considered_dropped: Vec<u8> = self
            .requested_ack
            .keys()
            .copied()
            .filter(|s| Self::sequence_distance(ack_base, *s) >= ACK_WINDOW as i16)
            .collect();

        for sequence in considered_dropped {
            let Some(entry) = self.requested_ack.remove(&sequence) else {
                continue;
            };
            if let Some(cb) = entry.on_not_ack {
                cb();
            }
            if entry.reliable {
                missed_ack = true;
                self.queue_body(entry.body, true, None, None);
            }
        }

        if missed_ack && !self.throttle_pending {
            self.start_throttling();
        }
    }

    pub fn start_throttling(&mut self) {
        self.bandwidth /= 2.0;
        self.throttle_pending = true;
        debug!(bandwidth = self.bandwidth, "throttling started");
    }

    pub fn stop_throttling(&mut self) {
        self.tagged_throttle_sequence = None;
        self.throttle_pending = false;
    }

    /// Parses a received datagram's header, updates transport bookkeeping,
    /// and returns the decoded packet collection it carried.
    pub fn receive_datagram(&mut self, mut data: Bytes) -> Result<Vec<DecodedPacket>, crate::errors::DecodeError> {
        use bytes::Buf;

        if data.remaining() < 6 {
            return Err(crate::errors::DecodeError::MalformedDatagram(
                "datagram shorter than header".to_string(),
            ));
        }
        let sequence = data.get_u8();
        let ack_base = data.get_u8();
        let ack_bitmap = data.get_u32_le();

        self.update_reliable_information(ack_base, ack_bitmap);

        if Self::is_more_recent(sequence, self.remote_sequence) {
            self.remote_sequence = sequence;
        }

        self.received_window.push_back(sequence);
        if self.received_window.len() > ACK_WINDOW {
            self.received_window.pop_front();
        }

        self.last_received_time = Some(Instant::now());

        decode_collection(data)
    }

    /// Drains the queued outbound datagram bodies, appending a heartbeat
    /// first if this is a network tick.
    pub fn drain_outbound(&mut self, is_network_tick: bool) -> Vec<Vec<u8>> {
        if is_network_tick {
            let sample_id = self.latency_calculator.lock().unwrap().start_sample();
            let heartbeat = DecodedPacket {
                protocol_id: crate::packet::ProtocolId::Heartbeat,
                reliable: false,
                payload: Bytes::new(),
            };
            let mut body = BytesMut::new();
            encode_collection(&[heartbeat], &mut body);

            let on_ack_calculator = self.latency_calculator.clone();
            let on_not_ack_calculator = self.latency_calculator.clone();
            self.queue_body(
                body.freeze(),
                false,
                Some(Box::new(move || {
                    on_ack_calculator.lock().unwrap().stop_sample(sample_id);
                })),
                Some(Box::new(move || {
                    on_not_ack_calculator.lock().unwrap().ignore_sample(sample_id);
                })),
            );
        }

        std::mem::take(&mut self.outbound)
    }

    pub fn timed_out(&self) -> bool {
        match self.last_received_time {
            None => false,
            Some(last) => last.elapsed() > self.timeout_duration,
        }
    }

    pub fn check_timeout(&self) {
        if self.timed_out() {
            warn!(secs = self.timeout_duration.as_secs(), "connection timed out");
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}
