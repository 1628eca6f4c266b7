//! The process-wide connection registry and datagram entrypoint (§5, §6).
//!
//! `Endpoint` owns every `Connection` in a `Slab`, indexed by connection ID
//! and by remote address, and is the single mutator of that registry (§5).
//! It does not own a socket: outbound datagrams are appended to `Io` and
//! drained by an external collaborator.

use std::net::SocketAddr;
use std::sync::Arc;

use fnv::FnvHashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use slab::Slab;
use slog::Logger;

use crate::connection::{Connection, FrameDecoder, TlsEngine};
use crate::packet::{self, PacketHeader, PacketType};
use crate::{
    ConnectionId, SegmentOutcome, Side, CHALLENGE_REPEAT_MAX, CONNECTION_ID_MAX_SIZE, CONNECTION_ID_MIN_SIZE,
    CWIN_INITIAL, CWIN_MINIMUM, ENFORCED_INITIAL_CID_LENGTH, ENFORCED_INITIAL_MTU, MIN_INITIAL_SIZE,
    MIN_MAX_RTT_SCOPE, RESET_PACKET_PAD_SIZE, RESET_PACKET_MIN_SIZE, TARGET_RENO_RTT_US, TOKEN_DELAY_SHORT, VERSION,
};

/// Parameters governing this endpoint's connections, following the
/// teacher's `Arc<Config>`-shared-across-connections pattern.
pub struct Config {
    pub cwin_initial: u64,
    pub cwin_minimum: u64,
    pub target_reno_rtt_us: u64,
    pub enforced_initial_mtu: u16,
    pub enforced_initial_cid_length: usize,
    pub reset_packet_min_size: usize,
    pub reset_packet_pad_size: usize,
    pub challenge_repeat_max: usize,
    pub min_max_rtt_scope: usize,
    pub connection_id_min_size: usize,
    pub connection_id_max_size: usize,
    pub token_delay_short: u64,
    /// Length of connection IDs this endpoint issues. Must be 0 (identify
    /// paths by address alone) or between 1 and `connection_id_max_size`.
    pub local_cid_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwin_initial: CWIN_INITIAL,
            cwin_minimum: CWIN_MINIMUM,
            target_reno_rtt_us: TARGET_RENO_RTT_US,
            enforced_initial_mtu: ENFORCED_INITIAL_MTU,
            enforced_initial_cid_length: ENFORCED_INITIAL_CID_LENGTH,
            reset_packet_min_size: RESET_PACKET_MIN_SIZE,
            reset_packet_pad_size: RESET_PACKET_PAD_SIZE,
            challenge_repeat_max: CHALLENGE_REPEAT_MAX,
            min_max_rtt_scope: MIN_MAX_RTT_SCOPE,
            connection_id_min_size: CONNECTION_ID_MIN_SIZE,
            connection_id_max_size: CONNECTION_ID_MAX_SIZE,
            token_delay_short: TOKEN_DELAY_SHORT,
            local_cid_len: ENFORCED_INITIAL_CID_LENGTH,
        }
    }
}

/// A handle into the registry `Slab`. Stable across datagrams; invalidated
/// only once the `Connection` is fully drained and removed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionHandle(pub usize);

/// Outbound work the socket-I/O collaborator must perform.
pub enum Io {
    Transmit { destination: SocketAddr, packet: Vec<u8> },
}

/// Application-visible events, drained alongside `Io`.
pub enum Event {
    Connected(ConnectionHandle),
    ConnectionLost { handle: ConnectionHandle, reason: crate::transport_error::ConnectionError },
}

/// Process-wide QUIC registry: two hash indexes onto one `Slab` of
/// connections, per Design Notes §9 ("Global registry").
pub struct Endpoint {
    log: Logger,
    config: Arc<Config>,
    rng: OsRng,
    connections: Slab<Connection>,
    connection_ids_initial: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_ids: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_remotes: FnvHashMap<SocketAddr, ConnectionHandle>,
    pub io: Vec<Io>,
    pub events: Vec<Event>,
}

impl Endpoint {
    pub fn new(log: Logger, config: Arc<Config>) -> Self {
        assert!(
            config.local_cid_len == 0 || (1..=CONNECTION_ID_MAX_SIZE).contains(&config.local_cid_len),
            "local_cid_len must be 0 or a valid connection ID length",
        );
        Self {
            log,
            config,
            rng: OsRng,
            connections: Slab::new(),
            connection_ids_initial: FnvHashMap::default(),
            connection_ids: FnvHashMap::default(),
            connection_remotes: FnvHashMap::default(),
            io: Vec::new(),
            events: Vec::new(),
        }
    }

    fn lookup(&self, dcid: &ConnectionId, remote: SocketAddr) -> Option<ConnectionHandle> {
        let by_cid = if self.config.local_cid_len > 0 {
            self.connection_ids.get(dcid)
        } else {
            None
        };
        by_cid
            .or_else(|| self.connection_ids_initial.get(dcid))
            .or_else(|| self.connection_remotes.get(&remote))
            .copied()
    }

    /// §5: process one UDP datagram end to end, coalescing left-to-right.
    /// `local_addr` is the address the datagram arrived on.
    pub fn handle(
        &mut self,
        now: u64,
        remote: SocketAddr,
        local_addr: SocketAddr,
        mut data: &mut [u8],
        tls: &mut dyn TlsEngine,
        frames: &mut dyn FrameDecoder,
    ) {
        let datagram_len = data.len();
        let mut first_dcid: Option<ConnectionId> = None;
        while !data.is_empty() {
            let header = match packet::parse_header(data, self.config.local_cid_len) {
                Ok(h) => h,
                Err(_) => return,
            };

            if let Some(first) = &first_dcid {
                if *first != header.dest_cnx_id {
                    debug!(self.log, "coalesced segment dcid mismatch, abandoning datagram");
                    return;
                }
            } else {
                first_dcid = Some(header.dest_cnx_id.clone());
            }

            if header.ty == PacketType::Initial && datagram_len < MIN_INITIAL_SIZE {
                return;
            }

            let consumed = header.pn_offset + header.payload_length;
            if consumed > data.len() || consumed == 0 {
                return;
            }
            let (segment, rest) = data.split_at_mut(consumed);

            let outcome = self.handle_segment(now, remote, local_addr, header, segment, tls, frames);
            if outcome.halts_datagram() {
                return;
            }
            data = rest;
        }
    }

    fn handle_segment(
        &mut self,
        now: u64,
        remote: SocketAddr,
        local_addr: SocketAddr,
        mut header: PacketHeader,
        segment: &mut [u8],
        tls: &mut dyn TlsEngine,
        frames: &mut dyn FrameDecoder,
    ) -> SegmentOutcome {
        let handle = self.lookup(&header.dest_cnx_id, remote);

        let handle = match handle {
            Some(h) => h,
            None => match self.maybe_create_connection(&header, remote) {
                Some(h) => h,
                None => {
                    if header.ty == PacketType::OneRtt && segment.len() >= self.config.reset_packet_min_size {
                        let secret = [0u8; 16]; // derived externally from dcid in a real deployment
                        let reset = packet::build_stateless_reset(&mut self.rng, segment.len(), &secret);
                        self.io.push(Io::Transmit { destination: remote, packet: reset });
                    } else if header.version_index < 0 && header.version != 0 && matches!(header.ty, PacketType::Initial | PacketType::Handshake | PacketType::ZeroRtt) {
                        let vn = packet::build_version_negotiation(
                            &mut self.rng,
                            &header.src_cnx_id,
                            &header.dest_cnx_id,
                            &[VERSION],
                            header.version,
                        );
                        self.io.push(Io::Transmit { destination: remote, packet: vn });
                    }
                    return SegmentOutcome::ConnectionDeleted;
                }
            },
        };

        let conn = &mut self.connections[handle.0];
        let outcome = conn.incoming_segment(&mut header, segment, tls, frames, remote, local_addr, now, &mut self.rng);

        if let Some(reason) = conn.termination_reason() {
            self.events.push(Event::ConnectionLost { handle, reason });
            self.connections.remove(handle.0);
            self.connection_ids.retain(|_, h| *h != handle);
            self.connection_ids_initial.retain(|_, h| *h != handle);
            self.connection_remotes.retain(|_, h| *h != handle);
        }

        outcome
    }

    fn maybe_create_connection(&mut self, header: &PacketHeader, remote: SocketAddr) -> Option<ConnectionHandle> {
        if header.ty != PacketType::Initial {
            return None;
        }
        const MIN_INITIAL_DCID_LEN: usize = 8;
        if header.dest_cnx_id.len() < MIN_INITIAL_DCID_LEN {
            return None;
        }

        let child_log = self.log.new(o!("cid" => format!("{}", header.dest_cnx_id)));
        let conn = Connection::new(child_log, false, header.dest_cnx_id.clone(), remote);
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        entry.insert(conn);

        self.connection_ids_initial.insert(header.dest_cnx_id.clone(), handle);
        self.connection_remotes.insert(remote, handle);
        if self.config.local_cid_len > 0 {
            let local_cid = ConnectionId::random(&mut self.rng, self.config.local_cid_len);
            self.connections[handle.0].paths[0].local_cnxid = local_cid.clone();
            self.connection_ids.insert(local_cid, handle);
        }

        Some(handle)
    }

    /// Begin an outgoing (client) connection and register it under its own
    /// randomly chosen Initial DCID.
    pub fn connect(&mut self, remote: SocketAddr) -> ConnectionHandle {
        let initial_cnxid = ConnectionId::random(&mut self.rng, 8);
        let child_log = self.log.new(o!("cid" => format!("{}", initial_cnxid)));
        let conn = Connection::new(child_log, true, initial_cnxid.clone(), remote);
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        entry.insert(conn);
        self.connection_ids_initial.insert(initial_cnxid, handle);
        self.connection_remotes.insert(remote, handle);
        handle
    }

    pub fn connection(&self, handle: ConnectionHandle) -> &Connection {
        &self.connections[handle.0]
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::FrameReport;
    use crate::Epoch;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    struct NullFrames;
    impl FrameDecoder for NullFrames {
        fn decode_frames(&mut self, _buf: &[u8], _epoch: Epoch, _path: usize) -> Result<FrameReport, crate::transport_error::TransportError> {
            Ok(FrameReport::default())
        }
    }

    struct NullTls;
    impl TlsEngine for NullTls {
        fn pump(&mut self, _epoch: Epoch, _side: Side) -> Option<(Epoch, crate::crypto::Keys, crate::crypto::Keys)> {
            None
        }
    }

    fn initial_datagram(dcid: &[u8]) -> Vec<u8> {
        let mut buf = vec![0xC0 | (4 << 4)];
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.push(dcid.len() as u8);
        buf.extend_from_slice(dcid);
        buf.push(0); // scid len
        buf.push(0); // token len
        let payload_len = MIN_INITIAL_SIZE - buf.len() - 1;
        crate::coding::BufMutExt::write_var(&mut buf, payload_len as u64);
        buf.resize(buf.len() + payload_len, 0xAA);
        buf
    }

    #[test]
    fn unknown_dcid_initial_creates_a_connection() {
        let mut ep = Endpoint::new(test_logger(), Arc::new(Config::default()));
        let dcid = [0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8];
        let mut datagram = initial_datagram(&dcid);
        ep.handle(
            0,
            SocketAddr::from(([127, 0, 0, 1], 1234)),
            SocketAddr::from(([127, 0, 0, 1], 4433)),
            &mut datagram,
            &mut NullTls,
            &mut NullFrames,
        );
        assert_eq!(ep.connection_count(), 1);
    }

    #[test]
    fn short_initial_is_dropped_without_creating_state() {
        let mut ep = Endpoint::new(test_logger(), Arc::new(Config::default()));
        let mut buf = vec![0xC0 | (4 << 4)];
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.push(8);
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buf.push(0);
        buf.push(0);
        crate::coding::BufMutExt::write_var(&mut buf, 4u64);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        ep.handle(
            0,
            SocketAddr::from(([127, 0, 0, 1], 1234)),
            SocketAddr::from(([127, 0, 0, 1], 4433)),
            &mut buf,
            &mut NullTls,
            &mut NullFrames,
        );
        assert_eq!(ep.connection_count(), 0);
    }

    #[test]
    fn coalesced_datagram_with_mismatched_dcid_halts_parsing() {
        // Scenario B.
        let mut ep = Endpoint::new(test_logger(), Arc::new(Config::default()));
        let first = initial_datagram(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let second = initial_datagram(&[9, 9, 9, 9, 9, 9, 9, 9]);
        let mut combined = first.clone();
        combined.extend_from_slice(&second);
        ep.handle(
            0,
            SocketAddr::from(([127, 0, 0, 1], 1234)),
            SocketAddr::from(([127, 0, 0, 1], 4433)),
            &mut combined,
            &mut NullTls,
            &mut NullFrames,
        );
        // Only the first segment's connection should have been created.
        assert_eq!(ep.connection_count(), 1);
    }
}
