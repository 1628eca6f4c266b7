//! Per-connection lifecycle, segment dispatch, and connection-ID stash
//! management (§3, §4.3).
//!
//! The frame-body decoder and the TLS engine are external collaborators
//! named only by the [`FrameDecoder`]/[`TlsEngine`] contracts; this module
//! owns everything else a segment touches on its way in: state transitions,
//! connection-ID checks, path-finding, and crypto-context bookkeeping.

use std::collections::VecDeque;
use std::net::SocketAddr;

use rand::RngCore;
use slog::Logger;

use crate::crypto::{CryptoContexts, Keys};
use crate::packet::{self, PacketHeader, PacketType};
use crate::path::{self, Path, PathOutcome};
use crate::transport_error::{ConnectionError, TransportError};
use crate::{ConnectionId, Epoch, PnSpace, SegmentOutcome, Side};

/// Per-pc (packet-number space) bookkeeping, mirroring the teacher's
/// `AssembledPacketNumber`/SACK tracking but reduced to what this crate
/// dispatches on: whether a PN has already been seen, and whether an ACK is
/// owed.
#[derive(Default)]
pub struct PnContext {
    pub send_sequence: u64,
    pub highest_acknowledged: u64,
    pub largest_received: Option<u64>,
    pub ack_needed: bool,
    pub retransmit_oldest: u64,
    received: Vec<u64>,
}

impl PnContext {
    fn already_received(&self, pn64: u64) -> bool {
        Some(pn64) <= self.largest_received && self.received.contains(&pn64)
    }

    fn record_received(&mut self, pn64: u64) {
        self.largest_received = Some(self.largest_received.map_or(pn64, |h| h.max(pn64)));
        self.received.push(pn64);
        self.ack_needed = true;
    }
}

/// Lifecycle states of a `Connection` (§3). Named, not numeric, per the
/// "never a magic integer" dispatcher discipline.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    ClientInitSent,
    ClientInitResent,
    ClientHandshakeStart,
    ClientHandshakeProgress,
    ClientAlmostReady,
    ServerInit,
    ServerAlmostReady,
    ServerFalseStart,
    Ready,
    ClosingReceived,
    Closing,
    Draining,
    Disconnected,
    HandshakeFailure,
}

impl State {
    fn is_closing_family(self) -> bool {
        matches!(self, State::ClosingReceived | State::Closing | State::Draining)
    }
}

/// The non-control frame body decoder, abstracted per §1: this crate only
/// needs to know whether decoding succeeded and whether it saw a
/// connection-closing frame.
pub trait FrameDecoder {
    fn decode_frames(&mut self, buf: &[u8], epoch: Epoch, path: usize) -> Result<FrameReport, TransportError>;
}

#[derive(Debug, Default, Copy, Clone)]
pub struct FrameReport {
    pub saw_close: bool,
    pub close_acknowledged: bool,
}

/// The TLS engine collaborator (§1): owns handshake-flight generation and
/// hands back newly available key material as it negotiates each epoch.
pub trait TlsEngine {
    /// Feed it received crypto-stream bytes for `epoch`; it may return
    /// freshly derived keys for a not-yet-ready epoch.
    fn pump(&mut self, epoch: Epoch, side: Side) -> Option<(Epoch, Keys, Keys)>;
}

pub struct Connection {
    pub log: Logger,
    pub state: State,
    pub client_mode: bool,

    pub initial_cnxid: ConnectionId,
    pub original_cnxid: ConnectionId,

    pub contexts: CryptoContexts,

    pub pn_initial: PnContext,
    pub pn_handshake: PnContext,
    pub pn_application: PnContext,

    pub paths: Vec<Path>,
    pub cnxid_stash: VecDeque<(ConnectionId, [u8; 16])>,

    pub retry_token: Option<Vec<u8>>,
    pub initial_validated: bool,

    pub is_1rtt_received: bool,
    pub sending_ecn_ack: bool,
    pub ecn_ect0: u64,
    pub ecn_ect1: u64,
    pub ecn_ce: u64,

    /// Set once a stateless reset is recognized, so `termination_reason`
    /// reports `ConnectionError::Reset` rather than `TimedOut` for the same
    /// `State::Disconnected` transition.
    reset_received: bool,
}

impl Connection {
    pub fn new(log: Logger, client_mode: bool, initial_cnxid: ConnectionId, peer_addr: SocketAddr) -> Self {
        let state = if client_mode { State::ClientInitSent } else { State::ServerInit };
        let mut path0 = Path::new(peer_addr, ConnectionId::new(&[]), ConnectionId::new(&[]), [0; 16]);
        path0.activated = true;
        path0.registered = true;

        // Initial secrets are derivable unilaterally (RFC 9001 §5.2); the
        // keys needed to decrypt the *peer's* Initial packets are keyed off
        // the opposite side's label.
        let remote_side = if client_mode { Side::Server } else { Side::Client };
        let mut contexts = CryptoContexts::new();
        contexts.initial.set(Keys::initial(&initial_cnxid, remote_side));

        Self {
            log,
            state,
            client_mode,
            initial_cnxid,
            original_cnxid: ConnectionId::new(&[]),
            contexts,
            pn_initial: PnContext::default(),
            pn_handshake: PnContext::default(),
            pn_application: PnContext::default(),
            paths: vec![path0],
            cnxid_stash: VecDeque::new(),
            retry_token: None,
            initial_validated: false,
            is_1rtt_received: false,
            sending_ecn_ack: false,
            ecn_ect0: 0,
            ecn_ect1: 0,
            ecn_ce: 0,
            reset_received: false,
        }
    }

    fn pn_context(&mut self, pc: PnSpace) -> &mut PnContext {
        match pc {
            PnSpace::Initial => &mut self.pn_initial,
            PnSpace::Handshake => &mut self.pn_handshake,
            PnSpace::Application => &mut self.pn_application,
        }
    }

    /// §2/§5: parse → decrypt → dispatch. The single entrypoint a parsed
    /// segment (still header-protected, `segment` mutable in place) is
    /// handed to. Runs header-protection removal, 64-bit packet-number
    /// reconstruction, and AEAD packet-protection removal before any
    /// per-type dispatch sees the packet, then returns the tagged outcome
    /// the outer coalesce loop acts on.
    #[allow(clippy::too_many_arguments)]
    pub fn incoming_segment(
        &mut self,
        header: &mut PacketHeader,
        segment: &mut [u8],
        tls: &mut dyn TlsEngine,
        frames: &mut dyn FrameDecoder,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        now: u64,
        rng: &mut dyn RngCore,
    ) -> SegmentOutcome {
        match header.ty {
            PacketType::VersionNegotiation => return self.incoming_vn(),
            PacketType::Retry => return self.incoming_retry(header),
            _ => {}
        }

        let plaintext_len = match self.decrypt_segment(header, segment, peer_addr, now) {
            Ok(n) => n,
            Err(outcome) => {
                if header.ty == PacketType::OneRtt
                    && segment.len() >= crate::RESET_PACKET_MIN_SIZE
                    && packet::looks_like_stateless_reset(segment, &self.paths[0].reset_secret)
                {
                    self.reset_received = true;
                    self.state = State::Disconnected;
                    return SegmentOutcome::StatelessReset;
                }
                return outcome;
            }
        };

        if self.pn_context(header.pc).already_received(header.pn64) {
            self.pn_context(header.pc).ack_needed = true;
            return SegmentOutcome::Duplicate;
        }

        let body_start = header.pn_offset + header.pn_len;
        let plaintext = &segment[body_start..body_start + plaintext_len];

        let outcome = match header.ty {
            PacketType::Initial => {
                if self.client_mode {
                    self.incoming_server_initial(header, plaintext, tls, frames)
                } else {
                    self.incoming_client_initial(header, plaintext, tls, frames)
                }
            }
            PacketType::Handshake => self.incoming_handshake(header, plaintext, tls, frames),
            PacketType::ZeroRtt => self.incoming_0rtt(header, plaintext, frames),
            PacketType::OneRtt => self.incoming_encrypted(header, plaintext, frames, peer_addr, local_addr, now, rng),
            PacketType::VersionNegotiation | PacketType::Retry | PacketType::Error => SegmentOutcome::Detected,
        };

        if outcome.is_accepted() {
            self.pn_context(header.pc).record_received(header.pn64);
        }
        outcome
    }

    /// §4.2 decrypt stage: HP-removal → PN reconstruction → packet-protection
    /// removal. `peer_addr` only picks which path's `retransmit_timer` sizes
    /// a 1-RTT key-rotation guard (a cheap address match, not the full
    /// NAT-rebinding `find_path`, which still runs afterward in
    /// `incoming_encrypted` once the segment is known genuine).
    fn decrypt_segment(&mut self, header: &mut PacketHeader, segment: &mut [u8], peer_addr: SocketAddr, now: u64) -> Result<usize, SegmentOutcome> {
        let path_guess = self.paths.iter().position(|p| p.peer_addr == peer_addr).unwrap_or(0);
        let retransmit_timer = self.paths[path_guess].retransmit_timer;

        let keys = self.contexts.slot(header.epoch).get().ok_or(SegmentOutcome::AeadCheck)?;
        if !packet::remove_header_protection(segment, header, packet::HP_SAMPLE_SIZE, |sample| keys.pn_decrypt(sample)) {
            return Err(SegmentOutcome::AeadCheck);
        }

        let highest = self.pn_context(header.pc).largest_received.unwrap_or(0);
        header.pn64 = packet::reconstruct_pn64(highest, header.pn_mask, header.pn);

        if header.payload_length < header.pn_len {
            return Err(SegmentOutcome::AeadCheck);
        }
        let ciphertext_len = header.payload_length - header.pn_len;
        let body_start = header.pn_offset + header.pn_len;
        if body_start + ciphertext_len > segment.len() {
            return Err(SegmentOutcome::AeadCheck);
        }

        let (cleartext_header, rest) = segment.split_at_mut(body_start);
        let payload = &mut rest[..ciphertext_len];
        packet::remove_packet_protection(header, cleartext_header, payload, &mut self.contexts, now, retransmit_timer)
            .map_err(|_| SegmentOutcome::AeadCheck)
    }

    fn incoming_vn(&mut self) -> SegmentOutcome {
        if !self.client_mode || self.state != State::ClientInitSent {
            return SegmentOutcome::UnexpectedPacket;
        }
        debug!(self.log, "received version negotiation");
        self.state = State::Disconnected;
        SegmentOutcome::Ok
    }

    fn incoming_retry(&mut self, header: &PacketHeader) -> SegmentOutcome {
        if !self.client_mode || !matches!(self.state, State::ClientInitSent | State::ClientInitResent) {
            return SegmentOutcome::UnexpectedPacket;
        }
        if !self.original_cnxid.is_empty() {
            return SegmentOutcome::Detected;
        }
        if header.pn64 != 0 {
            return SegmentOutcome::Detected;
        }
        // ODCID/token parsing is carried in `header.token_range` against the
        // cleartext payload by the caller; here we only gate the transition.
        if header.dest_cnx_id != self.initial_cnxid {
            return SegmentOutcome::Detected;
        }
        self.original_cnxid = self.initial_cnxid.clone();
        self.initial_cnxid = header.src_cnx_id.clone();
        self.state = State::ClientInitSent;
        info!(self.log, "retry accepted"; "new_scid" => %header.src_cnx_id);
        SegmentOutcome::Retry
    }

    fn incoming_client_initial(&mut self, header: &PacketHeader, plaintext: &[u8], tls: &mut dyn TlsEngine, frames: &mut dyn FrameDecoder) -> SegmentOutcome {
        match self.state {
            State::ServerInit => {
                // RFC 9000 §7.2: a client-chosen Initial DCID must be at
                // least 8 bytes.
                const MIN_INITIAL_DCID_LEN: usize = 8;
                if header.dest_cnx_id.len() < MIN_INITIAL_DCID_LEN {
                    self.state = State::HandshakeFailure;
                    return SegmentOutcome::InitialCidTooShort;
                }
                self.run_handshake_epoch(header, plaintext, tls, frames, State::ServerAlmostReady)
            }
            State::ServerAlmostReady | State::ServerFalseStart => {
                self.ignore_incoming_handshake(header);
                SegmentOutcome::Ok
            }
            _ => SegmentOutcome::UnexpectedPacket,
        }
    }

    fn incoming_server_initial(&mut self, header: &PacketHeader, plaintext: &[u8], tls: &mut dyn TlsEngine, frames: &mut dyn FrameDecoder) -> SegmentOutcome {
        match self.state {
            State::ClientInitSent | State::ClientInitResent => {
                self.paths[0].remote_cnxid = header.src_cnx_id.clone();
                self.state = State::ClientHandshakeStart;
                self.run_handshake_epoch(header, plaintext, tls, frames, State::ClientHandshakeStart)
            }
            State::ClientHandshakeStart | State::ClientHandshakeProgress => {
                if header.src_cnx_id != self.paths[0].remote_cnxid {
                    return SegmentOutcome::CnxidCheck;
                }
                self.run_handshake_epoch(header, plaintext, tls, frames, State::ClientHandshakeStart)
            }
            _ => SegmentOutcome::UnexpectedPacket,
        }
    }

    fn incoming_handshake(&mut self, header: &PacketHeader, plaintext: &[u8], tls: &mut dyn TlsEngine, frames: &mut dyn FrameDecoder) -> SegmentOutcome {
        let expected_remote = &self.paths[0].remote_cnxid;
        if !expected_remote.is_empty() && header.src_cnx_id != *expected_remote {
            return SegmentOutcome::CnxidCheck;
        }
        if header.payload_length == 0 {
            self.state = State::HandshakeFailure;
            return SegmentOutcome::UnexpectedPacket;
        }
        match self.state {
            State::Ready | State::ClosingReceived | State::Closing | State::Draining | State::Disconnected => {
                self.ignore_incoming_handshake(header);
                SegmentOutcome::Ok
            }
            _ => {
                let before = self.contexts.handshake.is_ready();
                let outcome = self.decode_and_pump(header, plaintext, tls, frames, Epoch::Handshake);
                if !before && self.contexts.handshake.is_ready() && self.client_mode {
                    self.state = State::ClientHandshakeProgress;
                    self.pn_initial.ack_needed = true;
                }
                outcome
            }
        }
    }

    fn incoming_0rtt(&mut self, header: &PacketHeader, plaintext: &[u8], frames: &mut dyn FrameDecoder) -> SegmentOutcome {
        let accepted_state = matches!(self.state, State::ServerAlmostReady | State::ServerFalseStart)
            || (self.state == State::Ready && !self.is_1rtt_received);
        if !accepted_state {
            return SegmentOutcome::UnexpectedPacket;
        }
        if header.dest_cnx_id != self.initial_cnxid && header.dest_cnx_id != self.paths[0].local_cnxid {
            return SegmentOutcome::CnxidCheck;
        }
        if header.src_cnx_id != self.paths[0].remote_cnxid {
            return SegmentOutcome::CnxidCheck;
        }
        if header.payload_length == 0 {
            return SegmentOutcome::UnexpectedPacket;
        }
        match frames.decode_frames(plaintext, header.epoch, 0) {
            Ok(_) => SegmentOutcome::Ok,
            Err(_) => SegmentOutcome::UnexpectedPacket,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn incoming_encrypted(
        &mut self,
        header: &PacketHeader,
        plaintext: &[u8],
        frames: &mut dyn FrameDecoder,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        now: u64,
        rng: &mut dyn RngCore,
    ) -> SegmentOutcome {
        if matches!(self.state, State::Disconnected) || !matches!(
            self.state,
            State::ClientAlmostReady
                | State::ServerAlmostReady
                | State::ServerFalseStart
                | State::Ready
                | State::ClosingReceived
                | State::Closing
                | State::Draining
        ) {
            return SegmentOutcome::UnexpectedPacket;
        }

        if self.state.is_closing_family() {
            let report = frames.decode_frames(plaintext, header.epoch, 0).unwrap_or_default();
            if report.close_acknowledged {
                self.state = if self.client_mode { State::Disconnected } else { State::Draining };
            }
            return SegmentOutcome::Ok;
        }

        if header.payload_length == 0 || header.has_reserved_bit_set {
            self.state = State::HandshakeFailure;
            return SegmentOutcome::UnexpectedPacket;
        }

        let local_cids_empty = self.paths.iter().all(|p| p.local_cnxid.is_empty());
        let mut stash = self.cnxid_stash.clone();
        let outcome = path::find_path(
            &mut self.paths,
            &header.dest_cnx_id,
            peer_addr,
            local_addr,
            header.pn64,
            self.pn_application.highest_acknowledged,
            self.client_mode,
            local_cids_empty,
            rng,
            now,
            || stash.pop_front(),
        );
        self.cnxid_stash = stash;

        let path_idx = match outcome {
            PathOutcome::Resolved(idx) => idx,
            PathOutcome::CnxidCheck => return SegmentOutcome::CnxidCheck,
        };

        self.is_1rtt_received = true;
        match frames.decode_frames(plaintext, header.epoch, path_idx) {
            Ok(_) => SegmentOutcome::Ok,
            Err(code) => {
                self.close(code);
                SegmentOutcome::UnexpectedPacket
            }
        }
    }

    fn ignore_incoming_handshake(&mut self, header: &PacketHeader) {
        self.pn_context(header.pc).ack_needed = true;
    }

    fn run_handshake_epoch(
        &mut self,
        header: &PacketHeader,
        plaintext: &[u8],
        tls: &mut dyn TlsEngine,
        frames: &mut dyn FrameDecoder,
        next_state: State,
    ) -> SegmentOutcome {
        if self.paths[0].local_addr.is_none() {
            // local_addr is filled in by the caller once known; placeholder
            // kept here only to mirror the §4.3 ordering of operations.
        }
        let outcome = self.decode_and_pump(header, plaintext, tls, frames, header.epoch);
        if outcome.is_accepted() && matches!(self.state, State::ServerInit | State::ClientHandshakeStart) {
            self.state = next_state;
        }
        outcome
    }

    fn decode_and_pump(&mut self, header: &PacketHeader, plaintext: &[u8], tls: &mut dyn TlsEngine, frames: &mut dyn FrameDecoder, epoch: Epoch) -> SegmentOutcome {
        match frames.decode_frames(plaintext, epoch, 0) {
            Ok(_) => {
                if let Some((ready_epoch, open, seal)) = tls.pump(epoch, self.side()) {
                    self.contexts.slot_mut(ready_epoch).set(open);
                    let _ = seal; // encrypt-side keys are owned by the send path, out of scope here.
                }
                self.pn_context(header.pc).ack_needed = true;
                SegmentOutcome::Ok
            }
            Err(code) => {
                self.close(code);
                SegmentOutcome::UnexpectedPacket
            }
        }
    }

    fn side(&self) -> Side {
        if self.client_mode {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn close(&mut self, error_code: TransportError) {
        warn!(self.log, "connection closing"; "error" => %error_code);
        self.state = State::Closing;
    }

    /// Terminal reason to surface to the application callback, once per
    /// connection, as it leaves `Ready` (or fails to reach it).
    pub fn termination_reason(&self) -> Option<ConnectionError> {
        match self.state {
            State::Disconnected if self.reset_received => Some(ConnectionError::Reset),
            State::Disconnected => Some(ConnectionError::TimedOut),
            State::HandshakeFailure => Some(ConnectionError::TransportError {
                error_code: TransportError::ProtocolViolation,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::BufMutExt;
    use crate::packet::PacketHeader;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    struct NullFrames;
    impl FrameDecoder for NullFrames {
        fn decode_frames(&mut self, _buf: &[u8], _epoch: Epoch, _path: usize) -> Result<FrameReport, TransportError> {
            Ok(FrameReport::default())
        }
    }

    struct NullTls;
    impl TlsEngine for NullTls {
        fn pump(&mut self, _epoch: Epoch, _side: Side) -> Option<(Epoch, Keys, Keys)> {
            None
        }
    }

    fn blank_header(ty: PacketType, pc: PnSpace, epoch: Epoch, pn64: u64) -> PacketHeader {
        PacketHeader {
            ty,
            version: crate::VERSION,
            version_index: 0,
            dest_cnx_id: ConnectionId::new(&[1, 2]),
            src_cnx_id: ConnectionId::new(&[3, 4]),
            offset: 0,
            payload_length: 4,
            pn_offset: 0,
            pn: pn64 as u32,
            pn_len: 1,
            pn_mask: 0,
            pn64,
            epoch,
            pc,
            spin: false,
            has_spin_bit: false,
            key_phase: false,
            has_reserved_bit_set: false,
            token_range: None,
        }
    }

    /// Builds a header-protected, AEAD-protected Initial segment an
    /// `Endpoint`/`Connection` could legitimately decrypt, so dispatch tests
    /// exercise the real decrypt stage rather than a synthetic passthrough.
    fn protected_initial_segment(dcid: &[u8], scid: &[u8], pn: u32, plaintext: &[u8], decrypting_side: Side) -> Vec<u8> {
        let keys = Keys::initial(&ConnectionId::new(dcid), decrypting_side);

        let mut header = vec![0xC0 | (4 << 4)];
        header.extend_from_slice(&crate::VERSION.to_be_bytes());
        header.push(dcid.len() as u8);
        header.extend_from_slice(dcid);
        header.push(scid.len() as u8);
        header.extend_from_slice(scid);
        header.push(0); // token length
        let payload_length = 1 + plaintext.len() + ring::aead::MAX_TAG_LEN;
        header.write_var(payload_length as u64);
        let pn_offset = header.len();
        header.push((pn & 0xFF) as u8);

        let mut payload = plaintext.to_vec();
        keys.aead_encrypt(u64::from(pn), &header, &mut payload, plaintext.len()).unwrap();

        let mut buf = header;
        buf.extend_from_slice(&payload);

        let sample_offset = pn_offset + 4;
        let sample: [u8; 16] = buf[sample_offset..sample_offset + 16].try_into().unwrap();
        let mask = keys.pn_decrypt(&sample);
        buf[0] ^= mask[0] & 0x0f;
        buf[pn_offset] ^= mask[1];
        buf
    }

    fn header_for(segment: &[u8], local_dcid_len: usize) -> PacketHeader {
        crate::packet::parse_header(segment, local_dcid_len).unwrap()
    }

    #[test]
    fn server_creates_connection_and_advances_past_server_init() {
        // Scenario A.
        let dcid = [0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8];
        let mut conn = Connection::new(test_logger(), false, ConnectionId::new(&dcid), SocketAddr::from(([127, 0, 0, 1], 1234)));
        assert_eq!(conn.state, State::ServerInit);

        let mut segment = protected_initial_segment(&dcid, &[3, 4], 0, &[0xAA; 16], Side::Client);
        let mut header = header_for(&segment, 0);
        let mut rng = rand::rngs::mock::StepRng::new(1, 1);
        let outcome = conn.incoming_segment(
            &mut header,
            &mut segment,
            &mut NullTls,
            &mut NullFrames,
            SocketAddr::from(([127, 0, 0, 1], 1234)),
            SocketAddr::from(([127, 0, 0, 1], 4433)),
            0,
            &mut rng,
        );
        assert_eq!(outcome, SegmentOutcome::Ok);
        assert_eq!(conn.state, State::ServerAlmostReady);
    }

    #[test]
    fn duplicate_packet_number_is_rejected_without_redelivery() {
        let dcid = [1u8; 8];
        let mut conn = Connection::new(test_logger(), false, ConnectionId::new(&dcid), SocketAddr::from(([127, 0, 0, 1], 1)));
        let mut rng = rand::rngs::mock::StepRng::new(1, 1);
        let a = [127, 0, 0, 1];
        let p1 = SocketAddr::from((a, 1));
        let p2 = SocketAddr::from((a, 2));

        let mut segment1 = protected_initial_segment(&dcid, &[3, 4], 3, &[0xAA; 16], Side::Client);
        let mut header1 = header_for(&segment1, 0);
        let first = conn.incoming_segment(&mut header1, &mut segment1, &mut NullTls, &mut NullFrames, p1, p2, 0, &mut rng);
        assert_eq!(first, SegmentOutcome::Ok);

        let mut segment2 = protected_initial_segment(&dcid, &[3, 4], 3, &[0xAA; 16], Side::Client);
        let mut header2 = header_for(&segment2, 0);
        let second = conn.incoming_segment(&mut header2, &mut segment2, &mut NullTls, &mut NullFrames, p1, p2, 0, &mut rng);
        assert_eq!(second, SegmentOutcome::Duplicate);
    }

    #[test]
    fn retry_outside_client_init_states_is_unexpected() {
        let mut conn = Connection::new(test_logger(), true, ConnectionId::new(&[1]), SocketAddr::from(([127, 0, 0, 1], 1)));
        conn.state = State::Ready;
        let header = blank_header(PacketType::Retry, PnSpace::Initial, Epoch::Initial, 0);
        assert_eq!(conn.incoming_retry(&header), SegmentOutcome::UnexpectedPacket);
    }

    #[test]
    fn handshake_segment_with_mismatched_scid_is_cnxid_check() {
        let mut conn = Connection::new(test_logger(), true, ConnectionId::new(&[1]), SocketAddr::from(([127, 0, 0, 1], 1)));
        conn.paths[0].remote_cnxid = ConnectionId::new(&[9, 9]);
        conn.state = State::ClientHandshakeStart;
        let header = blank_header(PacketType::Handshake, PnSpace::Handshake, Epoch::Handshake, 1);
        let outcome = conn.incoming_handshake(&header, &[], &mut NullTls, &mut NullFrames);
        assert_eq!(outcome, SegmentOutcome::CnxidCheck);
    }
}
