//! Crate-level integration scenarios, cutting across packet parsing,
//! connection dispatch, and the endpoint registry.

use std::net::SocketAddr;
use std::sync::Arc;

use quicproto::coding::BufMutExt;
use quicproto::connection::{Connection, FrameDecoder, FrameReport, TlsEngine};
use quicproto::crypto::Keys;
use quicproto::endpoint::{Config, Endpoint};
use quicproto::packet::{self, PacketType};
use quicproto::transport_error::TransportError;
use quicproto::{ConnectionId, Epoch, Side, VERSION};

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
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

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Scenario A: server creates a Connection off a well-formed first Initial.
#[test]
fn server_side_initial_handshake_creation() {
    let mut ep = Endpoint::new(test_logger(), Arc::new(Config::default()));
    let dcid = [0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8];

    let mut buf = vec![0xC0 | (4 << 4)];
    buf.extend_from_slice(&VERSION.to_be_bytes());
    buf.push(dcid.len() as u8);
    buf.extend_from_slice(&dcid);
    buf.push(0);
    buf.push(0);
    let payload_len = quicproto::MIN_INITIAL_SIZE - buf.len() - 1;
    buf.write_var(payload_len as u64);
    buf.resize(buf.len() + payload_len, 0xAA);

    ep.handle(0, addr(1234), addr(4433), &mut buf, &mut NullTls, &mut NullFrames);
    assert_eq!(ep.connection_count(), 1);
}

/// Scenario B: a coalesced datagram whose second segment's DCID differs from
/// the first aborts the remainder without creating a second connection.
#[test]
fn coalesced_segment_dcid_mismatch_halts_remaining_datagram() {
    let mut ep = Endpoint::new(test_logger(), Arc::new(Config::default()));

    let build = |dcid: &[u8]| {
        let mut buf = vec![0xC0 | (4 << 4)];
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.push(dcid.len() as u8);
        buf.extend_from_slice(dcid);
        buf.push(0);
        buf.push(0);
        let payload_len = quicproto::MIN_INITIAL_SIZE - buf.len() - 1;
        buf.write_var(payload_len as u64);
        buf.resize(buf.len() + payload_len, 0xAA);
        buf
    };

    let mut combined = build(&[1, 1, 1, 1, 1, 1, 1, 1]);
    combined.extend_from_slice(&build(&[2, 2, 2, 2, 2, 2, 2, 2]));

    ep.handle(0, addr(1234), addr(4433), &mut combined, &mut NullTls, &mut NullFrames);
    assert_eq!(ep.connection_count(), 1);
}

/// Scenario C: on 1-RTT AEAD failure, the trailing 16 bytes matching the
/// path's reset secret is recognized as a stateless reset.
#[test]
fn stateless_reset_recognized_by_trailing_secret() {
    let secret = [0x42u8; 16];
    let mut segment = vec![0u8; quicproto::RESET_PACKET_MIN_SIZE + 4];
    let len = segment.len();
    segment[len - 16..].copy_from_slice(&secret);
    assert!(packet::looks_like_stateless_reset(&segment, &secret));

    let mut tampered = segment.clone();
    tampered[len - 1] ^= 0xff;
    assert!(!packet::looks_like_stateless_reset(&tampered, &secret));
}

/// Scenario D: packet-number reconstruction prefers the closer candidate.
#[test]
fn packet_number_reconstruction_prefers_closer_candidate() {
    let mask = !0xFFu64;
    assert_eq!(packet::reconstruct_pn64(0x1FD, mask, 0x7F), 0x17F);
}

/// A client-mode connection accepts a Retry exactly once and rejects a
/// second one.
#[test]
fn retry_is_accepted_once_per_connection() {
    let mut conn = Connection::new(test_logger(), true, ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]), addr(1));

    let retry_header = |pn64: u64| quicproto::packet::PacketHeader {
        ty: PacketType::Retry,
        version: VERSION,
        version_index: 0,
        dest_cnx_id: ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]),
        src_cnx_id: ConnectionId::new(&[9, 9]),
        offset: 0,
        payload_length: 4,
        pn_offset: 0,
        pn: pn64 as u32,
        pn_len: 1,
        pn_mask: 0,
        pn64,
        epoch: Epoch::Initial,
        pc: quicproto::PnSpace::Initial,
        spin: false,
        has_spin_bit: false,
        key_phase: false,
        has_reserved_bit_set: false,
        token_range: None,
    };

    let mut rng = rand::rngs::mock::StepRng::new(1, 1);
    let mut header0 = retry_header(0);
    let outcome1 = conn.incoming_segment(&mut header0, &mut [], &mut NullTls, &mut NullFrames, addr(1), addr(2), 0, &mut rng);
    assert_eq!(outcome1, quicproto::SegmentOutcome::Retry);
    assert_eq!(conn.initial_cnxid, ConnectionId::new(&[9, 9]));

    // A second Retry for the same connection must be rejected: `original_cnxid`
    // is already populated.
    let outcome2 = conn.incoming_retry(&retry_header(0));
    assert_eq!(outcome2, quicproto::SegmentOutcome::Detected);
}
