//! Packet parsing and the cryptographic envelope: long/short header
//! parsing, 64-bit packet-number reconstruction, header-protection removal,
//! and AEAD packet-protection removal (§4.2).

use bytes::Buf;

use crate::coding::BufExt;
use crate::crypto::{CryptoContexts, CryptoError};
use crate::{ConnectionId, Epoch, PnSpace, SegmentOutcome, Side, VERSION};

/// Poison value written into a header's packet number when header
/// protection removal fails outright (§4.2: "poisons the header").
pub const POISONED_PN: u32 = 0xFFFF_FFFF;

/// Header-protection sample size. Fixed at 16 bytes for both cipher suites
/// this crate supports (AES-128 and ChaCha20).
pub const HP_SAMPLE_SIZE: usize = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketType {
    VersionNegotiation,
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    OneRtt,
    Error,
}

/// Transient header produced by the parser for one segment of a datagram.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub ty: PacketType,
    pub version: u32,
    /// -1 ⇒ unknown/unsupported version.
    pub version_index: i32,
    pub dest_cnx_id: ConnectionId,
    pub src_cnx_id: ConnectionId,
    /// Header length (bytes before the packet-number field content).
    pub offset: usize,
    pub payload_length: usize,
    pub pn_offset: usize,
    /// Truncated packet number (1-4 bytes wide, stored widened).
    pub pn: u32,
    pub pn_len: usize,
    pub pn_mask: u64,
    pub pn64: u64,
    pub epoch: Epoch,
    pub pc: PnSpace,
    pub spin: bool,
    pub has_spin_bit: bool,
    pub key_phase: bool,
    pub has_reserved_bit_set: bool,
    pub token_range: Option<(usize, usize)>,
}

/// §4.2 header parsing. Does not remove header or packet protection; those
/// require crypto collaborators and happen in later stages.
///
/// `local_dcid_len` is the length this endpoint expects short-header DCIDs
/// to carry (the local CID length for a server, or the peer-assigned DCID
/// length recorded for an outgoing connection).
pub fn parse_header(buf: &[u8], local_dcid_len: usize) -> Result<PacketHeader, SegmentOutcome> {
    if buf.is_empty() {
        return Err(SegmentOutcome::Detected);
    }
    let b0 = buf[0];
    if b0 & 0x80 != 0 {
        parse_long_header(buf, b0)
    } else {
        parse_short_header(buf, b0, local_dcid_len)
    }
}

fn parse_long_header(buf: &[u8], b0: u8) -> Result<PacketHeader, SegmentOutcome> {
    let mut cur = &buf[1..];
    if cur.remaining() < 4 {
        return Err(SegmentOutcome::Detected);
    }
    let version = cur.get_u32();
    let dest_cnx_id = cur.get_cid().ok_or(SegmentOutcome::Detected)?;
    let src_cnx_id = cur.get_cid().ok_or(SegmentOutcome::Detected)?;
    let mut offset = buf.len() - cur.remaining();

    if version == 0 {
        return Ok(PacketHeader {
            ty: PacketType::VersionNegotiation,
            version,
            version_index: -1,
            dest_cnx_id,
            src_cnx_id,
            offset,
            payload_length: cur.remaining(),
            pn_offset: offset,
            pn: 0,
            pn_len: 0,
            pn_mask: 0,
            pn64: 0,
            epoch: Epoch::Initial,
            pc: PnSpace::Initial,
            spin: false,
            has_spin_bit: false,
            key_phase: false,
            has_reserved_bit_set: false,
            token_range: None,
        });
    }

    let version_index = if version == VERSION { 0 } else { -1 };
    let long_type = (b0 >> 4) & 0x7;

    let mut token_range = None;
    let (ty, epoch, pc) = match long_type {
        4 => {
            let token_len = cur.get_var().ok_or(SegmentOutcome::Detected)? as usize;
            if cur.remaining() < token_len {
                return Err(SegmentOutcome::Detected);
            }
            let token_start = buf.len() - cur.remaining();
            cur.advance(token_len);
            token_range = Some((token_start, token_start + token_len));
            (PacketType::Initial, Epoch::Initial, PnSpace::Initial)
        }
        5 => (PacketType::ZeroRtt, Epoch::ZeroRtt, PnSpace::Application),
        6 => (PacketType::Handshake, Epoch::Handshake, PnSpace::Handshake),
        7 => (PacketType::Retry, Epoch::Initial, PnSpace::Initial),
        _ => {
            return Ok(PacketHeader {
                ty: PacketType::Error,
                version,
                version_index,
                dest_cnx_id,
                src_cnx_id,
                offset,
                payload_length: cur.remaining(),
                pn_offset: offset,
                pn: 0,
                pn_len: 0,
                pn_mask: 0,
                pn64: 0,
                epoch: Epoch::Initial,
                pc: PnSpace::Initial,
                spin: false,
                has_spin_bit: false,
                key_phase: false,
                has_reserved_bit_set: false,
                token_range: None,
            });
        }
    };

    if ty == PacketType::Retry {
        // No length/PN fields; the remainder is the Retry payload.
        offset = buf.len() - cur.remaining();
        return Ok(PacketHeader {
            ty,
            version,
            version_index,
            dest_cnx_id,
            src_cnx_id,
            offset,
            payload_length: cur.remaining(),
            pn_offset: offset,
            pn: 0,
            pn_len: 0,
            pn_mask: 0,
            pn64: 0,
            epoch,
            pc,
            spin: false,
            has_spin_bit: false,
            key_phase: false,
            has_reserved_bit_set: false,
            token_range: None,
        });
    }

    let payload_length = cur.get_var().ok_or(SegmentOutcome::Detected)? as usize;
    let pn_offset = buf.len() - cur.remaining();
    if pn_offset + payload_length > buf.len() {
        return Err(SegmentOutcome::Detected);
    }

    Ok(PacketHeader {
        ty,
        version,
        version_index,
        dest_cnx_id,
        src_cnx_id,
        offset: pn_offset,
        payload_length,
        pn_offset,
        pn: 0,
        pn_len: 0,
        pn_mask: 0,
        pn64: 0,
        epoch,
        pc,
        spin: false,
        has_spin_bit: false,
        key_phase: false,
        // Still header-protected at this point; `remove_header_protection`
        // fills in the real value once the reserved bits are legible.
        has_reserved_bit_set: false,
        token_range,
    })
}

fn parse_short_header(buf: &[u8], b0: u8, local_dcid_len: usize) -> Result<PacketHeader, SegmentOutcome> {
    if b0 & 0x40 != 0x40 {
        // Fixed QUIC bit must be set.
        return Ok(PacketHeader {
            ty: PacketType::Error,
            version: 0,
            version_index: -1,
            dest_cnx_id: ConnectionId::new(&[]),
            src_cnx_id: ConnectionId::new(&[]),
            offset: buf.len(),
            payload_length: 0,
            pn_offset: buf.len(),
            pn: 0,
            pn_len: 0,
            pn_mask: 0,
            pn64: 0,
            epoch: Epoch::OneRtt,
            pc: PnSpace::Application,
            spin: false,
            has_spin_bit: false,
            key_phase: false,
            has_reserved_bit_set: false,
            token_range: None,
        });
    }
    if buf.len() < 1 + local_dcid_len {
        return Err(SegmentOutcome::Detected);
    }
    let dest_cnx_id = ConnectionId::new(&buf[1..1 + local_dcid_len]);
    let pn_offset = 1 + local_dcid_len;

    let spin = (b0 >> 5) & 1 == 1;
    let key_phase = (b0 >> 2) & 1 == 1;

    Ok(PacketHeader {
        ty: PacketType::OneRtt,
        version: 0,
        version_index: -1,
        dest_cnx_id,
        src_cnx_id: ConnectionId::new(&[]),
        offset: pn_offset,
        payload_length: buf.len() - pn_offset,
        pn_offset,
        pn: 0,
        pn_len: 0,
        pn_mask: 0,
        pn64: 0,
        epoch: Epoch::OneRtt,
        pc: PnSpace::Application,
        spin,
        has_spin_bit: true,
        key_phase,
        has_reserved_bit_set: false,
        token_range: None,
    })
}

/// §4.2 64-bit packet-number reconstruction.
///
/// `highest` is the largest PN received so far in this `pc`; `mask` is the
/// all-ones mask already shifted by the truncated PN's encoded width
/// (`pn_mask` on `PacketHeader`); `pn` is the truncated value recovered
/// from header protection.
pub fn reconstruct_pn64(highest: u64, mask: u64, pn: u32) -> u64 {
    let expected = highest.wrapping_add(1);
    let win = (!mask).wrapping_add(1); // 2^(8*pn_len)
    let candidate = (expected & mask) | u64::from(pn);

    if win == 0 {
        // pn_len spans the full 64 bits; no ambiguity to resolve.
        return candidate;
    }

    let half_win = win / 2;
    if candidate + half_win <= expected {
        // Candidate is too small by roughly one window; try stepping up,
        // but never past what `expected` can bear.
        if let Some(bumped) = candidate.checked_add(win) {
            return bumped;
        }
        return candidate;
    }
    if candidate > expected + half_win && candidate >= win {
        // Candidate is too large; step down, but never below zero.
        return candidate - win;
    }
    candidate
}

/// §4.2 header-protection removal. Mutates `buf` in place (the first byte
/// and the truncated packet-number bytes are the only parts XORed), and
/// fills in `header.pn`/`pn_len`/`pn_mask`/`key_phase`/`has_reserved_bit_set`.
///
/// `sample_size` is cipher-specific (16 for both AES and ChaCha20 in this
/// crate's supported cipher suites). Returns `false` (and poisons the
/// header) if the protection sample would run past the segment.
pub fn remove_header_protection(
    buf: &mut [u8],
    header: &mut PacketHeader,
    sample_size: usize,
    mask_fn: impl FnOnce(&[u8]) -> [u8; 5],
) -> bool {
    let sample_offset = header.pn_offset + 4;
    if sample_offset + sample_size > buf.len() {
        header.pn = POISONED_PN;
        header.pn_mask = 0;
        header.pn64 = u64::from(POISONED_PN);
        return false;
    }

    let sample = &buf[sample_offset..sample_offset + sample_size];
    let mask = mask_fn(sample);

    let is_long = buf[0] & 0x80 != 0;
    if is_long {
        buf[0] ^= mask[0] & 0x0f;
    } else {
        buf[0] ^= mask[0] & 0x1f;
    }
    let b0 = buf[0];
    let pn_len = (b0 & 0x3) as usize + 1;
    header.pn_len = pn_len;

    let mut pn: u32 = 0;
    for i in 0..pn_len {
        buf[header.pn_offset + i] ^= mask[1 + i];
        pn = (pn << 8) | u32::from(buf[header.pn_offset + i]);
    }
    header.pn = pn;
    header.pn_mask = if pn_len >= 8 {
        u64::MAX
    } else {
        !(((1u64) << (8 * pn_len)) - 1)
    };

    if !is_long {
        header.key_phase = (b0 >> 2) & 1 == 1;
    } else {
        header.has_reserved_bit_set = (b0 & 0x0c) != 0;
    }

    true
}

/// §4.2 packet-protection removal via the appropriate epoch's AEAD keys,
/// including 1-RTT key-rotation accounting.
///
/// `retransmit_timer` is the arrival path's current PTO estimate, used to
/// size a freshly committed rotation's time guard (`DESIGN.md` Open
/// Question 1).
pub fn remove_packet_protection(
    header: &PacketHeader,
    cleartext_header: &[u8],
    payload: &mut [u8],
    contexts: &mut CryptoContexts,
    now: u64,
    retransmit_timer: u64,
) -> Result<usize, CryptoError> {
    match header.epoch {
        Epoch::Initial | Epoch::ZeroRtt | Epoch::Handshake => {
            let keys = contexts
                .slot(header.epoch)
                .get()
                .ok_or(CryptoError::Unavailable)?;
            let n = keys.aead_decrypt(header.pn64, cleartext_header, payload)?;
            if n > header.payload_length {
                return Err(CryptoError::AeadCheck);
            }
            Ok(n)
        }
        Epoch::OneRtt => {
            if header.key_phase == contexts.key_phase_dec {
                let keys = contexts.one_rtt.get().ok_or(CryptoError::Unavailable)?;
                keys.aead_decrypt(header.pn64, cleartext_header, payload)
            } else if header.pn64 < contexts.crypto_rotation_sequence {
                if now > contexts.crypto_rotation_time_guard {
                    return Err(CryptoError::Unavailable);
                }
                let old = contexts
                    .crypto_context_old
                    .as_ref()
                    .ok_or(CryptoError::Unavailable)?;
                old.aead_decrypt(header.pn64, cleartext_header, payload)
            } else {
                let new_keys = contexts
                    .crypto_context_new
                    .as_ref()
                    .ok_or(CryptoError::Unavailable)?;
                let n = new_keys.aead_decrypt(header.pn64, cleartext_header, payload)?;
                contexts.commit_rotation(header.pn64, now, retransmit_timer);
                Ok(n)
            }
        }
    }
}

/// §4.2 stateless-reset recognition: on 1-RTT decrypt failure, compare the
/// trailing 16 bytes of the datagram to the path's reset secret.
pub fn looks_like_stateless_reset(segment: &[u8], reset_secret: &[u8; 16]) -> bool {
    if segment.len() < crate::RESET_PACKET_MIN_SIZE {
        return false;
    }
    let tail = &segment[segment.len() - 16..];
    crate::coding::constant_time_memcmp(tail, reset_secret) == 0
}

/// Build a stateless reset datagram for an unrecognized short-header
/// packet (§4.3 "Stateless responses").
pub fn build_stateless_reset<R: rand::RngCore>(rng: &mut R, observed_len: usize, reset_secret: &[u8; 16]) -> Vec<u8> {
    let b0 = 0x30 | (rng.gen_range_u8(0, 0x20));
    // Uniform in [RESET_PACKET_PAD_SIZE, observed_len - RESET_SECRET_SIZE - 1],
    // matching the upper bound an observer could infer from `observed_len`.
    let upper = observed_len
        .saturating_sub(crate::RESET_SECRET_SIZE + 1)
        .max(crate::RESET_PACKET_PAD_SIZE);
    let pad_len = crate::RESET_PACKET_PAD_SIZE
        + rng.gen_range_u8(0, (upper - crate::RESET_PACKET_PAD_SIZE + 1).min(255) as u8) as usize;
    let mut out = Vec::with_capacity(1 + pad_len + 16);
    out.push(b0);
    let mut padding = vec![0u8; pad_len];
    rng.fill_bytes(&mut padding);
    out.extend_from_slice(&padding);
    out.extend_from_slice(reset_secret);
    out
}

/// Build a Version Negotiation datagram for a long-header packet carrying
/// an unknown, non-zero version (§4.3).
pub fn build_version_negotiation<R: rand::RngCore>(
    rng: &mut R,
    echoed_scid: &ConnectionId,
    echoed_dcid: &ConnectionId,
    supported: &[u32],
    client_offered: u32,
) -> Vec<u8> {
    let mut out = Vec::new();
    let b0 = 0x80 | (rng.gen_range_u8(0, 0x80));
    out.push(b0);
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(echoed_scid.len() as u8);
    out.extend_from_slice(echoed_scid);
    out.push(echoed_dcid.len() as u8);
    out.extend_from_slice(echoed_dcid);
    for &v in supported {
        out.extend_from_slice(&v.to_be_bytes());
    }
    let mut grease = rng.next_u32();
    while grease == client_offered {
        grease = rng.next_u32();
    }
    out.extend_from_slice(&grease.to_be_bytes());
    out
}

/// Helper trait so `build_stateless_reset`/`build_version_negotiation` read
/// naturally against any `rand::RngCore`, without pulling in the `rand`
/// distribution machinery for one-off bounded integers.
trait RngRangeExt {
    fn gen_range_u8(&mut self, low: u8, high: u8) -> u8;
}

impl<R: rand::RngCore + ?Sized> RngRangeExt for R {
    fn gen_range_u8(&mut self, low: u8, high: u8) -> u8 {
        if high <= low {
            return low;
        }
        low + (self.next_u32() % u32::from(high - low)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pn_reconstruction_prefers_closer_candidate() {
        // Scenario D: truncated PN 0x7F, highest=0x1FD, mask=0xFF (1-byte pn)
        // ⇒ 0x17F, not 0x27F.
        let mask = !0xFFu64;
        let pn64 = reconstruct_pn64(0x1FD, mask, 0x7F);
        assert_eq!(pn64, 0x17F);
    }

    #[test]
    fn pn_reconstruction_never_wraps_negative() {
        let mask = !0xFFu64;
        // highest=5, truncated pn says "0xF0" which would naively resolve
        // below zero when stepping down a window; it must not.
        let pn64 = reconstruct_pn64(5, mask, 0xF0);
        assert!(pn64 < (1u64 << 32));
    }

    #[test]
    fn long_header_initial_parses_token_and_length() {
        // type=Initial (0x4), version present, minimal empty CIDs, token_len=0,
        // payload_len varint, then 4 bytes of (still-protected) pn+payload.
        let mut buf = vec![0xC0 | (4 << 4)]; // long header, type=Initial
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.push(0); // dcid len 0
        buf.push(0); // scid len 0
        buf.push(0); // token length varint = 0
        buf.push(4); // payload length varint = 4 (1-byte form, < 64)
        buf.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);

        let header = parse_header(&buf, 0).unwrap();
        assert_eq!(header.ty, PacketType::Initial);
        assert_eq!(header.payload_length, 4);
        assert!(header.offset + header.payload_length <= buf.len());
        assert_eq!(header.token_range, Some((buf.len() - 4 - 1, buf.len() - 4 - 1)));
    }

    #[test]
    fn short_header_requires_fixed_bit() {
        let buf = [0x00u8, 1, 2, 3, 4, 5, 6, 7, 8];
        let header = parse_header(&buf, 8).unwrap();
        assert_eq!(header.ty, PacketType::Error);
    }

    #[test]
    fn version_zero_is_version_negotiation() {
        let mut buf = vec![0x80];
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(0);
        buf.push(0);
        let header = parse_header(&buf, 0).unwrap();
        assert_eq!(header.ty, PacketType::VersionNegotiation);
    }
}
