//! Core of a QUIC transport endpoint.
//!
//! This crate implements the hard part of a QUIC implementation: parsing and
//! decrypting incoming datagrams ([`packet`]), demultiplexing them onto
//! per-connection state machines and validating paths ([`connection`],
//! [`path`]), and driving loss recovery with a CUBIC+Reno congestion
//! controller ([`congestion`]). Socket I/O, the event loop, the TLS stack,
//! and non-control frame bodies are external collaborators named only by
//! the contracts in [`crypto`] and [`connection::FrameDecoder`].
#[macro_use]
extern crate slog;
#[macro_use]
extern crate failure;

pub mod coding;
pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod packet;
pub mod path;
pub mod transport_error;

use std::fmt;
use std::hash::{Hash, Hasher};

/// QUIC version this core speaks. Chosen to match RFC 9000/9001 (v1).
pub const VERSION: u32 = 0x0000_0001;

/// Minimum length of a connection ID, per the QUIC invariants draft.
pub const CONNECTION_ID_MIN_SIZE: usize = 0;
/// Maximum length of a connection ID.
pub const CONNECTION_ID_MAX_SIZE: usize = 20;

/// Smallest Initial datagram permitted; smaller ones are dropped to bound
/// amplification.
pub const MIN_INITIAL_SIZE: usize = 1200;
/// Minimum UDP payload size this core will ever target.
pub const MIN_MTU: u16 = 1200;

/// Size in bytes of a stateless-reset secret / token.
pub const RESET_SECRET_SIZE: usize = 16;
/// Shortest packet this core will recognize as plausibly a stateless reset.
pub const RESET_PACKET_MIN_SIZE: usize = 21;
/// Minimum amount of random padding placed before the reset secret.
pub const RESET_PACKET_PAD_SIZE: usize = 5;

/// Number of outstanding PATH_CHALLENGE tokens tracked per path.
pub const CHALLENGE_REPEAT_MAX: usize = 4;
/// Size of the HyStart RTT sample ring buffer.
pub const MIN_MAX_RTT_SCOPE: usize = 8;

/// Initial congestion window, in bytes (≈10 MSS, matching common defaults).
pub const CWIN_INITIAL: u64 = 10 * 1460;
/// Floor the congestion window may never be driven below.
pub const CWIN_MINIMUM: u64 = 2 * 1460;
/// RTT (μs) below which slow start grows a full MSS per ack, as in Reno.
pub const TARGET_RENO_RTT_US: u64 = 100_000;
/// MTU this core enforces for newly created paths before path MTU discovery.
pub const ENFORCED_INITIAL_MTU: u16 = 1280;
/// Connection ID length this core enforces for its own, locally-issued CIDs.
pub const ENFORCED_INITIAL_CID_LENGTH: usize = 8;
/// Delay (μs) the server holds a short-lived retry token valid for.
pub const TOKEN_DELAY_SHORT: u64 = 15_000_000;

/// Sentinel marking "slow start threshold not yet established".
pub const SSTHRESH_INFINITE: u64 = u64::MAX;

/// Which side of the handshake a `Connection` plays.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }
}

/// QUIC cryptographic level.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Epoch {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    OneRtt = 3,
}

/// Packet-number space: every epoch maps onto exactly one of these, except
/// 0-RTT and 1-RTT which share the Application space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PnSpace {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

impl Epoch {
    pub fn pn_space(self) -> PnSpace {
        match self {
            Epoch::Initial => PnSpace::Initial,
            Epoch::Handshake => PnSpace::Handshake,
            Epoch::ZeroRtt | Epoch::OneRtt => PnSpace::Application,
        }
    }
}

/// An opaque QUIC connection ID: 0-20 bytes, compared by length then bytes.
#[derive(Clone, Eq)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; CONNECTION_ID_MAX_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        assert!(data.len() <= CONNECTION_ID_MAX_SIZE);
        let mut bytes = [0; CONNECTION_ID_MAX_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Self {
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn random<R: rand::RngCore>(rng: &mut R, len: usize) -> Self {
        assert!(len <= CONNECTION_ID_MAX_SIZE);
        let mut bytes = [0; CONNECTION_ID_MAX_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        // Length-then-bytes, per the data model: mismatched lengths never
        // fall through to a byte comparison.
        self.len == other.len && &self.bytes[..self.len as usize] == &other.bytes[..other.len as usize]
    }
}

impl Hash for ConnectionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes[..self.len as usize].hash(state);
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of handing one parsed segment to a connection's state machine.
///
/// Never a bare integer (see Design Notes): every dispatcher returns one of
/// these, and the caller's coalesce loop maps it to a halt/continue policy
/// in exactly one place ([`endpoint::Endpoint::handle`]).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SegmentOutcome {
    /// Segment accepted; record its packet number as received.
    Ok,
    /// AEAD packet protection failed to authenticate.
    AeadCheck,
    /// This segment was recognized as a stateless reset.
    StatelessReset,
    /// A duplicate of an already-received packet number.
    Duplicate,
    /// Packet type is not legal in the connection's current state.
    UnexpectedPacket,
    /// An Initial datagram was smaller than [`MIN_INITIAL_SIZE`].
    InitialTooShort,
    /// An Initial packet's DCID was shorter than the minimum the server
    /// will accept when creating new connection state.
    InitialCidTooShort,
    /// Connection ID did not match what was expected for this segment.
    CnxidCheck,
    /// A segment within a coalesced datagram had a different DCID than the
    /// first; the remainder of the datagram is abandoned.
    CnxidSegment,
    /// Segment consumed as a Retry; not counted as a received packet.
    Retry,
    /// Segment recognized but intentionally not delivered further (e.g. a
    /// stale VN targeting an unknown version).
    Detected,
    /// The connection this segment targeted no longer exists.
    ConnectionDeleted,
    /// A repeat was found to be spurious after the fact.
    SpuriousRepeat,
    /// Allocation failure in a collaborator; treat as a fatal local error.
    Memory,
}

impl SegmentOutcome {
    /// Per §7: whether the coalesce loop should record this packet number
    /// as received and continue decoding the datagram normally.
    pub fn is_accepted(self) -> bool {
        self == SegmentOutcome::Ok
    }

    /// Per §7: the small set of outcomes after which the *entire* remaining
    /// datagram must be abandoned (not just this segment).
    pub fn halts_datagram(self) -> bool {
        matches!(self, SegmentOutcome::CnxidSegment)
    }
}
