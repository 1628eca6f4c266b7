//! Path validation and NAT-rebinding support (§4.3 "Path finding").
//!
//! A `Path` is one validated-or-probing `(peer_addr, local_addr, local_cnxid,
//! remote_cnxid)` 4-tuple. `path[0]` is always the connection's active
//! default path; additional entries arise from address changes the peer's
//! NAT/load-balancer makes mid-connection.

use std::net::SocketAddr;

use rand::RngCore;

use crate::congestion::CongestionState;
use crate::{ConnectionId, ENFORCED_INITIAL_MTU};

/// One outstanding PATH_CHALLENGE token slot.
#[derive(Debug, Copy, Clone, Default)]
pub struct Challenge {
    pub data: u64,
    pub sent: bool,
}

/// A validated or probing address/CID 4-tuple and everything CUBIC needs to
/// drive that path independently.
pub struct Path {
    pub peer_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    pub local_cnxid: ConnectionId,
    pub remote_cnxid: ConnectionId,

    pub send_mtu: u16,
    pub smoothed_rtt: u64,
    pub retransmit_timer: u64,

    pub reset_secret: [u8; 16],

    pub challenge: [Challenge; crate::CHALLENGE_REPEAT_MAX],
    pub challenge_required: bool,
    pub challenge_verified: bool,
    pub challenge_failed: bool,
    pub challenge_time: u64,
    pub challenge_repeat_count: usize,

    /// Shadow state for an address this path is probing as an alternate
    /// (NAT rebinding candidate) without yet promoting it.
    pub alt_peer_addr: Option<SocketAddr>,
    pub alt_local_addr: Option<SocketAddr>,
    pub alt_challenge: [Challenge; crate::CHALLENGE_REPEAT_MAX],
    pub alt_challenge_time: u64,

    pub activated: bool,
    pub registered: bool,

    pub congestion: CongestionState,
}

impl Path {
    pub fn new(peer_addr: SocketAddr, local_cnxid: ConnectionId, remote_cnxid: ConnectionId, reset_secret: [u8; 16]) -> Self {
        Self {
            peer_addr,
            local_addr: None,
            local_cnxid,
            remote_cnxid,
            send_mtu: ENFORCED_INITIAL_MTU,
            smoothed_rtt: 0,
            retransmit_timer: 0,
            reset_secret,
            challenge: [Challenge::default(); crate::CHALLENGE_REPEAT_MAX],
            challenge_required: false,
            challenge_verified: false,
            challenge_failed: false,
            challenge_time: 0,
            challenge_repeat_count: 0,
            alt_peer_addr: None,
            alt_local_addr: None,
            alt_challenge: [Challenge::default(); crate::CHALLENGE_REPEAT_MAX],
            alt_challenge_time: 0,
            activated: false,
            registered: false,
            congestion: CongestionState::new(),
        }
    }

    /// Refill `challenge`/`alt_challenge` with fresh random tokens and reset
    /// the validation bookkeeping (§4.3: "On any new_challenge_required").
    pub fn arm_new_challenge<R: RngCore>(&mut self, rng: &mut R, now: u64) {
        for c in &mut self.challenge {
            c.data = rng.next_u64();
            c.sent = false;
        }
        for c in &mut self.alt_challenge {
            c.data = rng.next_u64();
            c.sent = false;
        }
        self.challenge_time = now;
        self.alt_challenge_time = now;
        self.challenge_verified = false;
        self.challenge_repeat_count = 0;
        self.challenge_required = true;
    }
}

/// Outcome of dispatching one incoming 1-RTT packet through path-finding.
/// A field-less tag, not a magic integer, per the dispatcher convention used
/// throughout this crate.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PathOutcome {
    /// Path resolved to `paths[usize]`; proceed to frame decode.
    Resolved(usize),
    /// No local CID matched and the endpoint doesn't use zero-length CIDs.
    CnxidCheck,
}

/// Locates (or creates) the path an incoming 1-RTT segment belongs to.
///
/// `local_cids_empty` is true when this endpoint issues zero-length local
/// CIDs, in which case paths are distinguished purely by address pairs.
/// `stash_pop` pulls the next unused peer-issued CID (and its reset secret)
/// off the connection's `cnxid_stash`, if any remain.
pub fn find_path<R: RngCore>(
    paths: &mut Vec<Path>,
    dcid: &ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    pn64: u64,
    highest_acked: u64,
    is_client: bool,
    local_cids_empty: bool,
    rng: &mut R,
    now: u64,
    stash_pop: impl FnOnce() -> Option<(ConnectionId, [u8; 16])>,
) -> PathOutcome {
    let idx = if !local_cids_empty {
        if dcid.is_empty() {
            return PathOutcome::CnxidCheck;
        }
        match paths.iter().position(|p| &p.local_cnxid == dcid) {
            Some(i) => i,
            None => return PathOutcome::CnxidCheck,
        }
    } else {
        match paths
            .iter()
            .position(|p| p.peer_addr == peer_addr && p.local_addr == Some(local_addr))
        {
            Some(i) => i,
            None => {
                let mut new_path = Path::new(peer_addr, ConnectionId::new(&[]), ConnectionId::new(&[]), [0; 16]);
                new_path.local_addr = Some(local_addr);
                new_path.registered = true;
                new_path.arm_new_challenge(rng, now);
                paths.push(new_path);
                paths.len() - 1
            }
        }
    };

    if paths[idx].local_addr.is_none() {
        paths[idx].local_addr = Some(local_addr);
    }

    if paths[idx].peer_addr == peer_addr && paths[idx].local_addr == Some(local_addr) {
        paths[idx].activated = true;
        return PathOutcome::Resolved(idx);
    }

    // Addresses differ from what this path was registered under.
    let path0_remote_known = !paths[0].remote_cnxid.is_empty();
    let this_remote_null = paths[idx].remote_cnxid.is_empty();

    if path0_remote_known && this_remote_null {
        if let Some(probe) = paths
            .iter()
            .position(|p| p.alt_peer_addr == Some(peer_addr) && p.alt_local_addr == Some(local_addr))
        {
            let (remote_cnxid, reset_secret) = (paths[probe].remote_cnxid.clone(), paths[probe].reset_secret);
            paths[idx].remote_cnxid = remote_cnxid;
            paths[idx].reset_secret = reset_secret;
        } else if is_client && paths[0].peer_addr == peer_addr && paths[0].local_addr == Some(local_addr) {
            paths[idx].remote_cnxid = paths[0].remote_cnxid.clone();
            paths[idx].reset_secret = paths[0].reset_secret;
            paths[0].remote_cnxid = ConnectionId::new(&[]);
        } else if let Some((cid, secret)) = stash_pop() {
            paths[idx].remote_cnxid = cid;
            paths[idx].reset_secret = secret;
        }
        // Else: leave deactivated; no CID available yet.
    } else if !this_remote_null {
        // NAT rebinding: this path already has a remote CID but a different
        // address pair just used it.
        let alt_timed_out = now.saturating_sub(paths[idx].alt_challenge_time) > crate::TOKEN_DELAY_SHORT;
        if paths[idx].alt_peer_addr == Some(peer_addr) && paths[idx].alt_local_addr == Some(local_addr) && alt_timed_out {
            paths[idx].arm_new_challenge(rng, now);
        } else if (paths[idx].alt_peer_addr.is_none() || alt_timed_out) && pn64 > highest_acked {
            paths[idx].alt_peer_addr = Some(peer_addr);
            paths[idx].alt_local_addr = Some(local_addr);
            paths[idx].arm_new_challenge(rng, now);
        }
    }

    PathOutcome::Resolved(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn exact_address_match_activates_path() {
        let mut rng = StepRng::new(1, 1);
        let mut paths = vec![Path::new(addr(1), ConnectionId::new(&[1]), ConnectionId::new(&[2]), [0; 16])];
        paths[0].local_addr = Some(addr(9));
        let outcome = find_path(
            &mut paths,
            &ConnectionId::new(&[1]),
            addr(1),
            addr(9),
            5,
            0,
            true,
            false,
            &mut rng,
            0,
            || None,
        );
        assert_eq!(outcome, PathOutcome::Resolved(0));
        assert!(paths[0].activated);
    }

    #[test]
    fn unknown_cid_with_nonempty_local_cids_is_cnxid_check() {
        let mut rng = StepRng::new(1, 1);
        let mut paths = vec![Path::new(addr(1), ConnectionId::new(&[1]), ConnectionId::new(&[2]), [0; 16])];
        let outcome = find_path(
            &mut paths,
            &ConnectionId::new(&[9, 9]),
            addr(1),
            addr(9),
            5,
            0,
            true,
            false,
            &mut rng,
            0,
            || None,
        );
        assert_eq!(outcome, PathOutcome::CnxidCheck);
    }

    #[test]
    fn zero_length_cid_endpoint_creates_new_path_by_address() {
        let mut rng = StepRng::new(1, 1);
        let mut paths = vec![Path::new(addr(1), ConnectionId::new(&[]), ConnectionId::new(&[2]), [0; 16])];
        paths[0].local_addr = Some(addr(9));
        let outcome = find_path(
            &mut paths,
            &ConnectionId::new(&[]),
            addr(2),
            addr(9),
            5,
            0,
            true,
            true,
            &mut rng,
            0,
            || None,
        );
        assert_eq!(outcome, PathOutcome::Resolved(1));
        assert!(paths[1].challenge_required);
    }

    #[test]
    fn client_cid_change_from_path0_promotes_remote_cnxid() {
        let mut rng = StepRng::new(1, 1);
        let mut paths = vec![Path::new(addr(1), ConnectionId::new(&[1]), ConnectionId::new(&[9]), [7; 16])];
        paths[0].local_addr = Some(addr(9));
        // Registered under a stale address pair; the new datagram arrives
        // from path[0]'s address pair but carrying the new local CID.
        paths.push(Path::new(addr(5), ConnectionId::new(&[2]), ConnectionId::new(&[]), [0; 16]));
        paths[1].local_addr = Some(addr(6));

        let outcome = find_path(&mut paths, &ConnectionId::new(&[2]), addr(1), addr(9), 5, 0, true, false, &mut rng, 0, || None);
        assert_eq!(outcome, PathOutcome::Resolved(1));
        assert_eq!(paths[1].remote_cnxid, ConnectionId::new(&[9]));
        assert!(paths[0].remote_cnxid.is_empty());
    }
}
