//! Cryptographic collaborator contracts.
//!
//! The TLS library itself is out of scope (§1): it is the thing that
//! eventually hands this crate a [`Keys`] for the Handshake and 1-RTT
//! epochs once it has negotiated secrets. The Initial epoch is the one
//! exception — its secrets are derived from the client's DCID by a public,
//! version-specific algorithm (RFC 9001 §5.2), so this crate derives and
//! owns Initial keys itself, the same way `quinn-proto`'s `crypto` module
//! does for `Crypto::new_initial`.

use ring::aead::{self, quic, LessSafeKey, UnboundKey};
use ring::hmac;

use crate::ConnectionId;

/// RFC 9001 §5.2 initial salt for QUIC version 1.
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0x4a, 0x4c, 0x80, 0xca,
    0xdc, 0xcb, 0xb7, 0xf0,
];

#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum CryptoError {
    #[fail(display = "AEAD authentication failed")]
    AeadCheck,
    #[fail(display = "key material unavailable for this epoch")]
    Unavailable,
}

/// HMAC-SHA256-based HKDF-Extract, per RFC 5869.
fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, salt);
    hmac::sign(&key, ikm)
}

/// TLS 1.3 HKDF-Expand-Label (RFC 8446 §7.1), with an empty context — this
/// is all QUIC's key schedule (RFC 9001 §5) ever needs.
fn hkdf_expand_label(secret: &[u8], label: &str, out_len: usize) -> Vec<u8> {
    let full_label = format!("tls13 {}", label);
    let mut info = Vec::with_capacity(2 + 1 + full_label.len() + 1);
    info.extend_from_slice(&(out_len as u16).to_be_bytes());
    info.push(full_label.len() as u8);
    info.extend_from_slice(full_label.as_bytes());
    info.push(0); // empty context

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut okm = Vec::with_capacity(out_len);
    let mut t: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while okm.len() < out_len {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(&t);
        ctx.update(&info);
        ctx.update(&[counter]);
        t = ctx.sign().as_ref().to_vec();
        okm.extend_from_slice(&t);
        counter = counter.checked_add(1).expect("HKDF expand overflow");
    }
    okm.truncate(out_len);
    okm
}

/// One direction's worth of negotiated AEAD + header-protection key material
/// for a single epoch.
pub struct Keys {
    hp: quic::HeaderProtectionKey,
    iv: [u8; 12],
    open: LessSafeKey,
    seal: LessSafeKey,
}

impl Keys {
    fn from_secret(secret: &[u8], aead_alg: &'static aead::Algorithm, hp_alg: &'static quic::Algorithm) -> Self {
        let key_bytes = hkdf_expand_label(secret, "quic key", aead_alg.key_len());
        let iv_bytes = hkdf_expand_label(secret, "quic iv", aead::NONCE_LEN);
        let hp_bytes = hkdf_expand_label(secret, "quic hp", hp_alg.key_len());

        let open = LessSafeKey::new(UnboundKey::new(aead_alg, &key_bytes).expect("valid AEAD key length"));
        let seal = LessSafeKey::new(UnboundKey::new(aead_alg, &key_bytes).expect("valid AEAD key length"));
        let hp = quic::HeaderProtectionKey::new(hp_alg, &hp_bytes).expect("valid HP key length");

        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_bytes);
        Self { hp, iv, open, seal }
    }

    /// Initial-epoch keys derived directly from a client-chosen DCID. `side`
    /// selects the "client in"/"server in" half of the common secret.
    pub fn initial(dcid: &ConnectionId, side: crate::Side) -> Self {
        let common = hkdf_extract(&INITIAL_SALT, dcid);
        let label = match side {
            crate::Side::Client => "client in",
            crate::Side::Server => "server in",
        };
        let secret = hkdf_expand_label(common.as_ref(), label, 32);
        Self::from_secret(&secret, &aead::AES_128_GCM, &quic::AES_128)
    }

    /// Derive keys the TLS collaborator would hand over for Handshake/1-RTT
    /// epochs, given an already-negotiated traffic secret.
    pub fn from_traffic_secret(secret: &[u8], chacha: bool) -> Self {
        if chacha {
            Self::from_secret(secret, &aead::CHACHA20_POLY1305, &quic::CHACHA20)
        } else {
            Self::from_secret(secret, &aead::AES_128_GCM, &quic::AES_128)
        }
    }

    /// §4.2: 5-byte header-protection mask derived from a ciphertext sample.
    pub fn pn_decrypt(&self, sample: &[u8]) -> [u8; 5] {
        self.hp.new_mask(sample).unwrap_or([0; 5])
    }

    fn nonce(&self, pn64: u64) -> aead::Nonce {
        let mut bytes = self.iv;
        let pn_bytes = pn64.to_be_bytes();
        for i in 0..8 {
            bytes[4 + i] ^= pn_bytes[i];
        }
        aead::Nonce::assume_unique_for_key(bytes)
    }

    /// AEAD-decrypt `payload` (ciphertext + tag) in place. Returns the
    /// plaintext length on success, matching the "return value ≤ ciphertext
    /// length ⇒ success" contract of §4.2.
    pub fn aead_decrypt(&self, pn64: u64, header: &[u8], payload: &mut [u8]) -> Result<usize, CryptoError> {
        let nonce = self.nonce(pn64);
        let aad = aead::Aad::from(header);
        let plain = self
            .open
            .open_in_place(nonce, aad, payload)
            .map_err(|_| CryptoError::AeadCheck)?;
        Ok(plain.len())
    }

    /// AEAD-encrypt `plaintext` in place, appending the authentication tag.
    /// `buf` must have `aead::MAX_TAG_LEN` bytes of trailing capacity.
    pub fn aead_encrypt(&self, pn64: u64, header: &[u8], buf: &mut Vec<u8>, plaintext_len: usize) -> Result<(), CryptoError> {
        let nonce = self.nonce(pn64);
        let aad = aead::Aad::from(header);
        buf.truncate(plaintext_len);
        self.seal
            .seal_in_place_append_tag(nonce, aad, buf)
            .map_err(|_| CryptoError::AeadCheck)
    }
}

/// A fixed four-entry epoch array, `Empty | Ready{..}` per epoch, avoiding
/// dynamic dispatch (Design Notes §9).
#[derive(Default)]
pub struct EpochSlot {
    keys: Option<Keys>,
}

impl EpochSlot {
    pub fn empty() -> Self {
        Self { keys: None }
    }

    pub fn set(&mut self, keys: Keys) {
        self.keys = Some(keys);
    }

    pub fn get(&self) -> Option<&Keys> {
        self.keys.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.keys.is_some()
    }
}

/// All per-connection crypto state: the four epoch slots plus the 1-RTT
/// key-rotation bookkeeping (`crypto_context_old`/`crypto_context_new`,
/// `key_phase_dec`, `crypto_rotation_sequence`, `crypto_rotation_time_guard`).
pub struct CryptoContexts {
    pub initial: EpochSlot,
    pub zero_rtt: EpochSlot,
    pub handshake: EpochSlot,
    pub one_rtt: EpochSlot,

    /// Key generation that decrypted the most recent 1-RTT packet.
    pub key_phase_dec: bool,
    /// Demoted keys from the previous key-phase generation, retained until
    /// the rotation's time guard expires.
    pub crypto_context_old: Option<Keys>,
    /// Keys for the *next* key-phase generation, derived lazily on first
    /// use and promoted to current on a successful decrypt.
    pub crypto_context_new: Option<Keys>,
    /// Lowest packet number observed in the new key phase once rotation
    /// commits.
    pub crypto_rotation_sequence: u64,
    /// Old keys remain valid for packets below `crypto_rotation_sequence`
    /// only until this wall-clock time.
    pub crypto_rotation_time_guard: u64,
}

impl CryptoContexts {
    pub fn new() -> Self {
        Self {
            initial: EpochSlot::empty(),
            zero_rtt: EpochSlot::empty(),
            handshake: EpochSlot::empty(),
            one_rtt: EpochSlot::empty(),
            key_phase_dec: false,
            crypto_context_old: None,
            crypto_context_new: None,
            crypto_rotation_sequence: 0,
            crypto_rotation_time_guard: 0,
        }
    }

    pub fn slot(&self, epoch: crate::Epoch) -> &EpochSlot {
        match epoch {
            crate::Epoch::Initial => &self.initial,
            crate::Epoch::ZeroRtt => &self.zero_rtt,
            crate::Epoch::Handshake => &self.handshake,
            crate::Epoch::OneRtt => &self.one_rtt,
        }
    }

    pub fn slot_mut(&mut self, epoch: crate::Epoch) -> &mut EpochSlot {
        match epoch {
            crate::Epoch::Initial => &mut self.initial,
            crate::Epoch::ZeroRtt => &mut self.zero_rtt,
            crate::Epoch::Handshake => &mut self.handshake,
            crate::Epoch::OneRtt => &mut self.one_rtt,
        }
    }

    /// Install a derived-but-unused "next" 1-RTT key. The caller (the TLS
    /// collaborator, or a test) supplies it; this module only manages when
    /// it gets promoted.
    pub fn set_next_one_rtt(&mut self, keys: Keys) {
        self.crypto_context_new = Some(keys);
    }

    /// §4.2 rotation commit: promote `new` to current, demote current to
    /// `old`, and advance the rotation bookkeeping. `retransmit_timer` is
    /// the arrival path's current PTO estimate (see `DESIGN.md` Open
    /// Question 1: the guard is scoped to the arrival path, not `path[0]`).
    pub fn commit_rotation(&mut self, pn64: u64, now: u64, retransmit_timer: u64) {
        self.crypto_rotation_sequence = pn64;
        self.crypto_rotation_time_guard = now + retransmit_timer;
        let previous_current = self.one_rtt.keys.take();
        let promoted = self
            .crypto_context_new
            .take()
            .expect("rotation commit requires a derived `new` key");
        self.one_rtt.set(promoted);
        self.crypto_context_old = previous_current;
        self.key_phase_dec = !self.key_phase_dec;
    }
}

impl Default for CryptoContexts {
    fn default() -> Self {
        Self::new()
    }
}
