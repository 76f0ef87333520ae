//! Key Factory: the per-message key ratchet
//!
//! Maintains 256 independent keyed hash-chain sequences ("tracks") seeded
//! from a shared secret. Every request advances the requested track by one
//! step and hashes the step output into key material, so both peers derive
//! identical keys and IVs without ever transmitting them.
//!
//! ```text
//! reseed(secret, offset):
//!   token[i] = HMAC-SHA512(secret, Fib(i + offset))        i in 0..256
//!
//! next(track):
//!   value    = base64_nopad(HMAC-SHA512(token, Fib(index)))
//!   index   += 1
//!   index == 512  =>  token = SHA-512(next value), index = 0
//!
//! get_key_from_track(track, bits) = SHA-512(value)[..bits / 8]
//! ```
//!
//! Each track sits behind its own lock: requests on different tracks never
//! contend, requests on the same track serialize.

use crate::error::{CommError, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use num_bigint::BigInt;
use sha2::{Digest, Sha512};
use std::sync::{Mutex, MutexGuard, RwLock};
use zeroize::Zeroizing;

type HmacSha512 = Hmac<Sha512>;

/// Number of tracks created by every reseed
pub const TRACK_COUNT: usize = 256;

/// Modulus applied to track indices on lookup.
///
/// Deliberately one less than `TRACK_COUNT`: track 255 is seeded but can
/// never be addressed. Peers must agree on this value bit-for-bit.
pub const TRACK_MODULUS: usize = 255;

/// Steps a track takes before its token is re-derived
pub const RESEED_INTERVAL: u32 = 512;

/// Largest key that can be pulled from a track (one SHA-512 digest)
pub const MAX_KEY_BITS: usize = 512;

/// Fibonacci value at `index` as minimal big-endian two's complement bytes.
///
/// Iterates `a = 1, b = 1; (a, b) = (b, a + b)` `index` times and returns
/// `b`, so index 0 yields 1, index 1 yields 2, index 2 yields 3.
pub fn fibonacci_bytes(index: u32) -> Vec<u8> {
    let (_, b) = fibonacci_pair(index);
    b.to_signed_bytes_be()
}

fn fibonacci_pair(index: u32) -> (BigInt, BigInt) {
    let mut a = BigInt::from(1u8);
    let mut b = BigInt::from(1u8);
    for _ in 0..index {
        let next = &a + &b;
        a = std::mem::replace(&mut b, next);
    }
    (a, b)
}

fn hmac_sha512(key: &[u8], message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|_| CommError::Crypto("HMAC-SHA512 rejected key".into()))?;
    mac.update(message);
    Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
}

/// One ratchet track
pub struct KeySequenceTrack {
    /// Current HMAC key
    token: Zeroizing<Vec<u8>>,

    /// Steps taken since the token was last derived
    index: u32,

    /// Sequence position modulo 256, fixed at seed time
    offset: u32,
}

impl KeySequenceTrack {
    fn seeded(token: Zeroizing<Vec<u8>>, offset: u32) -> Self {
        Self {
            token,
            index: 0,
            offset,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Output for the current (token, index) pair without advancing
    fn current_value(&self) -> Result<Zeroizing<String>> {
        let digest = hmac_sha512(&self.token, &fibonacci_bytes(self.index))?;
        Ok(Zeroizing::new(STANDARD_NO_PAD.encode(&digest[..])))
    }

    /// Produce the next value and ratchet forward.
    ///
    /// On reaching `RESEED_INTERVAL` the replacement token is the SHA-512 of
    /// the value the track would emit next, so the chain only ever depends
    /// on the track's own prior state.
    fn advance(&mut self) -> Result<Zeroizing<String>> {
        let value = self.current_value()?;
        self.index += 1;

        if self.index >= RESEED_INTERVAL {
            let chained = self.current_value()?;
            let next_token = Sha512::digest(chained.as_bytes());
            self.token = Zeroizing::new(next_token.to_vec());
            self.index = 0;
            log::trace!("🔁 Track at offset {} rolled over to a new token", self.offset);
        }

        Ok(value)
    }
}

/// Key Factory holding 256 ratchet tracks
pub struct KeyFactory {
    tracks: RwLock<Vec<Mutex<KeySequenceTrack>>>,
}

impl KeyFactory {
    /// Create an unseeded factory
    pub fn new() -> Self {
        Self {
            tracks: RwLock::new(Vec::new()),
        }
    }

    /// Replace every track with a fresh derivation from `shared_secret`.
    ///
    /// Track `i` is keyed with `HMAC-SHA512(shared_secret, Fib(i + offset))`.
    pub fn reseed(&self, shared_secret: &[u8], offset: u32) -> Result<()> {
        let mut tracks = Vec::with_capacity(TRACK_COUNT);

        // Walk the sequence once instead of recomputing Fib from zero per track
        let (mut a, mut b) = fibonacci_pair(offset);
        for i in 0..TRACK_COUNT as u32 {
            let token = hmac_sha512(shared_secret, &b.to_signed_bytes_be())?;
            tracks.push(Mutex::new(KeySequenceTrack::seeded(
                token,
                (i + offset) % TRACK_COUNT as u32,
            )));

            let next = &a + &b;
            a = std::mem::replace(&mut b, next);
        }

        let mut guard = self
            .tracks
            .write()
            .map_err(|_| CommError::InvalidState("key factory lock poisoned".into()))?;
        *guard = tracks;

        log::debug!("🔑 Key factory reseeded ({} tracks, offset {})", TRACK_COUNT, offset);
        Ok(())
    }

    /// Whether `reseed` has been called
    pub fn is_seeded(&self) -> bool {
        self.tracks.read().map(|t| !t.is_empty()).unwrap_or(false)
    }

    /// Derive `size_bits / 8` bytes of key material from a track.
    ///
    /// Fails with `InvalidState` when `size_bits > 512` or the factory has
    /// not been seeded.
    pub fn get_key_from_track(&self, track_index: usize, size_bits: usize) -> Result<Zeroizing<Vec<u8>>> {
        if size_bits > MAX_KEY_BITS {
            return Err(CommError::InvalidState(format!(
                "Requested key size {} exceeds {} bits",
                size_bits, MAX_KEY_BITS
            )));
        }

        let value = self.next_sequence_value(track_index)?;
        let digest = Sha512::digest(value.as_bytes());
        Ok(Zeroizing::new(digest[..size_bits / 8].to_vec()))
    }

    /// Current `(index, offset)` of a track, if seeded
    pub fn track_position(&self, track_index: usize) -> Option<(u32, u32)> {
        let tracks = self.tracks.read().ok()?;
        let track = tracks.get(track_index % TRACK_MODULUS)?;
        let track = lock_track(track).ok()?;
        Some((track.index(), track.offset()))
    }

    fn next_sequence_value(&self, track_index: usize) -> Result<Zeroizing<String>> {
        let track_index = track_index % TRACK_MODULUS;

        let tracks = self
            .tracks
            .read()
            .map_err(|_| CommError::InvalidState("key factory lock poisoned".into()))?;

        let track = tracks.get(track_index).ok_or_else(|| {
            CommError::InvalidState(format!(
                "Index {} not found. Has the key factory been seeded?",
                track_index
            ))
        })?;

        let mut track = lock_track(track)?;
        track.advance()
    }
}

impl Default for KeyFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_track(track: &Mutex<KeySequenceTrack>) -> Result<MutexGuard<'_, KeySequenceTrack>> {
    track
        .lock()
        .map_err(|_| CommError::InvalidState("key track lock poisoned".into()))
}
