//! AES-256-CBC message protection
//!
//! Two layers use the same primitive:
//! - The handshake `SessionCipher`, keyed once from the ACK-stage ECDH
//!   secret, protects the nonce and the session token.
//! - The transport seals every application message with a key and IV mask
//!   pulled fresh from the Key Factory.
//!
//! Every ciphertext on the wire is `IV (16) || AES-256-CBC-PKCS7(plaintext)`.

use crate::error::{CommError, Result};
use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block / IV length
pub const IV_LEN: usize = 16;

/// AES-256 key length
pub const KEY_LEN: usize = 32;

/// Encrypt with AES-256-CBC and PKCS#7 padding
pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CommError::Crypto("Invalid AES key or IV length".into()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt AES-256-CBC and strip PKCS#7 padding
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| CommError::Crypto("Invalid AES key or IV length".into()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CommError::Crypto("Bad padding".into()))
}

/// Fresh IV from the OS RNG
pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn split_frame(frame: &[u8]) -> Result<(&[u8], &[u8])> {
    if frame.len() < IV_LEN * 2 || (frame.len() - IV_LEN) % IV_LEN != 0 {
        return Err(CommError::Crypto(format!(
            "Ciphertext of {} bytes is not IV plus whole blocks",
            frame.len()
        )));
    }
    Ok(frame.split_at(IV_LEN))
}

fn into_utf8(plaintext: Vec<u8>) -> Result<String> {
    String::from_utf8(plaintext).map_err(|_| CommError::Crypto("Plaintext is not UTF-8".into()))
}

/// Seal a transport message.
///
/// A random IV is generated and prepended; the IV actually fed to CBC is
/// that random IV XOR `iv_mask`, so both the key and the effective IV
/// depend on ratchet output that never crosses the wire.
pub fn seal_message(key: &[u8], iv_mask: &[u8], plaintext: &str) -> Result<Vec<u8>> {
    let iv = random_iv();
    let effective = mask_iv(&iv, iv_mask)?;

    let ciphertext = encrypt(key, &effective, plaintext.as_bytes())?;
    let mut frame = Vec::with_capacity(IV_LEN + ciphertext.len());
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Open a frame produced by `seal_message` with the same key and mask
pub fn open_message(key: &[u8], iv_mask: &[u8], frame: &[u8]) -> Result<String> {
    let (iv, ciphertext) = split_frame(frame)?;
    let effective = mask_iv(iv, iv_mask)?;
    into_utf8(decrypt(key, &effective, ciphertext)?)
}

fn mask_iv(iv: &[u8], mask: &[u8]) -> Result<[u8; IV_LEN]> {
    if iv.len() != IV_LEN || mask.len() != IV_LEN {
        return Err(CommError::Crypto("IV material must be 128 bits".into()));
    }
    let mut out = [0u8; IV_LEN];
    for (o, (a, b)) in out.iter_mut().zip(iv.iter().zip(mask)) {
        *o = a ^ b;
    }
    Ok(out)
}

/// Handshake-stage cipher keyed from the raw ECDH shared secret
pub struct SessionCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl SessionCipher {
    /// Key = SHA-256(shared secret)
    pub fn from_shared_secret(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt a string as `IV || ciphertext`
    pub fn seal(&self, plaintext: &str) -> Result<Vec<u8>> {
        let iv = random_iv();
        let ciphertext = encrypt(&self.key[..], &iv, plaintext.as_bytes())?;
        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt `IV || ciphertext` back to a string
    pub fn open(&self, data: &[u8]) -> Result<String> {
        let (iv, ciphertext) = split_frame(data)?;
        into_utf8(decrypt(&self.key[..], iv, ciphertext)?)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher { .. }")
    }
}
