//! Session-key derivation, AEAD sealing, and the PIN-based pairing key
//! agreement (component B/C cryptography).

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A 6-decimal-digit pairing PIN, e.g. `"042817"`.
pub fn generate_pin() -> String {
    let mut rng = rand::thread_rng();
    format!("{:06}", rng.next_u32() % 1_000_000)
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Derives the persistent 32-byte `shared_secret` from the PIN and the two
/// peer-exchanged 32-byte randoms. Documented in spec as HKDF over
/// `PIN || salt`; acceptable for LAN exposure, not a substitute for a real
/// PAKE (see DESIGN.md's Open Question resolution).
pub fn derive_shared_secret(pin: &str, random_a: &[u8; 32], random_b: &[u8; 32]) -> [u8; 32] {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(random_a);
    salt.extend_from_slice(random_b);
    let hk = Hkdf::<Sha256>::new(Some(&salt), pin.as_bytes());
    let mut out = [0u8; 32];
    hk.expand(b"yank/pairing/v1", &mut out)
        .expect("32 is a valid HKDF-SHA256 output length");
    out
}

/// Two AEAD keys, one per direction, derived fresh for each connection.
pub struct SessionKeys {
    pub key_c2s: [u8; 32],
    pub key_s2c: [u8; 32],
}

impl SessionKeys {
    /// `session_material = HKDF-SHA256(ikm=shared_secret, salt=nonce_client||nonce_server, info="yank/v1")`,
    /// split into the two 32-byte direction keys.
    pub fn derive(shared_secret: &[u8; 32], nonce_client: &[u8; 16], nonce_server: &[u8; 16]) -> Self {
        let mut salt = Vec::with_capacity(32);
        salt.extend_from_slice(nonce_client);
        salt.extend_from_slice(nonce_server);
        let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
        let mut material = [0u8; 64];
        hk.expand(b"yank/v1", &mut material)
            .expect("64 is a valid HKDF-SHA256 output length");
        let mut key_c2s = [0u8; 32];
        let mut key_s2c = [0u8; 32];
        key_c2s.copy_from_slice(&material[..32]);
        key_s2c.copy_from_slice(&material[32..]);
        Self { key_c2s, key_s2c }
    }
}

/// `HMAC(shared_secret, challenge || nonce_c || nonce_s)`, the handshake
/// response MAC.
pub fn challenge_mac(shared_secret: &[u8; 32], challenge: &[u8], nonce_c: &[u8], nonce_s: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(shared_secret).expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.update(nonce_c);
    mac.update(nonce_s);
    mac.finalize().into_bytes().to_vec()
}

pub fn verify_challenge_mac(shared_secret: &[u8; 32], challenge: &[u8], nonce_c: &[u8], nonce_s: &[u8], mac: &[u8]) -> bool {
    let mut expected = HmacSha256::new_from_slice(shared_secret).expect("HMAC accepts any key length");
    expected.update(challenge);
    expected.update(nonce_c);
    expected.update(nonce_s);
    expected.verify_slice(mac).is_ok()
}

/// A strictly-monotone per-direction nonce counter. `u32 zero || u64
/// counter_be` packed into the 96-bit AEAD nonce, never reused within a
/// session.
#[derive(Default)]
pub struct NonceCounter(u64);

impl NonceCounter {
    pub fn new() -> Self {
        Self(0)
    }

    /// Returns the next nonce and advances the counter. Errors out rather
    /// than wrapping, since a session exhausting 2^64 frames indicates a
    /// bug, not legitimate traffic.
    pub fn next(&mut self) -> Result<[u8; 12]> {
        let counter = self.0;
        self.0 = self
            .0
            .checked_add(1)
            .ok_or_else(|| Error::InternalError("AEAD nonce counter exhausted".into()))?;
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }
}

/// Seals `plaintext` under `key` with the given nonce and empty associated
/// data (frames carry no AAD; the whole header+payload is the plaintext).
pub fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad: b"" })
        .map_err(|_| Error::InternalError("AEAD seal failed".into()))
}

/// Opens a sealed frame. Any failure (wrong key, truncated tag, tampered
/// bytes) is treated as `AuthError` per the error-handling design: close the
/// connection immediately, never surface partial plaintext.
pub fn open(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: b"" })
        .map_err(|_| Error::AuthError("AEAD decrypt failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_is_six_digits() {
        for _ in 0..50 {
            let pin = generate_pin();
            assert_eq!(pin.len(), 6);
            assert!(pin.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn shared_secret_agrees_both_directions() {
        let a = random_bytes::<32>();
        let b = random_bytes::<32>();
        let s1 = derive_shared_secret("123456", &a, &b);
        let s2 = derive_shared_secret("123456", &a, &b);
        assert_eq!(s1, s2);
    }

    #[test]
    fn different_pin_yields_different_secret() {
        let a = random_bytes::<32>();
        let b = random_bytes::<32>();
        assert_ne!(derive_shared_secret("123456", &a, &b), derive_shared_secret("000000", &a, &b));
    }

    #[test]
    fn session_keys_match_and_directions_differ() {
        let secret = random_bytes::<32>();
        let nc = random_bytes::<16>();
        let ns = random_bytes::<16>();
        let k1 = SessionKeys::derive(&secret, &nc, &ns);
        let k2 = SessionKeys::derive(&secret, &nc, &ns);
        assert_eq!(k1.key_c2s, k2.key_c2s);
        assert_ne!(k1.key_c2s, k1.key_s2c);
    }

    #[test]
    fn challenge_mac_roundtrip() {
        let secret = random_bytes::<32>();
        let challenge = random_bytes::<32>();
        let nc = random_bytes::<16>();
        let ns = random_bytes::<16>();
        let mac = challenge_mac(&secret, &challenge, &nc, &ns);
        assert!(verify_challenge_mac(&secret, &challenge, &nc, &ns, &mac));
        let wrong_secret = random_bytes::<32>();
        assert!(!verify_challenge_mac(&wrong_secret, &challenge, &nc, &ns, &mac));
    }

    #[test]
    fn nonce_counter_is_strictly_monotone() {
        let mut counter = NonceCounter::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let n = counter.next().unwrap();
            assert!(seen.insert(n), "nonce reused");
        }
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = random_bytes::<32>();
        let mut counter = NonceCounter::new();
        let nonce = counter.next().unwrap();
        let plaintext = b"hello world";
        let ciphertext = seal(&key, &nonce, plaintext).unwrap();
        let opened = open(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_as_auth_error() {
        let key = random_bytes::<32>();
        let nonce = [0u8; 12];
        let mut ciphertext = seal(&key, &nonce, b"hi").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(matches!(open(&key, &nonce, &ciphertext), Err(Error::AuthError(_))));
    }
}
