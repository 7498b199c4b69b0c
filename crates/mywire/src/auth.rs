//! Password scramble computation.
//!
//! Pure functions from (password, server nonce) to the credential bytes of
//! each authentication generation the protocol has accumulated:
//!
//! - pre-4.1: a 31-bit two-seed generator keyed by a polynomial hash of the
//!   password and nonce, producing printable scramble characters. The "old"
//!   and "new" code paths differ in modulus and in the final XOR fold and are
//!   kept as separate functions on purpose; the divergence is protocol
//!   version compatibility, not an accident to unify away.
//! - 4.1.0: double SHA1 fed through the legacy generator, compatible with
//!   old-format stored hashes.
//! - 4.1.1+: `SHA1(password) XOR SHA1(nonce ++ SHA1(SHA1(password)))`.
//! - caching_sha2 (8.0+): SHA256 fast path plus the RSA full-auth exchange.
//!
//! Every function is deterministic, and an empty password always yields the
//! empty credential the server reads as "no password".

use sha1::{Digest, Sha1};
use sha2::Sha256;

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

/// Authentication plugin names the session engine recognizes.
pub mod plugins {
    pub const NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const OLD_PASSWORD: &str = "mysql_old_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// In-band status bytes of the caching_sha2 continuation protocol.
pub mod caching_sha2_status {
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

const LEGACY_MAX_NEW: u64 = 0x3FFF_FFFF;
const LEGACY_MAX_OLD: u64 = 0x01FF_FFFF;

/// The pre-4.1 polynomial hash. Space and tab bytes are skipped, matching
/// the server's treatment of passwords.
fn hash_legacy(input: &[u8]) -> [u64; 2] {
    let mut nr: u64 = 1_345_345_333;
    let mut add: u64 = 7;
    let mut nr2: u64 = 0x1234_5671;
    for &b in input {
        if b == b' ' || b == b'\t' {
            continue;
        }
        let b = u64::from(b);
        nr ^= (nr & 63)
            .wrapping_add(add)
            .wrapping_mul(b)
            .wrapping_add(nr << 8);
        nr2 = nr2.wrapping_add((nr2 << 8) ^ nr);
        add = add.wrapping_add(b);
    }
    [nr & 0x7FFF_FFFF, nr2 & 0x7FFF_FFFF]
}

/// The 31-bit two-seed generator both legacy scrambles draw from.
struct LegacyRand {
    seed1: u64,
    seed2: u64,
    max: u64,
}

impl LegacyRand {
    fn new(seed1: u64, seed2: u64, max: u64) -> Self {
        Self {
            seed1: seed1 % max,
            seed2: seed2 % max,
            max,
        }
    }

    fn next(&mut self) -> f64 {
        self.seed1 = (self.seed1 * 3 + self.seed2) % self.max;
        self.seed2 = (self.seed1 + self.seed2 + 33) % self.max;
        self.seed1 as f64 / self.max as f64
    }
}

fn legacy_rand(password: &[u8], nonce: &[u8], max: u64) -> LegacyRand {
    let hp = hash_legacy(password);
    let hn = hash_legacy(nonce);
    LegacyRand::new(hp[0] ^ hn[0], hp[1] ^ hn[1], max)
}

/// Pre-4.1 scramble, "new" variant: 0x3FFF_FFFF modulus with the trailing
/// XOR fold over every output character.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn scramble_323(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let mut rng = legacy_rand(password.as_bytes(), nonce, LEGACY_MAX_NEW);
    let mut out: Vec<u8> = (0..nonce.len())
        .map(|_| (rng.next() * 31.0) as u8 + 64)
        .collect();
    let extra = (rng.next() * 31.0) as u8;
    for b in &mut out {
        *b ^= extra;
    }
    out
}

/// Pre-4.1 scramble, "old" variant: 0x01FF_FFFF modulus, no XOR fold.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn scramble_323_old(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let mut rng = legacy_rand(password.as_bytes(), nonce, LEGACY_MAX_OLD);
    (0..nonce.len())
        .map(|_| (rng.next() * 31.0) as u8 + 64)
        .collect()
}

/// Transitional 4.1.0 scramble: the double SHA1 stage hashes keyed through
/// the legacy generator, XOR-masked over the first-stage hash.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn scramble_410(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut rng = legacy_rand(&stage2, nonce, LEGACY_MAX_NEW);
    stage1
        .iter()
        .map(|&b| b ^ (rng.next() * 255.0) as u8)
        .collect()
}

/// Modern 4.1.1+ scramble:
/// `SHA1(password) XOR SHA1(nonce ++ SHA1(SHA1(password)))`.
///
/// The handshake response prepends the one-byte length when writing this.
pub fn scramble_411(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let nonce = if nonce.len() > 20 { &nonce[..20] } else { nonce };

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(stage2);
    let mask: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password fast-path scramble:
/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) ++ nonce)`.
pub fn scramble_caching_sha2(password: &str, nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    // Servers send the 20-byte nonce plus a trailing NUL.
    let nonce = if nonce.len() == 21 && nonce.last() == Some(&0) {
        &nonce[..20]
    } else {
        nonce
    };

    let stage1: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let stage2: [u8; 32] = Sha256::digest(stage1).into();

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(nonce);
    let mask: [u8; 32] = hasher.finalize().into();

    stage1.iter().zip(mask.iter()).map(|(a, b)| a ^ b).collect()
}

/// XOR the NUL-terminated password with the repeating nonce. Used by the
/// full-auth paths where the channel itself is already secure.
pub fn xor_password_with_nonce(password: &str, nonce: &[u8]) -> Vec<u8> {
    let mut out = password.as_bytes().to_vec();
    out.push(0);
    if !nonce.is_empty() {
        for (i, b) in out.iter_mut().enumerate() {
            *b ^= nonce[i % nonce.len()];
        }
    }
    out
}

/// Full authentication over an insecure channel: the XOR-masked password is
/// RSA-encrypted with the server's public key (PEM, either encoding). MySQL
/// 8.0.5+ expects OAEP padding for caching_sha2_password; sha256_password
/// uses PKCS#1 v1.5.
pub fn rsa_encrypted_password(
    password: &str,
    nonce: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>, String> {
    if nonce.is_empty() {
        return Err("empty auth nonce".to_string());
    }
    let masked = xor_password_with_nonce(password, nonce);

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| format!("server public key is not UTF-8 PEM: {e}"))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| format!("failed to parse server public key: {e}"))?;

    if use_oaep {
        key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &masked)
            .map_err(|e| format!("RSA-OAEP encryption failed: {e}"))
    } else {
        key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &masked)
            .map_err(|e| format!("RSA-PKCS1 encryption failed: {e}"))
    }
}
