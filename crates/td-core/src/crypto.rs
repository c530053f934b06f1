//! Password hashing, session tokens, OTP codes and voucher codes.
//!
//! Everything here is built on `ring`: PBKDF2-HMAC-SHA256 for passwords,
//! SHA-256 for session token digests, HMAC-SHA256 for OTP codes and
//! `SystemRandom` for every random value. Secret key material is zeroed on
//! drop via `zeroize`.

use std::num::NonZeroU32;

use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac, pbkdf2};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const CREDENTIAL_LEN: usize = digest::SHA256_OUTPUT_LEN;
const SESSION_TOKEN_LEN: usize = 32;
const HASH_SCHEME: &str = "pbkdf2-sha256";

/// Unambiguous uppercase alphabet (no 0/O, 1/I). 32 symbols, so a random byte
/// masked to 5 bits picks uniformly.
const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to generate random bytes")]
    RandomGeneration,
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

// ---------------------------------------------------------------------------
// Passwords
// ---------------------------------------------------------------------------

/// Hash a password into `pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>`.
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    hash_password_with_iterations(password, PBKDF2_ITERATIONS)
}

fn hash_password_with_iterations(password: &str, iterations: u32) -> Result<String, CryptoError> {
    let iters = NonZeroU32::new(iterations)
        .ok_or_else(|| CryptoError::InvalidFormat("iterations must be non-zero".into()))?;
    let salt = random_bytes::<SALT_LEN>()?;
    let mut out = [0u8; CREDENTIAL_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iters,
        &salt,
        password.as_bytes(),
        &mut out,
    );
    Ok(format!(
        "{HASH_SCHEME}${iterations}${}${}",
        hex::encode(&salt),
        hex::encode(&out)
    ))
}

/// Verify a password against a stored hash in constant time.
///
/// Malformed hashes verify as `false` rather than erroring so that a corrupt
/// row behaves like a wrong password.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iters), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != HASH_SCHEME {
        return false;
    }
    let Some(iters) = iters.parse::<u32>().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Some(salt), Some(hash)) = (hex::decode(salt), hex::decode(hash)) else {
        return false;
    };
    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iters,
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}

// ---------------------------------------------------------------------------
// Session tokens
// ---------------------------------------------------------------------------

/// Generate an opaque session token for the cookie (64 hex chars).
pub fn generate_session_token() -> Result<String, CryptoError> {
    Ok(hex::encode(&random_bytes::<SESSION_TOKEN_LEN>()?))
}

/// SHA-256 digest of a token; only the digest is persisted.
pub fn hash_token(token: &str) -> String {
    hex::encode(digest::digest(&digest::SHA256, token.as_bytes()).as_ref())
}

// ---------------------------------------------------------------------------
// OTP
// ---------------------------------------------------------------------------

/// HMAC key for OTP hashing, zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct OtpKey {
    bytes: Vec<u8>,
}

impl OtpKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: secret.into(),
        }
    }

    /// Random key for deployments without a configured OTP secret.
    /// Codes issued before a restart stop verifying.
    pub fn ephemeral() -> Result<Self, CryptoError> {
        Ok(Self {
            bytes: random_bytes::<32>()?.to_vec(),
        })
    }

    /// HMAC-SHA256 of `phone:purpose:code`, hex encoded.
    pub fn hash_code(&self, phone: &str, purpose: &str, code: &str) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, &self.bytes);
        let msg = format!("{phone}:{purpose}:{code}");
        hex::encode(hmac::sign(&key, msg.as_bytes()).as_ref())
    }

    /// Constant-time comparison of a submitted code with a stored hash.
    pub fn verify_code(&self, phone: &str, purpose: &str, code: &str, stored: &str) -> bool {
        let candidate = self.hash_code(phone, purpose, code);
        bool::from(candidate.as_bytes().ct_eq(stored.as_bytes()))
    }
}

impl std::fmt::Debug for OtpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OtpKey(..)")
    }
}

/// Uniform numeric code of `digits` digits (1..=9), zero padded.
pub fn generate_otp(digits: u32) -> Result<String, CryptoError> {
    if !(1..=9).contains(&digits) {
        return Err(CryptoError::InvalidFormat(format!(
            "otp digits must be 1..=9, got {digits}"
        )));
    }
    let modulus = 10u32.pow(digits);
    // Largest multiple of `modulus` that fits in u32; values above are rejected.
    let zone = u32::MAX - (u32::MAX % modulus);
    loop {
        let value = u32::from_be_bytes(random_bytes::<4>()?);
        if value < zone {
            return Ok(format!("{:0width$}", value % modulus, width = digits as usize));
        }
    }
}

// ---------------------------------------------------------------------------
// Voucher / referral codes
// ---------------------------------------------------------------------------

/// Random code from [`CODE_ALPHABET`], e.g. `K7QM2ZRA`.
pub fn generate_code(len: usize) -> Result<String, CryptoError> {
    let mut bytes = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| CryptoError::RandomGeneration)?;
    Ok(bytes
        .iter()
        .map(|b| CODE_ALPHABET[(b & 0x1f) as usize] as char)
        .collect())
}

fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| CryptoError::RandomGeneration)?;
    Ok(buf)
}

mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: &[u8]) -> String {
        let mut s = String::with_capacity(bytes.len() * 2);
        for &b in bytes {
            s.push(HEX_CHARS[(b >> 4) as usize] as char);
            s.push(HEX_CHARS[(b & 0x0f) as usize] as char);
        }
        s
    }

    pub fn decode(s: &str) -> Option<Vec<u8>> {
        if s.len() % 2 != 0 {
            return None;
        }
        s.as_bytes()
            .chunks(2)
            .map(|pair| {
                let hi = (pair[0] as char).to_digit(16)?;
                let lo = (pair[1] as char).to_digit(16)?;
                Some((hi * 16 + lo) as u8)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
