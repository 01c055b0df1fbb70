//! EIP-191 `personal_sign` helpers for the wallet handshake.
//!
//! Provides the prefixed Keccak-256 digest, signature-to-address recovery,
//! and the client-side signing counterpart used by the demo client and the
//! test suite.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use std::fmt;
use thiserror::Error;

// ── Error types ──────────────────────────────────────────────────────────────

/// Error returned when the system clock is before the Unix epoch.
#[derive(Debug, Clone, Copy)]
pub struct ClockError;

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system clock is before Unix epoch")
    }
}

impl std::error::Error for ClockError {}

/// Errors that can occur while recovering or producing a signature.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EthError {
    /// The signature was not 65 bytes of valid hex.
    #[error("malformed signature encoding")]
    MalformedSignature,
    /// The recovery byte was outside {0, 1, 27, 28}.
    #[error("invalid recovery id")]
    BadRecoveryId,
    /// The secp256k1 public key could not be recovered.
    #[error("public key recovery failed")]
    Recovery,
    /// Signing failed (degenerate key material).
    #[error("signing failed")]
    Signing,
}

// ── Wall clock ───────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// # Errors
///
/// Returns [`ClockError`] if the system clock is before the Unix epoch,
/// indicating a misconfigured system. Callers must handle this case
/// explicitly rather than silently using a fallback value.
///
/// # Examples
///
/// ```
/// let now = sighub_common::eth::unix_now_ms().unwrap();
/// assert!(now > 1_700_000_000_000);
/// ```
pub fn unix_now_ms() -> Result<u64, ClockError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| ClockError)
}

// ── EIP-191 digest and recovery ──────────────────────────────────────────────

/// Computes the EIP-191 `personal_sign` digest:
/// `keccak256("\x19Ethereum Signed Message:\n" ‖ decimal(len) ‖ message)`.
#[must_use]
pub fn personal_sign_hash(message: &str) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message.as_bytes());
    hasher.finalize().into()
}

/// Recovers the signer's Ethereum address from a `personal_sign` signature.
///
/// Accepts both raw (0/1) and legacy (27/28) recovery bytes. The returned
/// address is `0x`-prefixed lowercase hex.
///
/// # Errors
///
/// Returns [`EthError`] when the signature is malformed or no public key
/// can be recovered from it.
///
/// # Examples
///
/// ```
/// use k256::ecdsa::SigningKey;
/// use sighub_common::eth;
///
/// let key = SigningKey::from_bytes(&[7u8; 32].into()).unwrap();
/// let sig = eth::sign_personal(&key, "hello").unwrap();
/// let addr = eth::recover_address("hello", &sig).unwrap();
/// assert_eq!(addr, eth::address_of(&key));
/// ```
pub fn recover_address(message: &str, signature_hex: &str) -> Result<String, EthError> {
    let raw = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|_| EthError::MalformedSignature)?;
    if raw.len() != 65 {
        return Err(EthError::MalformedSignature);
    }

    let v = match raw[64] {
        27 | 28 => raw[64] - 27,
        0 | 1 => raw[64],
        _ => return Err(EthError::BadRecoveryId),
    };
    let recovery_id = RecoveryId::try_from(v).map_err(|_| EthError::BadRecoveryId)?;
    let signature = Signature::try_from(&raw[..64]).map_err(|_| EthError::MalformedSignature)?;

    let digest = personal_sign_hash(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|_| EthError::Recovery)?;
    Ok(address_of_verifying_key(&key))
}

/// Signs `message` in `personal_sign` style, returning a 65-byte hex
/// signature with a legacy (27/28) recovery byte.
///
/// # Errors
///
/// Returns [`EthError::Signing`] when the key cannot produce a recoverable
/// signature.
pub fn sign_personal(key: &SigningKey, message: &str) -> Result<String, EthError> {
    let digest = personal_sign_hash(message);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&digest)
        .map_err(|_| EthError::Signing)?;
    let mut raw = signature.to_bytes().to_vec();
    raw.push(27 + recovery_id.to_byte());
    Ok(format!("0x{}", hex::encode(raw)))
}

/// Ethereum address of a signing key, `0x`-prefixed lowercase hex.
#[must_use]
pub fn address_of(key: &SigningKey) -> String {
    address_of_verifying_key(key.verifying_key())
}

fn address_of_verifying_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let mut hasher = Keccak256::new();
    // Skip the 0x04 uncompressed-point marker.
    hasher.update(&point.as_bytes()[1..]);
    let out = hasher.finalize();
    format!("0x{}", hex::encode(&out[12..]))
}

// ── Format validation ────────────────────────────────────────────────────────

/// Returns `true` for a well-formed Ethereum address (`0x` + 40 hex chars).
#[must_use]
pub fn is_valid_address(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Returns `true` for a well-formed 65-byte signature (`0x` + 130 hex chars).
#[must_use]
pub fn is_valid_signature_hex(s: &str) -> bool {
    s.len() == 132 && s.starts_with("0x") && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}
