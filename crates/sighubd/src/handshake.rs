use crate::config::AuthConfig;
use rand::rngs::OsRng;
use rand::Rng;
use sighub_common::eth;
use sighub_common::protocol::{ServerFrame, ETHEREUM_HANDSHAKE};
use thiserror::Error;

/// Challenge issued to a pending connection.
///
/// Owned by the connection's driver and consumed on the first
/// verification attempt, so every exit path (success, failure,
/// disconnect) releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    /// Nonce token: `<epochMillis>:<hex 16 random bytes>`.
    pub token: String,
    /// Exact text the client must sign.
    pub message: String,
    /// Expiry, epoch milliseconds.
    pub expires_at_ms: u64,
}

/// Handshake failure reasons. The display strings are the wire contract:
/// they appear in `auth-failed` frames and in the 4001 close reason.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// An `auth-response` arrived with no challenge outstanding.
    #[error("No pending handshake challenge")]
    NoPending,
    /// The challenge outlived its configured validity.
    #[error("Handshake challenge expired")]
    Expired,
    /// The response omitted the signature or the address.
    #[error("Missing signature or address")]
    MissingFields,
    /// The address is not `0x` + 40 hex characters.
    #[error("Invalid Ethereum address format")]
    InvalidAddress,
    /// The signature is not `0x` + 130 hex characters.
    #[error("Invalid signature format")]
    InvalidSignature,
    /// The recovered signer does not match the claimed address.
    #[error("Signature verification failed")]
    VerificationFailed,
    /// Recovery itself failed on the well-formed signature.
    #[error("Signature verification error")]
    VerificationError,
}

/// Issue a fresh challenge for a pending connection.
#[must_use]
pub fn issue(auth: &AuthConfig, now_ms: u64) -> PendingChallenge {
    let mut nonce = [0u8; 16];
    OsRng.fill(&mut nonce);
    let token = format!("{now_ms}:{}", hex::encode(nonce));
    let message = format!("{}\n\nToken: {}", auth.handshake_message, token);
    PendingChallenge {
        token,
        message,
        expires_at_ms: now_ms + auth.handshake_expiry * 1000,
    }
}

/// The `auth-challenge` frame announcing a challenge to the client.
#[must_use]
pub fn challenge_frame(challenge: &PendingChallenge) -> ServerFrame {
    ServerFrame::AuthChallenge {
        method: ETHEREUM_HANDSHAKE.to_string(),
        token: challenge.token.clone(),
        message: challenge.message.clone(),
        expiry: challenge.expires_at_ms,
    }
}

/// Verify an `auth-response` against its pending challenge.
///
/// Checks run in wire-contract order: expiry, field presence, address
/// format, signature format, then EIP-191 recovery with a
/// case-insensitive address comparison. Returns the wallet address in
/// lowercase, ready to use as the user id.
///
/// # Errors
///
/// Returns the [`HandshakeError`] whose display string must be surfaced
/// to the client.
pub fn verify(
    challenge: &PendingChallenge,
    signature: Option<&str>,
    address: Option<&str>,
    now_ms: u64,
) -> Result<String, HandshakeError> {
    if now_ms > challenge.expires_at_ms {
        return Err(HandshakeError::Expired);
    }
    let (signature, address) = match (signature, address) {
        (Some(signature), Some(address)) => (signature, address),
        _ => return Err(HandshakeError::MissingFields),
    };
    if !eth::is_valid_address(address) {
        return Err(HandshakeError::InvalidAddress);
    }
    if !eth::is_valid_signature_hex(signature) {
        return Err(HandshakeError::InvalidSignature);
    }

    let recovered = eth::recover_address(&challenge.message, signature)
        .map_err(|_| HandshakeError::VerificationError)?;
    if !recovered.eq_ignore_ascii_case(address) {
        return Err(HandshakeError::VerificationFailed);
    }
    Ok(address.to_ascii_lowercase())
}
