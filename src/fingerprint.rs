//! Host key fingerprints and the verification callback used during the
//! SSH handshake.
//!
//! The expected fingerprint's encoding is selected purely by its length:
//! - 43 chars: base64 SHA256 (no padding), as printed by `ssh-keygen -l`
//! - 59 chars: colon-separated hex SHA1
//! - 47 chars: colon-separated hex MD5

use base64::Engine;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::HostKeyError;

const MD5_FINGERPRINT_LENGTH: usize = 47;
const HEX_SHA1_FINGERPRINT_LENGTH: usize = 59;
const BASE64_SHA256_FINGERPRINT_LENGTH: usize = 43;

/// MD5 of the wire-format key, as `aa:bb:...`.
pub fn md5_fingerprint(key_bytes: &[u8]) -> String {
    colon_hex(&Md5::digest(key_bytes))
}

/// SHA1 of the wire-format key, as `aa:bb:...`.
pub fn hex_sha1_fingerprint(key_bytes: &[u8]) -> String {
    colon_hex(&Sha1::digest(key_bytes))
}

/// SHA256 of the wire-format key, base64 without trailing `=`.
pub fn base64_sha256_fingerprint(key_bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(Sha256::digest(key_bytes))
}

fn colon_hex(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Checks a server's host key against the fingerprint handed out by the
/// platform alongside the one-time passcode.
#[derive(Debug, Clone)]
pub struct FingerprintVerifier {
    expected: String,
    skip_validation: bool,
}

impl FingerprintVerifier {
    pub fn new(expected: impl Into<String>, skip_validation: bool) -> Self {
        Self {
            expected: expected.into(),
            skip_validation,
        }
    }

    /// Verify the raw (SSH wire format) public key bytes.
    pub fn verify(&self, key_bytes: &[u8]) -> Result<(), HostKeyError> {
        if self.skip_validation {
            return Ok(());
        }

        let fingerprint = match self.expected.len() {
            BASE64_SHA256_FINGERPRINT_LENGTH => base64_sha256_fingerprint(key_bytes),
            HEX_SHA1_FINGERPRINT_LENGTH => hex_sha1_fingerprint(key_bytes),
            MD5_FINGERPRINT_LENGTH => md5_fingerprint(key_bytes),
            0 => return Err(HostKeyError::NoFingerprint(md5_fingerprint(key_bytes))),
            _ => return Err(HostKeyError::UnsupportedFormat),
        };

        if fingerprint != self.expected {
            return Err(HostKeyError::Mismatch(fingerprint));
        }
        Ok(())
    }

    /// Verify a key received from russh during the handshake.
    pub fn verify_public_key(&self, key: &russh::keys::PublicKey) -> Result<(), HostKeyError> {
        use russh::keys::PublicKeyBase64;
        self.verify(&key.public_key_bytes())
    }
}
