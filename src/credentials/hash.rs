//! Credential fingerprinting for session resumption

use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

use crate::types::Credentials;

/// Separator between the API key and the access token in the hash input
const FIELD_DELIMITER: &str = "|";

/// SHA-256 fingerprint of the credentials that created a session
///
/// Only used to decide whether a resuming connection presents the same
/// credentials; authorization itself always goes through the validator.
/// Absent and empty values hash identically.
#[derive(Clone, Copy)]
pub struct CredentialHash([u8; 32]);

impl CredentialHash {
    /// Hash an API key / access token pair
    #[must_use]
    pub fn compute(api_key: Option<&str>, access_token: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(api_key.unwrap_or_default().as_bytes());
        hasher.update(FIELD_DELIMITER.as_bytes());
        hasher.update(access_token.unwrap_or_default().as_bytes());
        Self(hasher.finalize().into())
    }

    /// Hash presented credentials
    #[must_use]
    pub fn of(credentials: &Credentials) -> Self {
        Self::compute(
            credentials.api_key.as_deref(),
            credentials.access_token.as_deref(),
        )
    }

    /// Lowercase hex digest (64 characters)
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PartialEq for CredentialHash {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for CredentialHash {}

impl fmt::Debug for CredentialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to correlate in logs without printing the whole digest
        write!(f, "CredentialHash({}…)", &self.to_hex()[..12])
    }
}

impl fmt::Display for CredentialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
