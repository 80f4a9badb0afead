//! Injector patch verification.
//!
//! An injector is a mutating admission handler whose patches must be
//! cryptographically signed. The verifier holds the configured Ed25519
//! public key (PEM/SPKI) and checks the signature over the exact patch
//! bytes the handler produced; any failure denies admission regardless of
//! what the handler decided.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::{Error, Result};

/// Verifies handler patch signatures against a configured public key.
pub struct PatchVerifier {
    key: VerifyingKey,
}

impl PatchVerifier {
    /// Load the verification key from a PEM (SPKI) file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        let pem = std::fs::read_to_string(path.as_ref())?;
        let key = VerifyingKey::from_public_key_pem(&pem).map_err(|e| {
            Error::InvalidConfig(format!(
                "invalid verification key '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self { key })
    }

    /// Wrap an already-parsed key; used by tests.
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Verify `signature_b64` over the exact patch bytes.
    pub fn verify(&self, patch: &[u8], signature_b64: &str) -> Result<()> {
        let raw = BASE64
            .decode(signature_b64)
            .map_err(|e| Error::InvalidConfig(format!("signature is not valid base64: {e}")))?;
        let signature = Signature::from_slice(&raw)
            .map_err(|e| Error::InvalidConfig(format!("malformed signature: {e}")))?;
        self.key
            .verify_strict(patch, &signature)
            .map_err(|_| Error::InvalidConfig("patch signature verification failed".into()))
    }
}
