use crate::error::BountyError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

const ADDRESS_SCHEME: &str = "DIRECT://";

/// Local signing identity. The public key (hex) is the identity key used by
/// reports, relay events, and token ownership.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .finish()
    }
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load from a 32-byte hex-encoded secret.
    pub fn from_secret_hex(secret: &str) -> Result<Self, BountyError> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| BountyError::Validation(format!("secret key is not hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| BountyError::Validation("secret key must be 32 bytes".to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Hex-encoded secret, the inverse of [`Identity::from_secret_hex`].
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn address(&self) -> String {
        derive_address(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Derive the ledger address that tokens owned by `public_key` are locked to.
pub fn derive_address(public_key: &str) -> String {
    let digest = blake3::hash(public_key.trim().to_ascii_lowercase().as_bytes());
    format!("{ADDRESS_SCHEME}{}", digest.to_hex())
}

/// Check a hex signature over `message` against a hex public key.
pub fn verify_signature(public_key: &str, message: &[u8], signature: &str) -> bool {
    let Ok(key_bytes) = hex::decode(public_key) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}
