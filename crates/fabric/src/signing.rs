//! Ed25519 signing service.
//!
//! A [`Signature`] carries the signer's verifying key alongside the signature
//! bytes, so any node can check it with [`verify_signature`]. Whether that key
//! actually belongs to the claimed node is a separate check done by the
//! callers that hold a key directory (validator set, manifest issuer).

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::FabricError;

/// Hex-encoded Ed25519 signature plus the hex-encoded verifying key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub public_key: String,
    pub value: String,
}

/// Contract of the signing collaborator.
pub trait SigningService: Send + Sync {
    /// Sign `data` with this node's key.
    fn sign(&self, data: &[u8]) -> Signature;

    /// Verify `signature` over `data`.
    fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        verify_signature(data, signature)
    }

    /// Hex-encoded verifying key of this signer.
    fn public_key(&self) -> String;
}

/// Verify a signature against the key embedded in it.
pub fn verify_signature(data: &[u8], signature: &Signature) -> bool {
    let Ok(key_bytes) = hex::decode(&signature.public_key) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(&signature.value) else {
        return false;
    };
    let Ok(key_arr) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_arr) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);
    key.verify(data, &sig).is_ok()
}

/// Ed25519 implementation of [`SigningService`].
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Fresh random key from the OS RNG.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic key from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Key from a hex-encoded 32-byte secret.
    pub fn from_hex(secret: &str) -> Result<Self, FabricError> {
        let bytes = hex::decode(secret).map_err(|e| FabricError::KeyMaterial(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FabricError::KeyMaterial("secret key must be 32 bytes".into()))?;
        Ok(Self::from_seed(seed))
    }
}

impl SigningService for Ed25519Signer {
    fn sign(&self, data: &[u8]) -> Signature {
        let sig = self.key.sign(data);
        Signature {
            public_key: self.public_key(),
            value: hex::encode(sig.to_bytes()),
        }
    }

    fn public_key(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }
}
