use std::fmt;

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::OverlayError;
use crate::protocol::{ADDRESS_LENGTH, SECRET_KEY_LENGTH};

/// Key type tag written into serialized identities
const KEY_TYPE_X25519: u8 = 0;

/// Short overlay address derived from an identity's public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    /// Derive the address for a public key: the leading bytes of its
    /// SHA-256 digest
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let digest = Sha256::digest(public);
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&digest[..ADDRESS_LENGTH]);
        Self(bytes)
    }

    /// Get the address as raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Symmetric packet key agreed between two identities
#[derive(Clone)]
pub struct SharedSecret([u8; SECRET_KEY_LENGTH]);

impl SharedSecret {
    /// Get the key as raw bytes
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material
        write!(f, "SharedSecret(..)")
    }
}

/// Long-term overlay identity: an X25519 keypair and its derived address.
///
/// Remote identities carry only the public half; the local node's identity
/// also holds the private half, which key agreement requires.
#[derive(Clone)]
pub struct Identity {
    address: Address,
    public: PublicKey,
    secret: Option<StaticSecret>,
}

impl Identity {
    /// Generate a new identity with a fresh keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            address: Address::from_public_key(public.as_bytes()),
            public,
            secret: Some(secret),
        }
    }

    /// Reconstruct a public-only identity from its public key
    pub fn from_public_key(public: [u8; 32]) -> Self {
        let public = PublicKey::from(public);
        Self {
            address: Address::from_public_key(public.as_bytes()),
            public,
            secret: None,
        }
    }

    /// Get this identity's overlay address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Check whether the private half is present
    pub fn has_private(&self) -> bool {
        self.secret.is_some()
    }

    /// Agree on a symmetric packet key with another identity.
    ///
    /// Performs X25519 Diffie-Hellman and derives the key with SHA-256.
    /// Fails if this identity has no private half or if the exchange was
    /// not contributory (a degenerate remote public key).
    pub fn agree(&self, other: &Identity) -> Result<SharedSecret, OverlayError> {
        let secret = self.secret.as_ref().ok_or(OverlayError::MissingPrivateKey)?;
        let dh = secret.diffie_hellman(&other.public);
        if !dh.was_contributory() {
            return Err(OverlayError::KeyAgreement);
        }
        Ok(SharedSecret(Sha256::digest(dh.as_bytes()).into()))
    }

    /// Serialize this identity. The private key is written only when
    /// `include_private` is set and the private half is present.
    pub fn serialize(&self, out: &mut Vec<u8>, include_private: bool) {
        out.extend_from_slice(self.address.as_bytes());
        out.push(KEY_TYPE_X25519);
        out.extend_from_slice(self.public.as_bytes());
        match (&self.secret, include_private) {
            (Some(secret), true) => {
                out.push(32);
                out.extend_from_slice(&secret.to_bytes());
            }
            _ => out.push(0),
        }
    }

    /// Deserialize an identity from the front of a buffer, returning it
    /// along with the number of bytes consumed
    pub fn deserialize(data: &[u8]) -> Result<(Identity, usize), OverlayError> {
        // address | key type | public | private length | [private]
        let min = ADDRESS_LENGTH + 1 + 32 + 1;
        if data.len() < min {
            return Err(OverlayError::InvalidIdentity("truncated".to_string()));
        }
        if data[ADDRESS_LENGTH] != KEY_TYPE_X25519 {
            return Err(OverlayError::InvalidIdentity(format!(
                "unknown key type {}",
                data[ADDRESS_LENGTH]
            )));
        }

        let mut public = [0u8; 32];
        public.copy_from_slice(&data[ADDRESS_LENGTH + 1..ADDRESS_LENGTH + 33]);

        let priv_len = data[min - 1] as usize;
        let secret = match priv_len {
            0 => None,
            32 => {
                if data.len() < min + 32 {
                    return Err(OverlayError::InvalidIdentity("truncated private key".to_string()));
                }
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&data[min..min + 32]);
                Some(StaticSecret::from(secret))
            }
            n => {
                return Err(OverlayError::InvalidIdentity(format!(
                    "bad private key length {}",
                    n
                )))
            }
        };

        let identity = Identity {
            address: Address::from_public_key(&public),
            public: PublicKey::from(public),
            secret,
        };

        // The serialized address must match the one the key derives to
        if identity.address.as_bytes()[..] != data[..ADDRESS_LENGTH] {
            return Err(OverlayError::InvalidIdentity(
                "address does not match public key".to_string(),
            ));
        }

        Ok((identity, min + priv_len))
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.public.as_bytes() == other.public.as_bytes()
    }
}

impl Eq for Identity {}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Identity {{ address: {}, public: {} }}",
            self.address,
            hex::encode(self.public.as_bytes())
        )
    }
}
