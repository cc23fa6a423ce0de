//! The credential/identity seam. The engine treats identity as an opaque,
//! stable string and the credential as an opaque signing capability; the
//! actual cryptographic guarantees (Ed25519 here) are an implementation
//! detail the engine never reaches past.

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Domain-separates identity derivation from any other use of HMAC-SHA256
/// over a public key elsewhere in the system.
const IDENTITY_DOMAIN: &[u8] = b"relay-identity-v1";

/// An opaque, stable, globally-unique handle derived from a public key.
/// Two identities are equal iff their derivation inputs were equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// `base32(HMAC-SHA256(domain_magic_string, public_key))`, unpadded.
    pub fn derive(public_key: &[u8]) -> Self {
        let mut mac = Hmac::<Sha256>::new_from_slice(IDENTITY_DOMAIN).expect("HMAC accepts keys of any length");
        mac.update(public_key);
        let digest = mac.finalize().into_bytes();
        Self(BASE32_NOPAD.encode(&digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// An opaque signing capability. The engine only ever calls `id`,
/// `public_key`, and `sign` — verification of a *remote* signature goes
/// through the free function [`verify`], since the verifier does not hold
/// the signer's private key.
pub trait Credential: Send + Sync {
    fn id(&self) -> &Identity;
    fn public_key(&self) -> &[u8];
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// The concrete credential: an Ed25519 keypair plus its derived identity.
pub struct Ed25519Credential {
    signing_key: SigningKey,
    verifying_key_bytes: [u8; 32],
    identity: Identity,
}

impl Ed25519Credential {
    pub fn generate<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        Self::from_signing_key(SigningKey::generate(rng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key_bytes = signing_key.verifying_key().to_bytes();
        let identity = Identity::derive(&verifying_key_bytes);
        Self {
            signing_key,
            verifying_key_bytes,
            identity,
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }
}

impl Credential for Ed25519Credential {
    fn id(&self) -> &Identity {
        &self.identity
    }

    fn public_key(&self) -> &[u8] {
        &self.verifying_key_bytes
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

/// Verifies a detached signature against a claimed identity and public key.
/// Returns `false` (never panics) on any malformed input.
pub fn verify(identity: &Identity, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    if Identity::derive(public_key) != *identity {
        return false;
    }

    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };

    verifying_key.verify(message, &signature).is_ok()
}

/// Constant-time equality for comparing a presented reverse-connection
/// token against the lease's stored `reverse_token`.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let mut rng = rand::rngs::OsRng;
        let credential = Ed25519Credential::generate(&mut rng);

        let message = b"Hello, Portal!";
        let signature = credential.sign(message);

        assert!(verify(credential.id(), credential.public_key(), message, &signature));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let mut rng = rand::rngs::OsRng;
        let credential = Ed25519Credential::generate(&mut rng);

        let signature = credential.sign(b"Hello, Portal!");

        assert!(!verify(credential.id(), credential.public_key(), b"Hello, portal!", &signature));
    }

    #[test]
    fn identity_is_stable_for_same_key() {
        let mut rng = rand::rngs::OsRng;
        let credential = Ed25519Credential::generate(&mut rng);
        let rederived = Identity::derive(credential.public_key());

        assert_eq!(credential.id(), &rederived);
    }

    #[test]
    fn constant_time_eq_matches_naive_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
