use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};

pub const PUBLIC_KEY_PREFIX: &str = "PUB_ED25519_";
pub const PRIVATE_KEY_PREFIX: &str = "PVT_ED25519_";
pub const SIGNATURE_PREFIX: &str = "SIG_ED25519_";

/// Owner or active key material of an account.
///
/// The private half is optional: accounts created from a public key only
/// (or keys held exclusively by the wallet daemon) carry `None`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl KeyPair {
    pub fn public_only(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: None,
        }
    }

    pub fn from_private(private_key: &str) -> HarnessResult<Self> {
        let signing = parse_private_key(private_key)?;
        Ok(Self {
            public_key: encode_public_key(&signing.verifying_key()),
            private_key: Some(private_key.to_string()),
        })
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .finish()
    }
}

pub fn generate_key_pair() -> KeyPair {
    let signing = SigningKey::generate(&mut OsRng);
    KeyPair {
        public_key: encode_public_key(&signing.verifying_key()),
        private_key: Some(encode_private_key(&signing)),
    }
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    format!("{PUBLIC_KEY_PREFIX}{}", hex::encode(key.to_bytes()))
}

pub fn encode_private_key(key: &SigningKey) -> String {
    format!("{PRIVATE_KEY_PREFIX}{}", hex::encode(key.to_bytes()))
}

pub fn parse_public_key(encoded: &str) -> HarnessResult<VerifyingKey> {
    let bytes = decode_fixed::<32>(encoded, PUBLIC_KEY_PREFIX, "public key")?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|err| HarnessError::KeyGen(format!("invalid public key {encoded}: {err}")))
}

pub fn parse_private_key(encoded: &str) -> HarnessResult<SigningKey> {
    let bytes = decode_fixed::<32>(encoded, PRIVATE_KEY_PREFIX, "private key")?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn public_key_of(private_key: &str) -> HarnessResult<String> {
    Ok(encode_public_key(&parse_private_key(private_key)?.verifying_key()))
}

pub fn sign_digest(private_key: &str, digest: &[u8]) -> HarnessResult<String> {
    let signing = parse_private_key(private_key)?;
    let signature = signing.sign(digest);
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(signature.to_bytes())))
}

/// Returns `false` for malformed keys or signatures as well as for mismatches.
pub fn verify_digest(public_key: &str, digest: &[u8], signature: &str) -> bool {
    let Ok(key) = parse_public_key(public_key) else {
        return false;
    };
    let Ok(bytes) = decode_fixed::<64>(signature, SIGNATURE_PREFIX, "signature") else {
        return false;
    };
    key.verify(digest, &Signature::from_bytes(&bytes)).is_ok()
}

fn decode_fixed<const N: usize>(encoded: &str, prefix: &str, what: &str) -> HarnessResult<[u8; N]> {
    let body = encoded
        .strip_prefix(prefix)
        .ok_or_else(|| HarnessError::KeyGen(format!("{what} must start with {prefix}")))?;
    let bytes = hex::decode(body)
        .map_err(|err| HarnessError::KeyGen(format!("{what} is not valid hex: {err}")))?;
    bytes
        .try_into()
        .map_err(|_| HarnessError::KeyGen(format!("{what} must encode {N} bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pair_round_trips_through_private_key() {
        let pair = generate_key_pair();
        let private = pair.private_key.clone().expect("private key");
        let restored = KeyPair::from_private(&private).expect("restore");
        assert_eq!(restored, pair);
        assert!(pair.public_key.starts_with(PUBLIC_KEY_PREFIX));
    }

    #[test]
    fn signatures_verify_only_for_matching_key() {
        let signer = generate_key_pair();
        let other = generate_key_pair();
        let digest = [7u8; 32];
        let signature =
            sign_digest(signer.private_key.as_deref().expect("key"), &digest).expect("sign");
        assert!(verify_digest(&signer.public_key, &digest, &signature));
        assert!(!verify_digest(&other.public_key, &digest, &signature));
        assert!(!verify_digest(&signer.public_key, &[8u8; 32], &signature));
        assert!(!verify_digest(&signer.public_key, &digest, "SIG_ED25519_zz"));
    }

    #[test]
    fn debug_output_redacts_private_key() {
        let pair = generate_key_pair();
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains(pair.private_key.as_deref().expect("key")));
    }
}
