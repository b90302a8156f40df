use blake2::{Blake2s256, Digest};
use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use malachite::Natural;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::natural_from_bytes;

pub fn digest(bytes: &[u8]) -> [u8; 32] {
    Blake2s256::digest(bytes).into()
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> ChainResult<()> {
    public_key
        .verify(message, signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

pub fn address_from_public_key(public_key: &PublicKey) -> String {
    hex::encode(digest(public_key.as_bytes()))
}

pub fn public_key_to_hex(public_key: &PublicKey) -> String {
    hex::encode(public_key.to_bytes())
}

pub fn public_key_from_hex(data: &str) -> ChainResult<PublicKey> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Crypto(format!("invalid public key encoding: {err}")))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

pub fn signature_to_hex(signature: &Signature) -> String {
    hex::encode(signature.to_bytes())
}

pub fn signature_from_hex(data: &str) -> ChainResult<Signature> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Crypto(format!("invalid signature encoding: {err}")))?;
    Signature::from_bytes(&bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))
}

/// Verifiable-random-function output for slot eligibility. The construction is
/// a domain-separated digest over the public inputs, so any observer can
/// recompute and check it.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VrfOutput(pub [u8; 32]);

impl VrfOutput {
    pub fn randomness(&self) -> Natural {
        natural_from_bytes(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for VrfOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VrfOutput({})", self.to_hex())
    }
}

fn vrf_domain(seed: &[u8; 32], slot: u64, public_key: &PublicKey, stake: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + 8 + 32 + 8 + 16);
    data.extend_from_slice(b"coda-vrf");
    data.extend_from_slice(seed);
    data.extend_from_slice(&slot.to_le_bytes());
    data.extend_from_slice(public_key.as_bytes());
    data.extend_from_slice(&stake.to_le_bytes());
    data
}

pub fn evaluate_vrf(seed: &[u8; 32], slot: u64, public_key: &PublicKey, stake: u64) -> VrfOutput {
    VrfOutput(digest(&vrf_domain(seed, slot, public_key, stake)))
}

pub fn verify_vrf(
    seed: &[u8; 32],
    slot: u64,
    public_key: &PublicKey,
    stake: u64,
    output: &VrfOutput,
) -> bool {
    evaluate_vrf(seed, slot, public_key, stake) == *output
}
