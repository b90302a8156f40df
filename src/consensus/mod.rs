//! Consensus mechanism contracts: the state schema every variant fulfils, the
//! fork-choice interface, and the protocol-state data model shared by the
//! miner and the chain controller.

pub mod checked;
pub mod signature;
pub mod stake;

use std::fmt;
use std::sync::Arc;

use bincode::Options;
use ed25519_dalek::Keypair;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{
    genesis_timestamp_from_env, MechanismKind, SignatureParameters, StakeParameters,
};
use crate::crypto::digest;
use crate::errors::{ChainError, ChainResult};
use crate::ledger::{Ledger, SignedTransaction};
use crate::proofs::{canonical_options, ProofBytes};
use crate::types::{fold_triples, BlockTime, Difficulty, LedgerHash, Nonce, StateHash, Strength};

use self::checked::ConstraintSystem;

pub use self::signature::{ProofOfSignature, SignatureData, SignatureState};
pub use self::stake::{ProofOfStake, StakeData, StakeLocalState, StakeState};

const HEADER_DOMAIN: &[u8] = b"coda-header";

/// Canonical byte encoding shared by every consensus data type.
pub fn encode_canonical<T: Serialize>(value: &T) -> ChainResult<Vec<u8>> {
    canonical_options()
        .serialize(value)
        .map_err(ChainError::Serialization)
}

pub fn decode_canonical<T: DeserializeOwned>(bytes: &[u8]) -> ChainResult<T> {
    canonical_options()
        .deserialize(bytes)
        .map_err(ChainError::Serialization)
}

/// The non-consensus portion of a block's on-chain summary.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockchainState {
    pub ledger_hash: LedgerHash,
    pub timestamp: BlockTime,
}

impl BlockchainState {
    pub fn genesis(ledger_hash: LedgerHash, timestamp: BlockTime) -> Self {
        Self {
            ledger_hash,
            timestamp,
        }
    }

    pub fn message_bytes(&self, previous_state_hash: &StateHash) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 32 + 8 + 16);
        data.extend_from_slice(b"coda-blockchain-state");
        data.extend_from_slice(&previous_state_hash.0);
        data.extend_from_slice(&self.ledger_hash.0);
        data.extend_from_slice(&self.timestamp.millis().to_le_bytes());
        data
    }
}

/// Head-of-chain summary; its hash is the parent link.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProtocolState<S> {
    pub previous_state_hash: StateHash,
    pub blockchain_state: BlockchainState,
    pub consensus_state: S,
}

impl<S: Serialize> ProtocolState<S> {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing protocol state")
    }

    pub fn hash(&self) -> StateHash {
        StateHash(digest(&self.canonical_bytes()))
    }
}

/// A block as it travels with its succinct proof.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SnarkTransition<D> {
    pub blockchain_state: BlockchainState,
    pub consensus_data: D,
    pub proof: ProofBytes,
}

/// Fork-choice verdict: retain the existing tip or adopt the candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Choice {
    Keep,
    Take,
}

/// A tip paired with the local wall-clock instant it was first observed.
#[derive(Debug)]
pub struct Candidate<'a, S> {
    pub state: &'a S,
    pub received_at: BlockTime,
}

impl<'a, S> Candidate<'a, S> {
    pub fn new(state: &'a S, received_at: BlockTime) -> Self {
        Self { state, received_at }
    }
}

impl<'a, S> Clone for Candidate<'a, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, S> Copy for Candidate<'a, S> {}

/// Per-variant head-of-chain summary. Provides the canonical bit encoding the
/// proof system folds over and the base header fields the nonce search needs.
pub trait ConsensusState:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Fixed width of the bit encoding, in triples of booleans.
    fn length_in_triples() -> usize;

    /// Number of transitions since genesis.
    fn length(&self) -> u64;

    fn next_difficulty(&self) -> &Difficulty;

    fn strength(&self) -> &Strength;

    fn timestamp(&self) -> BlockTime;

    fn ledger_hash(&self) -> &LedgerHash;

    fn previous_state_hash(&self) -> &StateHash;

    /// Canonical fixed-width bit encoding. Padded (with zero bits) to exactly
    /// `length_in_triples() * 3` by [`ConsensusState::fold`].
    fn to_bits(&self) -> Vec<bool>;

    fn fold<A, F>(&self, init: A, f: F) -> A
    where
        F: FnMut(A, bool) -> A,
    {
        fold_triples(&self.to_bits(), Self::length_in_triples(), init, f)
    }
}

/// Digest the nonce search tests against the difficulty target.
pub fn header_digest<S: Serialize>(state: &S, nonce: &Nonce) -> [u8; 32] {
    let mut data = Vec::new();
    data.extend_from_slice(HEADER_DOMAIN);
    data.extend_from_slice(&serde_json::to_vec(state).expect("serializing consensus state"));
    data.extend_from_slice(&nonce.to_le_bytes());
    digest(&data)
}

/// Startup dispatch over the shipped variants. Reads `CODA_CONSENSUS_MECHANISM`
/// once and builds the selected mechanism; everything downstream stays generic
/// over the concrete type.
pub enum Mechanism {
    Signature(Arc<ProofOfSignature>),
    Stake(Arc<ProofOfStake>),
}

impl Mechanism {
    pub fn from_env(
        designated_signer: ed25519_dalek::PublicKey,
        genesis_ledger: &Ledger,
    ) -> ChainResult<Self> {
        match MechanismKind::from_env()? {
            MechanismKind::ProofOfSignature => {
                let params = SignatureParameters::from_env()?;
                let genesis_timestamp = genesis_timestamp_from_env()?;
                Ok(Mechanism::Signature(Arc::new(ProofOfSignature::new(
                    designated_signer,
                    params,
                    genesis_ledger.hash(),
                    genesis_timestamp,
                ))))
            }
            MechanismKind::ProofOfStake => {
                let params = StakeParameters::from_env()?;
                Ok(Mechanism::Stake(Arc::new(ProofOfStake::new(
                    params,
                    genesis_ledger,
                ))))
            }
        }
    }

    pub fn kind(&self) -> MechanismKind {
        match self {
            Mechanism::Signature(_) => MechanismKind::ProofOfSignature,
            Mechanism::Stake(_) => MechanismKind::ProofOfStake,
        }
    }
}

/// Contract every consensus variant fulfils. The node picks a variant once at
/// startup; all hot paths are generic over the chosen mechanism.
pub trait ConsensusMechanism: Send + Sync + 'static {
    type State: ConsensusState;
    type TransitionData: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send
        + 'static;
    type LocalState: Send + 'static;

    fn name(&self) -> &'static str;

    fn genesis_protocol_state(&self) -> ProtocolState<Self::State>;

    /// Pure header advance used by the nonce search: the successor state for a
    /// given parent, target ledger and wall-clock instant, before any
    /// variant-specific evidence is attached.
    fn advance_header(
        &self,
        prev: &Self::State,
        previous_state_hash: StateHash,
        ledger_hash: LedgerHash,
        timestamp: BlockTime,
    ) -> Self::State;

    /// Proposer entry point. Returns `None` when the caller is not eligible to
    /// produce a block at `time` under this variant's rule.
    #[allow(clippy::too_many_arguments)]
    fn generate_transition(
        &self,
        prev: &ProtocolState<Self::State>,
        blockchain_state: &BlockchainState,
        local_state: &Self::LocalState,
        time: BlockTime,
        keypair: &Keypair,
        transactions: &[SignedTransaction],
    ) -> Option<(ProtocolState<Self::State>, Self::TransitionData)>;

    /// Deterministic transition function, out-of-circuit form.
    fn next_state(
        &self,
        prev: &Self::State,
        previous_state_hash: &StateHash,
        transition: &SnarkTransition<Self::TransitionData>,
    ) -> Self::State;

    /// Constraint-system form of [`ConsensusMechanism::next_state`]; must agree
    /// with it on all inputs.
    fn next_state_checked(
        &self,
        cs: &mut ConstraintSystem,
        prev: &Self::State,
        previous_state_hash: &StateHash,
        transition: &SnarkTransition<Self::TransitionData>,
    ) -> Self::State;

    /// Validity of the variant's additional evidence, out-of-circuit form.
    fn is_transition_valid(
        &self,
        prev: &ProtocolState<Self::State>,
        transition: &SnarkTransition<Self::TransitionData>,
    ) -> bool;

    /// Constraint-system form of [`ConsensusMechanism::is_transition_valid`];
    /// must agree with it on all inputs.
    fn is_transition_valid_checked(
        &self,
        cs: &mut ConstraintSystem,
        prev: &ProtocolState<Self::State>,
        transition: &SnarkTransition<Self::TransitionData>,
    ) -> bool;

    /// Fork choice between the existing tip and a candidate. Total and
    /// deterministic; an exact tie keeps the existing side.
    fn select(
        &self,
        existing: Candidate<'_, Self::State>,
        candidate: Candidate<'_, Self::State>,
    ) -> Choice;

    /// Variant-local bookkeeping when a locked-in tip advances.
    fn lock_transition(
        &self,
        old: &Self::State,
        new: &Self::State,
        snarked_ledger: &Ledger,
        local_state: &mut Self::LocalState,
    );
}
