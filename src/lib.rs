//! Consensus-driven block production core.
//!
//! The crate composes two halves of a node's hot path. The `miner` module
//! runs the production pipeline: for the current tip it builds a transaction
//! bundle with its ledger-transition proof while a hashing worker searches the
//! nonce space for a header meeting the difficulty target, restarting both
//! whenever the tip moves and emitting finished transitions on a bounded
//! stream. The `consensus` module defines the mechanism contract the rest of
//! the node programs against (state transition, validity, fork-choice
//! `select`, lock bookkeeping) together with the two shipped variants,
//! proof-of-signature and proof-of-stake.
//!
//! Collaborators stay behind seams: the ledger and transaction pool in
//! [`ledger`], the proving backend in [`proofs`], keys and digests in
//! [`crypto`]. Startup configuration is read from `CODA_*` environment
//! variables by [`config`].

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod errors;
pub mod ledger;
pub mod miner;
pub mod proofs;
pub mod types;

pub use config::{MechanismKind, SignatureParameters, StakeParameters};
pub use consensus::{
    BlockchainState, Candidate, Choice, ConsensusMechanism, ConsensusState, Mechanism,
    ProofOfSignature, ProofOfStake, ProtocolState, SnarkTransition,
};
pub use errors::{ChainError, ChainResult};
pub use ledger::{Ledger, SignedTransaction, Transaction, TransactionPool};
pub use miner::{Miner, MinerConfig, Tip, TipChange, Transition, TransitionWithWitness};
pub use proofs::{HashCommitBackend, ProofBackend, ProofBytes, TransitionStatement};
pub use types::{BlockTime, Difficulty, LedgerHash, Nonce, StateHash, Strength};
