use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::crypto::digest;
use crate::errors::{ChainError, ChainResult};
use crate::ledger::SignedTransaction;
use crate::types::LedgerHash;

/// Canonical serialization version for proof containers.
pub const PROOF_FORMAT_VERSION: u16 = 1;
/// Circuit tag for the ledger-transition statement.
pub const TRANSITION_CIRCUIT: &str = "ledger-transition";

const COMMIT_DOMAIN: &[u8] = b"coda-transition-proof";

pub fn canonical_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_little_endian()
}

/// Public input of the ledger-transition statement: applying the committed
/// transactions to the source ledger yields the target ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionStatement {
    pub source: LedgerHash,
    pub target: LedgerHash,
    pub transaction_commitment: [u8; 32],
}

impl TransitionStatement {
    pub fn new(source: LedgerHash, target: LedgerHash, transactions: &[SignedTransaction]) -> Self {
        Self {
            source,
            target,
            transaction_commitment: transaction_commitment(transactions),
        }
    }

    pub fn canonical_bytes(&self) -> ChainResult<Vec<u8>> {
        canonical_options()
            .serialize(self)
            .map_err(ChainError::Serialization)
    }
}

pub fn transaction_commitment(transactions: &[SignedTransaction]) -> [u8; 32] {
    let mut data = Vec::with_capacity(32 * transactions.len() + 16);
    data.extend_from_slice(b"coda-tx-commitment");
    for tx in transactions {
        data.extend_from_slice(&tx.hash());
    }
    digest(&data)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofHeader {
    pub version: u16,
    pub circuit: String,
}

impl ProofHeader {
    pub fn new(circuit: impl Into<String>) -> Self {
        Self {
            version: PROOF_FORMAT_VERSION,
            circuit: circuit.into(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBytes(pub Vec<u8>);

impl fmt::Debug for ProofBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProofBytes(len={})", self.0.len())
    }
}

impl ProofBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Serialize, Deserialize)]
struct ProofEnvelope {
    header: ProofHeader,
    commitment: [u8; 32],
}

/// Contract of the proving system collaborator. Implementations must not
/// return `Ok` proofs that fail their own `verify_transition`.
pub trait ProofBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn prove_transition(&self, statement: &TransitionStatement) -> ChainResult<ProofBytes>;

    fn verify_transition(
        &self,
        statement: &TransitionStatement,
        proof: &ProofBytes,
    ) -> ChainResult<bool>;
}

/// Deterministic commitment backend: the proof binds the exact statement and
/// nothing else. Stands in for the zero-knowledge prover, whose circuit is out
/// of scope here.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashCommitBackend;

impl HashCommitBackend {
    fn commitment(statement: &TransitionStatement) -> ChainResult<[u8; 32]> {
        let mut data = Vec::new();
        data.extend_from_slice(COMMIT_DOMAIN);
        data.extend_from_slice(&statement.canonical_bytes()?);
        Ok(digest(&data))
    }
}

impl ProofBackend for HashCommitBackend {
    fn name(&self) -> &'static str {
        "hash-commit"
    }

    fn prove_transition(&self, statement: &TransitionStatement) -> ChainResult<ProofBytes> {
        let envelope = ProofEnvelope {
            header: ProofHeader::new(TRANSITION_CIRCUIT),
            commitment: Self::commitment(statement)?,
        };
        let bytes = canonical_options()
            .serialize(&envelope)
            .map_err(ChainError::Serialization)?;
        Ok(ProofBytes(bytes))
    }

    fn verify_transition(
        &self,
        statement: &TransitionStatement,
        proof: &ProofBytes,
    ) -> ChainResult<bool> {
        let envelope: ProofEnvelope = canonical_options()
            .deserialize(proof.as_slice())
            .map_err(ChainError::Serialization)?;
        if envelope.header.version != PROOF_FORMAT_VERSION {
            return Err(ChainError::InvalidProof(format!(
                "unsupported proof version {}",
                envelope.header.version
            )));
        }
        if envelope.header.circuit != TRANSITION_CIRCUIT {
            return Err(ChainError::InvalidProof(format!(
                "unexpected circuit `{}`",
                envelope.header.circuit
            )));
        }
        Ok(envelope.commitment == Self::commitment(statement)?)
    }
}
