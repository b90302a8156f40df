use std::cmp::Ordering;
use std::time::Duration;

use ed25519_dalek::{Keypair, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SignatureParameters;
use crate::crypto::{
    public_key_from_hex, public_key_to_hex, sign_message, signature_from_hex, signature_to_hex,
    verify_signature,
};
use crate::ledger::{Ledger, SignedTransaction};
use crate::types::{
    bits_of_bytes, bits_of_u64, BlockTime, Difficulty, LedgerHash, StateHash, Strength,
};

use super::checked::ConstraintSystem;
use super::{
    BlockchainState, Candidate, Choice, ConsensusMechanism, ConsensusState, ProtocolState,
    SnarkTransition,
};

/// 64-bit length + timestamp, 256-bit difficulty, parent hash, ledger hash and
/// strength: 1152 bits, an exact triple width.
const SIGNATURE_STATE_TRIPLES: usize = 384;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureState {
    pub length: u64,
    pub next_difficulty: Difficulty,
    pub previous_state_hash: StateHash,
    pub ledger_hash: LedgerHash,
    pub strength: Strength,
    pub timestamp: BlockTime,
}

impl ConsensusState for SignatureState {
    fn length_in_triples() -> usize {
        SIGNATURE_STATE_TRIPLES
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn next_difficulty(&self) -> &Difficulty {
        &self.next_difficulty
    }

    fn strength(&self) -> &Strength {
        &self.strength
    }

    fn timestamp(&self) -> BlockTime {
        self.timestamp
    }

    fn ledger_hash(&self) -> &LedgerHash {
        &self.ledger_hash
    }

    fn previous_state_hash(&self) -> &StateHash {
        &self.previous_state_hash
    }

    fn to_bits(&self) -> Vec<bool> {
        let mut bits = Vec::with_capacity(SIGNATURE_STATE_TRIPLES * 3);
        bits_of_u64(self.length, &mut bits);
        self.next_difficulty.to_bits(&mut bits);
        bits_of_bytes(&self.previous_state_hash.0, &mut bits);
        bits_of_bytes(&self.ledger_hash.0, &mut bits);
        self.strength.to_bits(&mut bits);
        bits_of_u64(self.timestamp.millis(), &mut bits);
        bits
    }
}

/// The proposer's signature over the parent link and blockchain state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureData {
    pub public_key: String,
    pub signature: String,
}

impl SignatureData {
    pub fn sign(
        keypair: &Keypair,
        previous_state_hash: &StateHash,
        blockchain_state: &BlockchainState,
    ) -> Self {
        let message = blockchain_state.message_bytes(previous_state_hash);
        Self {
            public_key: public_key_to_hex(&keypair.public),
            signature: signature_to_hex(&sign_message(keypair, &message)),
        }
    }

    fn verify(
        &self,
        designated: &PublicKey,
        previous_state_hash: &StateHash,
        blockchain_state: &BlockchainState,
    ) -> bool {
        let Ok(public_key) = public_key_from_hex(&self.public_key) else {
            return false;
        };
        if public_key != *designated {
            return false;
        }
        let Ok(signature) = signature_from_hex(&self.signature) else {
            return false;
        };
        let message = blockchain_state.message_bytes(previous_state_hash);
        verify_signature(&public_key, &message, &signature).is_ok()
    }
}

/// Proof-of-signature: block production is fixed to the holder of a designated
/// signing key, throttled by the proposal interval. Fork choice is by chain
/// strength with the earlier-received side winning ties.
pub struct ProofOfSignature {
    designated_signer: PublicKey,
    proposal_interval: Duration,
    genesis_ledger_hash: LedgerHash,
    genesis_timestamp: BlockTime,
    initial_difficulty: Difficulty,
}

impl ProofOfSignature {
    pub fn new(
        designated_signer: PublicKey,
        params: SignatureParameters,
        genesis_ledger_hash: LedgerHash,
        genesis_timestamp: BlockTime,
    ) -> Self {
        Self {
            designated_signer,
            proposal_interval: params.proposal_interval,
            genesis_ledger_hash,
            genesis_timestamp,
            initial_difficulty: Difficulty::easiest(),
        }
    }

    pub fn with_initial_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.initial_difficulty = difficulty;
        self
    }

    pub fn designated_signer(&self) -> &PublicKey {
        &self.designated_signer
    }
}

impl ConsensusMechanism for ProofOfSignature {
    type State = SignatureState;
    type TransitionData = SignatureData;
    type LocalState = ();

    fn name(&self) -> &'static str {
        "proof_of_signature"
    }

    fn genesis_protocol_state(&self) -> ProtocolState<SignatureState> {
        ProtocolState {
            previous_state_hash: StateHash::zero(),
            blockchain_state: BlockchainState::genesis(
                self.genesis_ledger_hash,
                self.genesis_timestamp,
            ),
            consensus_state: SignatureState {
                length: 0,
                next_difficulty: self.initial_difficulty.clone(),
                previous_state_hash: StateHash::zero(),
                ledger_hash: self.genesis_ledger_hash,
                strength: Strength::zero(),
                timestamp: self.genesis_timestamp,
            },
        }
    }

    fn advance_header(
        &self,
        prev: &SignatureState,
        previous_state_hash: StateHash,
        ledger_hash: LedgerHash,
        timestamp: BlockTime,
    ) -> SignatureState {
        SignatureState {
            length: prev.length.saturating_add(1),
            next_difficulty: prev.next_difficulty.next(prev.timestamp, timestamp),
            previous_state_hash,
            ledger_hash,
            strength: prev.strength.increase(&prev.next_difficulty),
            timestamp,
        }
    }

    fn generate_transition(
        &self,
        prev: &ProtocolState<SignatureState>,
        blockchain_state: &BlockchainState,
        _local_state: &(),
        time: BlockTime,
        keypair: &Keypair,
        _transactions: &[SignedTransaction],
    ) -> Option<(ProtocolState<SignatureState>, SignatureData)> {
        if keypair.public != self.designated_signer {
            debug!(target: "consensus", "keypair is not the designated signer");
            return None;
        }
        let elapsed = time.saturating_elapsed_since(prev.consensus_state.timestamp);
        if elapsed < self.proposal_interval.as_millis() as u64 {
            debug!(
                target: "consensus",
                elapsed_ms = elapsed,
                "proposal interval has not elapsed"
            );
            return None;
        }
        let previous_state_hash = prev.hash();
        let consensus_state = self.advance_header(
            &prev.consensus_state,
            previous_state_hash,
            blockchain_state.ledger_hash,
            time,
        );
        let data = SignatureData::sign(keypair, &previous_state_hash, blockchain_state);
        Some((
            ProtocolState {
                previous_state_hash,
                blockchain_state: blockchain_state.clone(),
                consensus_state,
            },
            data,
        ))
    }

    fn next_state(
        &self,
        prev: &SignatureState,
        previous_state_hash: &StateHash,
        transition: &SnarkTransition<SignatureData>,
    ) -> SignatureState {
        self.advance_header(
            prev,
            *previous_state_hash,
            transition.blockchain_state.ledger_hash,
            transition.blockchain_state.timestamp,
        )
    }

    fn next_state_checked(
        &self,
        cs: &mut ConstraintSystem,
        prev: &SignatureState,
        previous_state_hash: &StateHash,
        transition: &SnarkTransition<SignatureData>,
    ) -> SignatureState {
        let timestamp = transition.blockchain_state.timestamp;
        let state = SignatureState {
            length: prev.length.saturating_add(1),
            next_difficulty: prev.next_difficulty.next(prev.timestamp, timestamp),
            previous_state_hash: *previous_state_hash,
            ledger_hash: transition.blockchain_state.ledger_hash,
            strength: prev.strength.increase(&prev.next_difficulty),
            timestamp,
        };
        cs.enforce_eq("length-increment", &state.length, &(prev.length.saturating_add(1)));
        cs.enforce_eq("parent-link", &state.previous_state_hash, previous_state_hash);
        cs.enforce_eq(
            "ledger-hash",
            &state.ledger_hash,
            &transition.blockchain_state.ledger_hash,
        );
        cs.enforce("timestamp-monotone", state.timestamp >= prev.timestamp);
        cs.enforce("strength-increases", state.strength > prev.strength);
        state
    }

    fn is_transition_valid(
        &self,
        prev: &ProtocolState<SignatureState>,
        transition: &SnarkTransition<SignatureData>,
    ) -> bool {
        transition.consensus_data.verify(
            &self.designated_signer,
            &prev.hash(),
            &transition.blockchain_state,
        )
    }

    fn is_transition_valid_checked(
        &self,
        cs: &mut ConstraintSystem,
        prev: &ProtocolState<SignatureState>,
        transition: &SnarkTransition<SignatureData>,
    ) -> bool {
        cs.enforce(
            "proposer-signature",
            transition.consensus_data.verify(
                &self.designated_signer,
                &prev.hash(),
                &transition.blockchain_state,
            ),
        )
    }

    fn select(
        &self,
        existing: Candidate<'_, SignatureState>,
        candidate: Candidate<'_, SignatureState>,
    ) -> Choice {
        match candidate.state.strength.cmp(&existing.state.strength) {
            Ordering::Greater => Choice::Take,
            Ordering::Less => Choice::Keep,
            Ordering::Equal => {
                if candidate.received_at < existing.received_at {
                    Choice::Take
                } else {
                    Choice::Keep
                }
            }
        }
    }

    fn lock_transition(
        &self,
        old: &SignatureState,
        new: &SignatureState,
        _snarked_ledger: &Ledger,
        _local_state: &mut (),
    ) {
        debug!(
            target: "consensus",
            old_length = old.length,
            new_length = new.length,
            "locked tip advanced"
        );
    }
}
