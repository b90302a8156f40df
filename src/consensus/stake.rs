use std::cmp::Ordering;
use std::collections::BTreeMap;

use ed25519_dalek::Keypair;
use malachite::Natural;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::StakeParameters;
use crate::crypto::{
    address_from_public_key, digest, evaluate_vrf, public_key_from_hex, public_key_to_hex,
    verify_vrf, VrfOutput,
};
use crate::ledger::{Address, Ledger, SignedTransaction};
use crate::types::{
    bits_of_bytes, bits_of_u64, BlockTime, Difficulty, LedgerHash, StateHash, Strength,
};

use super::checked::ConstraintSystem;
use super::{
    BlockchainState, Candidate, Choice, ConsensusMechanism, ConsensusState, ProtocolState,
    SnarkTransition,
};

/// Five 64-bit fields plus seven 256-bit fields: 2112 bits, an exact triple
/// width.
const STAKE_STATE_TRIPLES: usize = 704;

const EPOCH_SEED_DOMAIN: &[u8] = b"coda-epoch-seed";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StakeState {
    pub length: u64,
    pub epoch: u64,
    pub slot: u64,
    pub total_currency: u64,
    pub epoch_seed: [u8; 32],
    pub last_vrf_output: VrfOutput,
    /// Parent hash of the first block of this state's epoch; the carried
    /// checkpoint cross-epoch fork choice keys on.
    pub epoch_lock: StateHash,
    pub next_difficulty: Difficulty,
    pub previous_state_hash: StateHash,
    pub ledger_hash: LedgerHash,
    pub strength: Strength,
    pub timestamp: BlockTime,
}

impl ConsensusState for StakeState {
    fn length_in_triples() -> usize {
        STAKE_STATE_TRIPLES
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
        let mut bits = Vec::with_capacity(STAKE_STATE_TRIPLES * 3);
        bits_of_u64(self.length, &mut bits);
        bits_of_u64(self.epoch, &mut bits);
        bits_of_u64(self.slot, &mut bits);
        bits_of_u64(self.total_currency, &mut bits);
        bits_of_bytes(&self.epoch_seed, &mut bits);
        bits_of_bytes(&self.last_vrf_output.0, &mut bits);
        bits_of_bytes(&self.epoch_lock.0, &mut bits);
        self.next_difficulty.to_bits(&mut bits);
        bits_of_bytes(&self.previous_state_hash.0, &mut bits);
        bits_of_bytes(&self.ledger_hash.0, &mut bits);
        self.strength.to_bits(&mut bits);
        bits_of_u64(self.timestamp.millis(), &mut bits);
        bits
    }
}

/// Slot evidence attached to a stake-variant block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StakeData {
    pub slot: u64,
    pub vrf_output: VrfOutput,
    pub public_key: String,
    pub stake: u64,
}

/// Variant-local cache: the epoch seed and the stake distribution frozen at
/// the last epoch boundary the locked tip crossed.
#[derive(Clone, Debug)]
pub struct StakeLocalState {
    pub epoch: u64,
    pub epoch_seed: [u8; 32],
    pub stake_distribution: BTreeMap<Address, u64>,
    pub total_currency: u64,
}

impl StakeLocalState {
    pub fn genesis(genesis_ledger: &Ledger) -> Self {
        Self {
            epoch: 0,
            epoch_seed: genesis_epoch_seed(&genesis_ledger.hash()),
            stake_distribution: genesis_ledger.stake_distribution(),
            total_currency: genesis_ledger.total_currency(),
        }
    }

    pub fn stake_of(&self, address: &str) -> u64 {
        self.stake_distribution
            .get(address)
            .copied()
            .unwrap_or_default()
    }
}

fn genesis_epoch_seed(genesis_ledger_hash: &LedgerHash) -> [u8; 32] {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(EPOCH_SEED_DOMAIN);
    data.extend_from_slice(&genesis_ledger_hash.0);
    digest(&data)
}

fn next_epoch_seed(prev: &StakeState, epoch: u64) -> [u8; 32] {
    let mut data = Vec::with_capacity(64 + 8);
    data.extend_from_slice(EPOCH_SEED_DOMAIN);
    data.extend_from_slice(&prev.last_vrf_output.0);
    data.extend_from_slice(&epoch.to_le_bytes());
    digest(&data)
}

/// Eligibility threshold: the VRF output, read as a fraction of the digest
/// domain, must be below the proposer's share of the total currency.
fn is_eligible(vrf_output: &VrfOutput, stake: u64, total_currency: u64) -> bool {
    if stake == 0 || total_currency == 0 {
        return false;
    }
    vrf_output.randomness() * Natural::from(total_currency)
        < Natural::from(stake) << 256u64
}

/// Proof-of-stake: slot-based VRF leader election over a frozen per-epoch
/// stake distribution, with the chain-length ladder for fork choice.
pub struct ProofOfStake {
    params: StakeParameters,
    genesis_ledger_hash: LedgerHash,
    genesis_total_currency: u64,
    initial_difficulty: Difficulty,
}

impl ProofOfStake {
    pub fn new(params: StakeParameters, genesis_ledger: &Ledger) -> Self {
        Self {
            params,
            genesis_ledger_hash: genesis_ledger.hash(),
            genesis_total_currency: genesis_ledger.total_currency(),
            initial_difficulty: Difficulty::easiest(),
        }
    }

    pub fn with_initial_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.initial_difficulty = difficulty;
        self
    }

    pub fn params(&self) -> &StakeParameters {
        &self.params
    }

    /// Seed under which a block at `slot` extending `prev` evaluates its VRF.
    fn seed_for(&self, prev: &StakeState, slot: u64) -> [u8; 32] {
        if self.params.epoch_of_slot(slot) == prev.epoch {
            prev.epoch_seed
        } else {
            next_epoch_seed(prev, self.params.epoch_of_slot(slot))
        }
    }

    fn successor(
        &self,
        prev: &StakeState,
        previous_state_hash: StateHash,
        ledger_hash: LedgerHash,
        slot: u64,
        vrf_output: VrfOutput,
        timestamp: BlockTime,
    ) -> StakeState {
        let epoch = self.params.epoch_of_slot(slot);
        let (epoch_seed, epoch_lock) = if epoch > prev.epoch {
            (next_epoch_seed(prev, epoch), previous_state_hash)
        } else {
            (prev.epoch_seed, prev.epoch_lock)
        };
        StakeState {
            length: prev.length.saturating_add(1),
            epoch,
            slot,
            total_currency: prev.total_currency,
            epoch_seed,
            last_vrf_output: vrf_output,
            epoch_lock,
            next_difficulty: prev.next_difficulty.next(prev.timestamp, timestamp),
            previous_state_hash,
            ledger_hash,
            strength: prev.strength.increase(&prev.next_difficulty),
            timestamp,
        }
    }

    /// Claimed timestamp must fall inside the claimed slot, stretched by the
    /// worst-case propagation window.
    fn timestamp_in_slot(&self, slot: u64, timestamp: BlockTime) -> bool {
        let start = self.params.slot_start(slot);
        let end = self.params.slot_start(slot.saturating_add(1));
        let slack = self.params.network_window().as_millis() as u64;
        timestamp >= start
            && timestamp.millis() < end.millis().saturating_add(slack)
    }

    fn ladder(
        &self,
        existing: Candidate<'_, StakeState>,
        candidate: Candidate<'_, StakeState>,
    ) -> Choice {
        let a = existing.state;
        let b = candidate.state;
        match b.length.cmp(&a.length) {
            Ordering::Greater => Choice::Take,
            Ordering::Less => Choice::Keep,
            Ordering::Equal => match b.strength.cmp(&a.strength) {
                Ordering::Greater => Choice::Take,
                Ordering::Less => Choice::Keep,
                Ordering::Equal => match b.last_vrf_output.0.cmp(&a.last_vrf_output.0) {
                    Ordering::Less => Choice::Take,
                    Ordering::Greater => Choice::Keep,
                    Ordering::Equal => {
                        if candidate.received_at < existing.received_at {
                            Choice::Take
                        } else {
                            Choice::Keep
                        }
                    }
                },
            },
        }
    }
}

impl ConsensusMechanism for ProofOfStake {
    type State = StakeState;
    type TransitionData = StakeData;
    type LocalState = StakeLocalState;

    fn name(&self) -> &'static str {
        "proof_of_stake"
    }

    fn genesis_protocol_state(&self) -> ProtocolState<StakeState> {
        let timestamp = self.params.genesis_state_timestamp;
        ProtocolState {
            previous_state_hash: StateHash::zero(),
            blockchain_state: BlockchainState::genesis(self.genesis_ledger_hash, timestamp),
            consensus_state: StakeState {
                length: 0,
                epoch: 0,
                slot: 0,
                total_currency: self.genesis_total_currency,
                epoch_seed: genesis_epoch_seed(&self.genesis_ledger_hash),
                last_vrf_output: VrfOutput([0u8; 32]),
                epoch_lock: StateHash::zero(),
                next_difficulty: self.initial_difficulty.clone(),
                previous_state_hash: StateHash::zero(),
                ledger_hash: self.genesis_ledger_hash,
                strength: Strength::zero(),
                timestamp,
            },
        }
    }

    fn advance_header(
        &self,
        prev: &StakeState,
        previous_state_hash: StateHash,
        ledger_hash: LedgerHash,
        timestamp: BlockTime,
    ) -> StakeState {
        let slot = self.params.slot_of(timestamp);
        self.successor(
            prev,
            previous_state_hash,
            ledger_hash,
            slot,
            prev.last_vrf_output.clone(),
            timestamp,
        )
    }

    fn generate_transition(
        &self,
        prev: &ProtocolState<StakeState>,
        blockchain_state: &BlockchainState,
        local_state: &StakeLocalState,
        time: BlockTime,
        keypair: &Keypair,
        _transactions: &[SignedTransaction],
    ) -> Option<(ProtocolState<StakeState>, StakeData)> {
        let slot = self.params.slot_of(time);
        if slot <= prev.consensus_state.slot {
            debug!(target: "consensus", slot, "slot has not advanced past the tip");
            return None;
        }
        let address = address_from_public_key(&keypair.public);
        let stake = local_state.stake_of(&address);
        if stake == 0 {
            debug!(target: "consensus", %address, "proposer has no stake");
            return None;
        }
        let seed = self.seed_for(&prev.consensus_state, slot);
        let vrf_output = evaluate_vrf(&seed, slot, &keypair.public, stake);
        if !is_eligible(&vrf_output, stake, local_state.total_currency) {
            debug!(target: "consensus", slot, "vrf output above the stake threshold");
            return None;
        }
        let previous_state_hash = prev.hash();
        let consensus_state = self.successor(
            &prev.consensus_state,
            previous_state_hash,
            blockchain_state.ledger_hash,
            slot,
            vrf_output.clone(),
            time,
        );
        let data = StakeData {
            slot,
            vrf_output,
            public_key: public_key_to_hex(&keypair.public),
            stake,
        };
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
        prev: &StakeState,
        previous_state_hash: &StateHash,
        transition: &SnarkTransition<StakeData>,
    ) -> StakeState {
        self.successor(
            prev,
            *previous_state_hash,
            transition.blockchain_state.ledger_hash,
            transition.consensus_data.slot,
            transition.consensus_data.vrf_output.clone(),
            transition.blockchain_state.timestamp,
        )
    }

    fn next_state_checked(
        &self,
        cs: &mut ConstraintSystem,
        prev: &StakeState,
        previous_state_hash: &StateHash,
        transition: &SnarkTransition<StakeData>,
    ) -> StakeState {
        let data = &transition.consensus_data;
        let timestamp = transition.blockchain_state.timestamp;
        let epoch = self.params.epoch_of_slot(data.slot);
        let (epoch_seed, epoch_lock) = if epoch > prev.epoch {
            (next_epoch_seed(prev, epoch), *previous_state_hash)
        } else {
            (prev.epoch_seed, prev.epoch_lock)
        };
        let state = StakeState {
            length: prev.length.saturating_add(1),
            epoch,
            slot: data.slot,
            total_currency: prev.total_currency,
            epoch_seed,
            last_vrf_output: data.vrf_output.clone(),
            epoch_lock,
            next_difficulty: prev.next_difficulty.next(prev.timestamp, timestamp),
            previous_state_hash: *previous_state_hash,
            ledger_hash: transition.blockchain_state.ledger_hash,
            strength: prev.strength.increase(&prev.next_difficulty),
            timestamp,
        };
        cs.enforce_eq("length-increment", &state.length, &prev.length.saturating_add(1));
        cs.enforce("slot-advances", state.slot > prev.slot);
        cs.enforce_eq("epoch-of-slot", &state.epoch, &self.params.epoch_of_slot(state.slot));
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
        prev: &ProtocolState<StakeState>,
        transition: &SnarkTransition<StakeData>,
    ) -> bool {
        let data = &transition.consensus_data;
        if data.slot <= prev.consensus_state.slot {
            return false;
        }
        if !self.timestamp_in_slot(data.slot, transition.blockchain_state.timestamp) {
            return false;
        }
        let Ok(public_key) = public_key_from_hex(&data.public_key) else {
            return false;
        };
        let seed = self.seed_for(&prev.consensus_state, data.slot);
        if !verify_vrf(&seed, data.slot, &public_key, data.stake, &data.vrf_output) {
            return false;
        }
        is_eligible(
            &data.vrf_output,
            data.stake,
            prev.consensus_state.total_currency,
        )
    }

    fn is_transition_valid_checked(
        &self,
        cs: &mut ConstraintSystem,
        prev: &ProtocolState<StakeState>,
        transition: &SnarkTransition<StakeData>,
    ) -> bool {
        let data = &transition.consensus_data;
        let mut holds = cs.enforce("slot-advances", data.slot > prev.consensus_state.slot);
        holds &= cs.enforce(
            "timestamp-in-slot",
            self.timestamp_in_slot(data.slot, transition.blockchain_state.timestamp),
        );
        let public_key = public_key_from_hex(&data.public_key);
        holds &= cs.enforce("proposer-key-decodes", public_key.is_ok());
        if let Ok(public_key) = public_key {
            let seed = self.seed_for(&prev.consensus_state, data.slot);
            holds &= cs.enforce(
                "vrf-recomputes",
                verify_vrf(&seed, data.slot, &public_key, data.stake, &data.vrf_output),
            );
        }
        holds &= cs.enforce(
            "stake-threshold",
            is_eligible(
                &data.vrf_output,
                data.stake,
                prev.consensus_state.total_currency,
            ),
        );
        holds
    }

    fn select(
        &self,
        existing: Candidate<'_, StakeState>,
        candidate: Candidate<'_, StakeState>,
    ) -> Choice {
        let a = existing.state;
        let b = candidate.state;
        if a == b {
            return Choice::Keep;
        }
        if a.epoch == b.epoch {
            return self.ladder(existing, candidate);
        }
        // Cross-epoch: a candidate whose epoch opened on the existing fork
        // carries the existing side's finalized history and supersedes it;
        // otherwise the shared ladder decides.
        if b.epoch > a.epoch && b.epoch_lock == a.previous_state_hash {
            return Choice::Take;
        }
        if a.epoch > b.epoch && a.epoch_lock == b.previous_state_hash {
            return Choice::Keep;
        }
        self.ladder(existing, candidate)
    }

    fn lock_transition(
        &self,
        old: &StakeState,
        new: &StakeState,
        snarked_ledger: &Ledger,
        local_state: &mut StakeLocalState,
    ) {
        if new.epoch <= local_state.epoch {
            return;
        }
        local_state.epoch = new.epoch;
        local_state.epoch_seed = new.epoch_seed;
        local_state.stake_distribution = snarked_ledger.stake_distribution();
        local_state.total_currency = snarked_ledger.total_currency();
        info!(
            target: "consensus",
            old_epoch = old.epoch,
            epoch = new.epoch,
            total_currency = local_state.total_currency,
            "froze stake distribution for new epoch"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::consensus::{decode_canonical, encode_canonical};
    use crate::crypto::generate_keypair;
    use crate::proofs::ProofBytes;
    use crate::types::natural_from_bytes;

    fn test_params() -> StakeParameters {
        StakeParameters {
            slot_interval: Duration::from_millis(1_000),
            unforkable_transition_count: 4,
            probable_slots_per_transition_count: 2,
            expected_network_delay: Duration::from_millis(500),
            approximate_network_diameter: 2,
            genesis_state_timestamp: BlockTime::from_millis(0),
            coinbase: 20,
        }
    }

    fn sole_staker() -> (Keypair, Ledger) {
        let keypair = generate_keypair();
        let address = address_from_public_key(&keypair.public);
        (keypair, Ledger::genesis([(address, 1_000u64)]))
    }

    #[test]
    fn sole_staker_is_always_eligible() {
        let (keypair, ledger) = sole_staker();
        let mechanism = ProofOfStake::new(test_params(), &ledger);
        let local = StakeLocalState::genesis(&ledger);
        let genesis = mechanism.genesis_protocol_state();
        let blockchain_state =
            BlockchainState::genesis(ledger.hash(), BlockTime::from_millis(3_100));
        let (state, data) = mechanism
            .generate_transition(
                &genesis,
                &blockchain_state,
                &local,
                BlockTime::from_millis(3_100),
                &keypair,
                &[],
            )
            .expect("sole staker holds every slot");
        assert_eq!(data.slot, 3);
        assert_eq!(state.consensus_state.slot, 3);
        assert_eq!(state.consensus_state.epoch, 0);
        let transition = SnarkTransition {
            blockchain_state,
            consensus_data: data,
            proof: ProofBytes(Vec::new()),
        };
        assert!(mechanism.is_transition_valid(&genesis, &transition));
        let mut cs = ConstraintSystem::new();
        assert!(mechanism.is_transition_valid_checked(&mut cs, &genesis, &transition));
        assert!(cs.is_satisfied());
    }

    #[test]
    fn zero_stake_participant_is_never_eligible() {
        let (_, ledger) = sole_staker();
        let outsider = generate_keypair();
        let mechanism = ProofOfStake::new(test_params(), &ledger);
        let local = StakeLocalState::genesis(&ledger);
        let genesis = mechanism.genesis_protocol_state();
        let blockchain_state =
            BlockchainState::genesis(ledger.hash(), BlockTime::from_millis(60_000));
        for slot_time in (1_100..20_000u64).step_by(1_000) {
            assert!(mechanism
                .generate_transition(
                    &genesis,
                    &blockchain_state,
                    &local,
                    BlockTime::from_millis(slot_time),
                    &outsider,
                    &[],
                )
                .is_none());
        }
    }

    #[test]
    fn stale_slot_is_rejected() {
        let (keypair, ledger) = sole_staker();
        let mechanism = ProofOfStake::new(test_params(), &ledger);
        let local = StakeLocalState::genesis(&ledger);
        let mut genesis = mechanism.genesis_protocol_state();
        genesis.consensus_state.slot = 5;
        let blockchain_state =
            BlockchainState::genesis(ledger.hash(), BlockTime::from_millis(5_500));
        assert!(mechanism
            .generate_transition(
                &genesis,
                &blockchain_state,
                &local,
                BlockTime::from_millis(5_500),
                &keypair,
                &[],
            )
            .is_none());
    }

    fn state_at(slot: u64, length: u64, vrf_byte: u8, params: &StakeParameters) -> StakeState {
        StakeState {
            length,
            epoch: params.epoch_of_slot(slot),
            slot,
            total_currency: 1_000,
            epoch_seed: [3u8; 32],
            last_vrf_output: VrfOutput([vrf_byte; 32]),
            epoch_lock: StateHash([4u8; 32]),
            next_difficulty: Difficulty::easiest(),
            previous_state_hash: StateHash([5u8; 32]),
            ledger_hash: LedgerHash([6u8; 32]),
            strength: Strength::zero().increase(&Difficulty::easiest()),
            timestamp: BlockTime::from_millis(slot * 1_000),
        }
    }

    #[test]
    fn same_epoch_select_prefers_longer_chains() {
        let (_, ledger) = sole_staker();
        let params = test_params();
        let mechanism = ProofOfStake::new(params.clone(), &ledger);
        let a = state_at(3, 100, 9, &params);
        let b = state_at(4, 101, 9, &params);
        assert_eq!(
            mechanism.select(
                Candidate::new(&a, BlockTime::from_millis(0)),
                Candidate::new(&b, BlockTime::from_millis(999_999)),
            ),
            Choice::Take
        );
        assert_eq!(
            mechanism.select(
                Candidate::new(&b, BlockTime::from_millis(999_999)),
                Candidate::new(&a, BlockTime::from_millis(0)),
            ),
            Choice::Keep
        );
    }

    #[test]
    fn same_epoch_ties_break_by_vrf_then_receipt() {
        let (_, ledger) = sole_staker();
        let params = test_params();
        let mechanism = ProofOfStake::new(params.clone(), &ledger);
        let a = state_at(3, 100, 9, &params);
        let smaller_vrf = state_at(3, 100, 1, &params);
        assert_eq!(
            mechanism.select(
                Candidate::new(&a, BlockTime::from_millis(0)),
                Candidate::new(&smaller_vrf, BlockTime::from_millis(0)),
            ),
            Choice::Take
        );
        let twin = a.clone();
        assert_eq!(
            mechanism.select(
                Candidate::new(&a, BlockTime::from_millis(10)),
                Candidate::new(&twin, BlockTime::from_millis(20)),
            ),
            Choice::Keep
        );
    }

    #[test]
    fn select_keeps_on_self_comparison() {
        let (_, ledger) = sole_staker();
        let params = test_params();
        let mechanism = ProofOfStake::new(params.clone(), &ledger);
        let state = state_at(3, 100, 9, &params);
        let candidate = Candidate::new(&state, BlockTime::from_millis(50));
        assert_eq!(mechanism.select(candidate, candidate), Choice::Keep);
    }

    #[test]
    fn cross_epoch_candidate_on_the_same_fork_wins() {
        let (_, ledger) = sole_staker();
        let params = test_params();
        let mechanism = ProofOfStake::new(params.clone(), &ledger);
        let epoch_len = params.epoch_length_slots();
        let a = state_at(3, 100, 9, &params);
        let mut b = state_at(epoch_len + 1, 90, 9, &params);
        // Candidate's epoch opened at the existing tip's parent.
        b.epoch_lock = a.previous_state_hash;
        assert_eq!(
            mechanism.select(
                Candidate::new(&a, BlockTime::from_millis(0)),
                Candidate::new(&b, BlockTime::from_millis(1)),
            ),
            Choice::Take
        );
        // Unrelated checkpoints fall back to the ladder (longer chain wins).
        let mut c = state_at(epoch_len + 1, 90, 9, &params);
        c.epoch_lock = StateHash([0xaa; 32]);
        assert_eq!(
            mechanism.select(
                Candidate::new(&a, BlockTime::from_millis(0)),
                Candidate::new(&c, BlockTime::from_millis(1)),
            ),
            Choice::Keep
        );
    }

    #[test]
    fn lock_transition_freezes_the_distribution_on_epoch_entry() {
        let (keypair, ledger) = sole_staker();
        let params = test_params();
        let mechanism = ProofOfStake::new(params.clone(), &ledger);
        let mut local = StakeLocalState::genesis(&ledger);
        let old = state_at(3, 100, 9, &params);
        let mut new = state_at(params.epoch_length_slots() + 1, 101, 9, &params);
        new.epoch_seed = [0x77; 32];
        let address = address_from_public_key(&keypair.public);
        let richer = Ledger::genesis([(address.clone(), 5_000u64)]);
        mechanism.lock_transition(&old, &new, &richer, &mut local);
        assert_eq!(local.epoch, new.epoch);
        assert_eq!(local.epoch_seed, [0x77; 32]);
        assert_eq!(local.total_currency, 5_000);
        assert_eq!(local.stake_of(&address), 5_000);
        // Same-epoch advances leave the frozen snapshot untouched.
        let before = local.clone();
        mechanism.lock_transition(&new, &new, &ledger, &mut local);
        assert_eq!(local.total_currency, before.total_currency);
    }

    #[test]
    fn state_encoding_roundtrips() {
        let params = test_params();
        let state = state_at(7, 42, 9, &params);
        let bytes = encode_canonical(&state).expect("encode");
        let decoded: StakeState = decode_canonical(&bytes).expect("decode");
        assert_eq!(decoded, state);
    }

    #[test]
    fn fold_visits_the_full_triple_width() {
        let params = test_params();
        let state = state_at(7, 42, 9, &params);
        let visited = state.fold(0usize, |count, _| count + 1);
        assert_eq!(visited, StakeState::length_in_triples() * 3);
        assert_eq!(state.to_bits().len(), StakeState::length_in_triples() * 3);
    }

    fn arb_state(params: StakeParameters) -> impl Strategy<Value = StakeState> {
        (
            0u64..1_000_000,
            0u64..50_000,
            proptest::array::uniform32(any::<u8>()),
            proptest::array::uniform32(any::<u8>()),
            proptest::array::uniform32(any::<u8>()),
            proptest::array::uniform32(any::<u8>()),
            0u64..u64::MAX / 4,
        )
            .prop_map(
                move |(length, slot, seed, vrf, threshold, hash, timestamp)| StakeState {
                    length,
                    epoch: params.epoch_of_slot(slot),
                    slot,
                    total_currency: 1_000,
                    epoch_seed: seed,
                    last_vrf_output: VrfOutput(vrf),
                    epoch_lock: StateHash(hash),
                    next_difficulty: Difficulty::from_threshold(natural_from_bytes(&threshold)),
                    previous_state_hash: StateHash(hash),
                    ledger_hash: LedgerHash(hash),
                    strength: Strength::zero().increase(&Difficulty::easiest()),
                    timestamp: BlockTime::from_millis(timestamp),
                },
            )
    }

    proptest! {
        #[test]
        fn checked_and_plain_transition_agree(
            prev in arb_state(test_params()),
            prev_hash in proptest::array::uniform32(any::<u8>()),
            ledger in proptest::array::uniform32(any::<u8>()),
            vrf in proptest::array::uniform32(any::<u8>()),
            slot_delta in 1u64..1_000,
            timestamp in 0u64..u64::MAX / 4,
        ) {
            let (_, genesis_ledger) = sole_staker();
            let mechanism = ProofOfStake::new(test_params(), &genesis_ledger);
            let previous_state_hash = StateHash(prev_hash);
            let transition = SnarkTransition {
                blockchain_state: BlockchainState::genesis(
                    LedgerHash(ledger),
                    BlockTime::from_millis(timestamp),
                ),
                consensus_data: StakeData {
                    slot: prev.slot + slot_delta,
                    vrf_output: VrfOutput(vrf),
                    public_key: "unused".into(),
                    stake: 1,
                },
                proof: ProofBytes(Vec::new()),
            };
            let plain = mechanism.next_state(&prev, &previous_state_hash, &transition);
            let mut cs = ConstraintSystem::new();
            let checked =
                mechanism.next_state_checked(&mut cs, &prev, &previous_state_hash, &transition);
            prop_assert_eq!(plain, checked);
            prop_assert!(cs.constraint_count() >= 7);
        }
    }
}
