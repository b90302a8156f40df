use std::env;
use std::time::Duration;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::BlockTime;

pub const CONSENSUS_MECHANISM_VAR: &str = "CODA_CONSENSUS_MECHANISM";
pub const PROPOSAL_INTERVAL_VAR: &str = "CODA_PROPOSAL_INTERVAL";
pub const SLOT_INTERVAL_VAR: &str = "CODA_SLOT_INTERVAL";
pub const UNFORKABLE_TRANSITION_COUNT_VAR: &str = "CODA_UNFORKABLE_TRANSITION_COUNT";
pub const PROBABLE_SLOTS_PER_TRANSITION_COUNT_VAR: &str =
    "CODA_PROBABLE_SLOTS_PER_TRANSITION_COUNT";
pub const EXPECTED_NETWORK_DELAY_VAR: &str = "CODA_EXPECTED_NETWORK_DELAY";
pub const APPROXIMATE_NETWORK_DIAMETER_VAR: &str = "CODA_APPROXIMATE_NETWORK_DIAMETER";
pub const GENESIS_STATE_TIMESTAMP_VAR: &str = "CODA_GENESIS_STATE_TIMESTAMP";
pub const COINBASE_VAR: &str = "CODA_COINBASE";

const DEFAULT_PROPOSAL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_SLOT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_UNFORKABLE_TRANSITION_COUNT: u64 = 4;
const DEFAULT_PROBABLE_SLOTS_PER_TRANSITION_COUNT: u64 = 8;
const DEFAULT_EXPECTED_NETWORK_DELAY_MS: u64 = 2_000;
const DEFAULT_APPROXIMATE_NETWORK_DIAMETER: u64 = 3;
const DEFAULT_COINBASE: u64 = 20;

fn raw_var(name: &'static str) -> ChainResult<Option<String>> {
    match env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ChainError::Config(format!(
            "{name}: value is not valid unicode"
        ))),
    }
}

fn u64_var(name: &'static str, default: u64) -> ChainResult<u64> {
    match raw_var(name)? {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err| {
            ChainError::Config(format!("{name}: invalid integer `{raw}`: {err}"))
        }),
    }
}

fn millis_var(name: &'static str, default_ms: u64) -> ChainResult<Duration> {
    Ok(Duration::from_millis(u64_var(name, default_ms)?))
}

fn timestamp_var(name: &'static str) -> ChainResult<BlockTime> {
    match raw_var(name)? {
        None => Ok(BlockTime::from_millis(0)),
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw.trim()).map_err(|err| {
                ChainError::Config(format!("{name}: invalid RFC 3339 date-time `{raw}`: {err}"))
            })?;
            Ok(BlockTime::from_millis(parsed.timestamp_millis().max(0) as u64))
        }
    }
}

/// Genesis wall-clock origin shared by both variants; epoch start when unset.
pub fn genesis_timestamp_from_env() -> ChainResult<BlockTime> {
    timestamp_var(GENESIS_STATE_TIMESTAMP_VAR)
}

/// Which consensus variant the node runs. Selected once at startup; there is
/// no default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MechanismKind {
    ProofOfSignature,
    ProofOfStake,
}

impl MechanismKind {
    pub fn from_env() -> ChainResult<Self> {
        let raw = raw_var(CONSENSUS_MECHANISM_VAR)?.ok_or_else(|| {
            ChainError::Config(format!("{CONSENSUS_MECHANISM_VAR}: variable is required"))
        })?;
        match raw.trim() {
            "PROOF_OF_SIGNATURE" => Ok(MechanismKind::ProofOfSignature),
            "PROOF_OF_STAKE" => Ok(MechanismKind::ProofOfStake),
            other => Err(ChainError::Config(format!(
                "{CONSENSUS_MECHANISM_VAR}: unrecognized mechanism `{other}` \
                 (expected PROOF_OF_SIGNATURE or PROOF_OF_STAKE)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureParameters {
    pub proposal_interval: Duration,
}

impl SignatureParameters {
    pub fn from_env() -> ChainResult<Self> {
        Ok(Self {
            proposal_interval: millis_var(PROPOSAL_INTERVAL_VAR, DEFAULT_PROPOSAL_INTERVAL_MS)?,
        })
    }
}

impl Default for SignatureParameters {
    fn default() -> Self {
        Self {
            proposal_interval: Duration::from_millis(DEFAULT_PROPOSAL_INTERVAL_MS),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StakeParameters {
    pub slot_interval: Duration,
    pub unforkable_transition_count: u64,
    pub probable_slots_per_transition_count: u64,
    pub expected_network_delay: Duration,
    pub approximate_network_diameter: u64,
    pub genesis_state_timestamp: BlockTime,
    pub coinbase: u64,
}

impl StakeParameters {
    pub fn from_env() -> ChainResult<Self> {
        let params = Self {
            slot_interval: millis_var(SLOT_INTERVAL_VAR, DEFAULT_SLOT_INTERVAL_MS)?,
            unforkable_transition_count: u64_var(
                UNFORKABLE_TRANSITION_COUNT_VAR,
                DEFAULT_UNFORKABLE_TRANSITION_COUNT,
            )?,
            probable_slots_per_transition_count: u64_var(
                PROBABLE_SLOTS_PER_TRANSITION_COUNT_VAR,
                DEFAULT_PROBABLE_SLOTS_PER_TRANSITION_COUNT,
            )?,
            expected_network_delay: millis_var(
                EXPECTED_NETWORK_DELAY_VAR,
                DEFAULT_EXPECTED_NETWORK_DELAY_MS,
            )?,
            approximate_network_diameter: u64_var(
                APPROXIMATE_NETWORK_DIAMETER_VAR,
                DEFAULT_APPROXIMATE_NETWORK_DIAMETER,
            )?,
            genesis_state_timestamp: timestamp_var(GENESIS_STATE_TIMESTAMP_VAR)?,
            coinbase: u64_var(COINBASE_VAR, DEFAULT_COINBASE)?,
        };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> ChainResult<()> {
        if self.slot_interval.is_zero() {
            return Err(ChainError::Config(format!(
                "{SLOT_INTERVAL_VAR}: slot interval must be positive"
            )));
        }
        if self.unforkable_transition_count == 0 {
            return Err(ChainError::Config(format!(
                "{UNFORKABLE_TRANSITION_COUNT_VAR}: must be positive"
            )));
        }
        if self.probable_slots_per_transition_count == 0 {
            return Err(ChainError::Config(format!(
                "{PROBABLE_SLOTS_PER_TRANSITION_COUNT_VAR}: must be positive"
            )));
        }
        Ok(())
    }

    /// Slots per epoch.
    pub fn epoch_length_slots(&self) -> u64 {
        self.probable_slots_per_transition_count * self.unforkable_transition_count
    }

    /// Worst-case propagation time across the network; the tolerated timestamp
    /// slack when judging a transition's claimed slot.
    pub fn network_window(&self) -> Duration {
        self.expected_network_delay * self.approximate_network_diameter as u32
    }

    pub fn slot_of(&self, time: BlockTime) -> u64 {
        let interval = self.slot_interval.as_millis() as u64;
        time.saturating_elapsed_since(self.genesis_state_timestamp) / interval.max(1)
    }

    pub fn epoch_of_slot(&self, slot: u64) -> u64 {
        slot / self.epoch_length_slots().max(1)
    }

    pub fn slot_start(&self, slot: u64) -> BlockTime {
        let interval = self.slot_interval.as_millis() as u64;
        BlockTime::from_millis(
            self.genesis_state_timestamp
                .millis()
                .saturating_add(slot.saturating_mul(interval)),
        )
    }
}

impl Default for StakeParameters {
    fn default() -> Self {
        Self {
            slot_interval: Duration::from_millis(DEFAULT_SLOT_INTERVAL_MS),
            unforkable_transition_count: DEFAULT_UNFORKABLE_TRANSITION_COUNT,
            probable_slots_per_transition_count: DEFAULT_PROBABLE_SLOTS_PER_TRANSITION_COUNT,
            expected_network_delay: Duration::from_millis(DEFAULT_EXPECTED_NETWORK_DELAY_MS),
            approximate_network_diameter: DEFAULT_APPROXIMATE_NETWORK_DIAMETER,
            genesis_state_timestamp: BlockTime::from_millis(0),
            coinbase: DEFAULT_COINBASE,
        }
    }
}
