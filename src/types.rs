use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use malachite::base::num::arithmetic::traits::DivRem;
use malachite::Natural;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Window below which consecutive headers are considered "fast" and the
/// difficulty target tightens. Mirrors a 2x headroom over the expected block
/// cadence.
pub const RETARGET_WINDOW_MS: u64 = 10_000;

/// Retarget step as a right-shift of the current threshold (1/2048 per block).
const RETARGET_SHIFT: u64 = 11;

const HASH_BITS: usize = 256;

pub fn natural_from_bytes(bytes: &[u8]) -> Natural {
    let mut value = Natural::from(0u32);
    for byte in bytes {
        value *= Natural::from(256u32);
        value += Natural::from(*byte);
    }
    value
}

pub fn natural_to_bytes(value: &Natural) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut rest = value.clone();
    for slot in out.iter_mut().rev() {
        let (quotient, remainder) = rest.div_rem(Natural::from(256u32));
        *slot = u64::try_from(&remainder).unwrap_or_default() as u8;
        rest = quotient;
    }
    out
}

fn max_target() -> Natural {
    (Natural::from(1u32) << (HASH_BITS as u64)) - Natural::from(1u32)
}

/// Opaque search counter for the header nonce space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub u64);

impl Nonce {
    pub fn random() -> Self {
        Nonce(rand::thread_rng().gen())
    }

    pub fn succ(self) -> Self {
        Nonce(self.0.wrapping_add(1))
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Wall-clock instant in milliseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockTime(u64);

impl BlockTime {
    pub fn now() -> Self {
        BlockTime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn from_millis(millis: u64) -> Self {
        BlockTime(millis)
    }

    pub fn millis(self) -> u64 {
        self.0
    }

    pub fn saturating_elapsed_since(self, earlier: BlockTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for BlockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A threshold target: a header digest meets the difficulty iff its numeric
/// value does not exceed the threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Difficulty {
    threshold: Natural,
}

impl Difficulty {
    /// Accepts every digest.
    pub fn easiest() -> Self {
        Difficulty {
            threshold: max_target(),
        }
    }

    /// Accepts only the all-zero digest; the practical "unsolvable" target.
    pub fn hardest() -> Self {
        Difficulty {
            threshold: Natural::from(0u32),
        }
    }

    pub fn from_threshold(threshold: Natural) -> Self {
        let cap = max_target();
        Difficulty {
            threshold: if threshold > cap { cap } else { threshold },
        }
    }

    pub fn threshold(&self) -> &Natural {
        &self.threshold
    }

    pub fn meets(&self, digest: &[u8; 32]) -> bool {
        natural_from_bytes(digest) <= self.threshold
    }

    /// Derives the next target from this one and the observed block spacing.
    /// Fast blocks tighten the target by one retarget step, slow blocks relax
    /// it, clamped to the digest domain.
    pub fn next(&self, last: BlockTime, this: BlockTime) -> Difficulty {
        let elapsed = this.saturating_elapsed_since(last);
        let step = self.threshold.clone() >> RETARGET_SHIFT;
        let threshold = if elapsed < RETARGET_WINDOW_MS {
            let lowered = &self.threshold - &step;
            if lowered == Natural::from(0u32) {
                Natural::from(1u32)
            } else {
                lowered
            }
        } else {
            let raised = &self.threshold + &step;
            let cap = max_target();
            if raised > cap {
                cap
            } else {
                raised
            }
        };
        Difficulty { threshold }
    }

    /// Expected number of digest trials implied by this target. Always >= 1 so
    /// that strength strictly increases along a chain.
    pub fn work(&self) -> Natural {
        max_target() / (&self.threshold + Natural::from(1u32)) + Natural::from(1u32)
    }

    pub fn to_bits(&self, out: &mut Vec<bool>) {
        bits_of_bytes(&natural_to_bytes(&self.threshold), out);
    }
}

/// Monotone accumulator of the work along a chain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Strength(Natural);

impl Strength {
    pub fn zero() -> Self {
        Strength(Natural::from(0u32))
    }

    pub fn increase(&self, difficulty: &Difficulty) -> Strength {
        Strength(&self.0 + difficulty.work())
    }

    pub fn to_bits(&self, out: &mut Vec<bool>) {
        bits_of_bytes(&natural_to_bytes(&self.0), out);
    }
}

/// Content hash of the account ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerHash(pub [u8; 32]);

impl LedgerHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for LedgerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LedgerHash({})", self.to_hex())
    }
}

impl fmt::Display for LedgerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash of a protocol state; the parent link between blocks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateHash(pub [u8; 32]);

impl StateHash {
    pub fn zero() -> Self {
        StateHash([0u8; 32])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({})", self.to_hex())
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub fn bits_of_u64(value: u64, out: &mut Vec<bool>) {
    for shift in 0..64 {
        out.push(value >> shift & 1 == 1);
    }
}

pub fn bits_of_bytes(bytes: &[u8], out: &mut Vec<bool>) {
    for byte in bytes {
        for shift in 0..8 {
            out.push(byte >> shift & 1 == 1);
        }
    }
}

/// Folds `f` over exactly `triples * 3` booleans: the canonical bits of the
/// value, zero-padded up to the fixed triple width.
pub fn fold_triples<A, F>(bits: &[bool], triples: usize, init: A, mut f: F) -> A
where
    F: FnMut(A, bool) -> A,
{
    let width = triples * 3;
    debug_assert!(bits.len() <= width, "bit encoding exceeds its triple width");
    let mut acc = init;
    for index in 0..width {
        acc = f(acc, bits.get(index).copied().unwrap_or(false));
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_byte_roundtrip() {
        let value = natural_from_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        let bytes = natural_to_bytes(&value);
        assert_eq!(&bytes[28..], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(natural_from_bytes(&bytes), value);
    }

    #[test]
    fn easiest_accepts_everything() {
        let difficulty = Difficulty::easiest();
        assert!(difficulty.meets(&[0xff; 32]));
        assert!(difficulty.meets(&[0x00; 32]));
    }

    #[test]
    fn hardest_rejects_nonzero_digests() {
        let difficulty = Difficulty::hardest();
        assert!(!difficulty.meets(&[0x01; 32]));
        assert!(difficulty.meets(&[0x00; 32]));
    }

    #[test]
    fn fast_blocks_tighten_the_target() {
        let difficulty = Difficulty::easiest();
        let tightened = difficulty.next(BlockTime::from_millis(0), BlockTime::from_millis(100));
        assert!(tightened.threshold() < difficulty.threshold());
        let relaxed = tightened.next(
            BlockTime::from_millis(0),
            BlockTime::from_millis(RETARGET_WINDOW_MS * 2),
        );
        assert!(relaxed.threshold() > tightened.threshold());
    }

    #[test]
    fn retarget_never_reaches_zero() {
        let mut difficulty = Difficulty::from_threshold(Natural::from(1u32));
        for _ in 0..8 {
            difficulty = difficulty.next(BlockTime::from_millis(0), BlockTime::from_millis(1));
            assert!(difficulty.threshold() >= &Natural::from(1u32));
        }
    }

    #[test]
    fn strength_strictly_increases() {
        let strength = Strength::zero();
        let hard = Strength::zero().increase(&Difficulty::hardest());
        let easy = Strength::zero().increase(&Difficulty::easiest());
        assert!(hard > strength);
        assert!(easy > strength);
        assert!(hard > easy);
    }

    #[test]
    fn nonce_successor_wraps() {
        assert_eq!(Nonce(u64::MAX).succ(), Nonce(0));
        assert_eq!(Nonce(41).succ(), Nonce(42));
    }

    #[test]
    fn fold_visits_exactly_the_triple_width() {
        let bits = vec![true, false, true];
        let visited = fold_triples(&bits, 2, 0usize, |count, _| count + 1);
        assert_eq!(visited, 6);
        let ones = fold_triples(&bits, 2, 0usize, |count, bit| count + bit as usize);
        assert_eq!(ones, 2);
    }
}
