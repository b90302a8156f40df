use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time;
use tracing::debug;

use crate::consensus::{header_digest, ConsensusMechanism, ConsensusState};
use crate::types::{BlockTime, LedgerHash, Nonce, StateHash};

/// Candidate nonces tried between cooperative pauses.
pub const NONCE_BATCH_SIZE: usize = 10;
/// Pause between batches; the worst-case cancellation latency is one batch
/// plus this pause.
pub const BATCH_PAUSE: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq)]
pub enum HashingOutcome<S> {
    Found { state: S, nonce: Nonce },
    Cancelled,
}

/// Nonce search over successor headers of the previous state. Runs as its own
/// task; memory use is independent of search duration.
pub struct HashingWorker<S> {
    cancel: watch::Sender<bool>,
    result_rx: oneshot::Receiver<HashingOutcome<S>>,
    resolved: Option<HashingOutcome<S>>,
}

impl<S: ConsensusState> HashingWorker<S> {
    pub fn spawn<M>(
        mechanism: Arc<M>,
        previous_state: S,
        previous_state_hash: StateHash,
        ledger_hash: LedgerHash,
    ) -> Self
    where
        M: ConsensusMechanism<State = S>,
    {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (result_tx, result_rx) = oneshot::channel();
        tokio::spawn(async move {
            let difficulty = previous_state.next_difficulty().clone();
            let mut nonce = Nonce::random();
            let outcome = 'search: loop {
                for _ in 0..NONCE_BATCH_SIZE {
                    let timestamp = BlockTime::now();
                    let candidate = mechanism.advance_header(
                        &previous_state,
                        previous_state_hash,
                        ledger_hash,
                        timestamp,
                    );
                    let header = header_digest(&candidate, &nonce);
                    if difficulty.meets(&header) {
                        debug!(
                            target: "miner.hashing",
                            %nonce,
                            "header met the difficulty target"
                        );
                        break 'search HashingOutcome::Found {
                            state: candidate,
                            nonce,
                        };
                    }
                    nonce = nonce.succ();
                }
                tokio::select! {
                    _ = time::sleep(BATCH_PAUSE) => {}
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            debug!(target: "miner.hashing", "nonce search cancelled");
                            break 'search HashingOutcome::Cancelled;
                        }
                    }
                }
            };
            let _ = result_tx.send(outcome);
        });

        Self {
            cancel: cancel_tx,
            result_rx,
            resolved: None,
        }
    }

    /// Idempotent; observed at the next batch boundary.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Terminal outcome of the search. Safe to await again after resolution.
    pub async fn result(&mut self) -> HashingOutcome<S> {
        if self.resolved.is_none() {
            let value = (&mut self.result_rx)
                .await
                .unwrap_or(HashingOutcome::Cancelled);
            self.resolved = Some(value);
        }
        self.resolved.clone().unwrap_or(HashingOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignatureParameters;
    use crate::consensus::signature::ProofOfSignature;
    use crate::crypto::generate_keypair;
    use crate::types::Difficulty;

    fn mechanism(difficulty: Difficulty) -> Arc<ProofOfSignature> {
        let keypair = generate_keypair();
        Arc::new(
            ProofOfSignature::new(
                keypair.public,
                SignatureParameters::default(),
                LedgerHash([1u8; 32]),
                BlockTime::from_millis(0),
            )
            .with_initial_difficulty(difficulty),
        )
    }

    #[tokio::test]
    async fn permissive_target_finds_a_header_in_one_batch() {
        let mechanism = mechanism(Difficulty::easiest());
        let genesis = mechanism.genesis_protocol_state();
        let prev_hash = genesis.hash();
        let target = LedgerHash([2u8; 32]);
        let mut worker = HashingWorker::spawn(
            Arc::clone(&mechanism),
            genesis.consensus_state.clone(),
            prev_hash,
            target,
        );
        match worker.result().await {
            HashingOutcome::Found { state, nonce } => {
                assert_eq!(state.previous_state_hash, prev_hash);
                assert_eq!(state.ledger_hash, target);
                assert_eq!(state.length, 1);
                assert!(state.strength > genesis.consensus_state.strength);
                let header = header_digest(&state, &nonce);
                assert!(genesis.consensus_state.next_difficulty.meets(&header));
            }
            HashingOutcome::Cancelled => panic!("search should succeed immediately"),
        }
    }

    #[tokio::test]
    async fn unsolvable_target_cancels_within_a_batch() {
        let mechanism = mechanism(Difficulty::hardest());
        let genesis = mechanism.genesis_protocol_state();
        let mut worker = HashingWorker::spawn(
            Arc::clone(&mechanism),
            genesis.consensus_state.clone(),
            genesis.hash(),
            LedgerHash([2u8; 32]),
        );
        worker.cancel();
        // Cancellation is idempotent at any point in the worker's life.
        worker.cancel();
        assert_eq!(worker.result().await, HashingOutcome::Cancelled);
        worker.cancel();
        assert_eq!(worker.result().await, HashingOutcome::Cancelled);
    }
}
