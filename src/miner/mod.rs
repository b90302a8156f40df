//! Mining coordinator: one bundle builder plus one nonce search per tip,
//! restarted on every tip change, with successful attempts emitted on a
//! bounded stream toward the chain controller.

pub mod bundle;
pub mod hashing;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::consensus::{ConsensusMechanism, ConsensusState, ProtocolState};
use crate::errors::{ChainError, ChainResult};
use crate::ledger::{Ledger, SignedTransaction, TransactionPool};
use crate::proofs::{ProofBackend, ProofBytes};
use crate::types::{BlockTime, LedgerHash, Nonce};

pub use self::bundle::Bundle;
pub use self::hashing::{HashingOutcome, HashingWorker};

/// Capacity of the emission stream toward the chain controller. A full stream
/// means the consumer stalled, which is fatal.
pub const TRANSITION_CAPACITY: usize = 64;

pub const DEFAULT_TRANSACTIONS_PER_BUNDLE: usize = 10;

#[derive(Clone, Debug)]
pub struct MinerConfig {
    pub transactions_per_bundle: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            transactions_per_bundle: DEFAULT_TRANSACTIONS_PER_BUNDLE,
        }
    }
}

/// Head-of-chain with the material the next attempt mines against.
#[derive(Clone)]
pub struct Tip<S> {
    pub state: ProtocolState<S>,
    pub ledger: Ledger,
    pub pool: Arc<TransactionPool>,
}

/// Event fed by the chain controller; the first one establishes the initial
/// tip.
#[derive(Clone)]
pub struct TipChange<S>(pub Tip<S>);

/// The mined block body: target ledger with its transition proof, plus the
/// header search result.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub ledger_hash: LedgerHash,
    pub ledger_proof: ProofBytes,
    pub timestamp: BlockTime,
    pub nonce: Nonce,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransitionWithWitness {
    pub transition: Transition,
    pub transactions: Vec<SignedTransaction>,
}

/// Handle on the coordinator task.
pub struct Miner {
    handle: JoinHandle<ChainResult<()>>,
}

impl Miner {
    /// Starts the coordinator. Emissions arrive on the returned receiver in
    /// completion order.
    pub fn spawn<M: ConsensusMechanism>(
        mechanism: Arc<M>,
        backend: Arc<dyn ProofBackend>,
        config: MinerConfig,
        tips: mpsc::Receiver<TipChange<M::State>>,
    ) -> (mpsc::Receiver<TransitionWithWitness>, Miner) {
        let (transition_tx, transition_rx) = mpsc::channel(TRANSITION_CAPACITY);
        let handle = tokio::spawn(run(mechanism, backend, config, tips, transition_tx));
        (transition_rx, Miner { handle })
    }

    /// Waits for the coordinator to stop; its terminal error describes why.
    pub async fn join(self) -> ChainResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => {
                error!(target: "miner", error = %err, "coordinator task aborted");
                Err(ChainError::Task("mining coordinator aborted"))
            }
        }
    }
}

fn start_attempt<M: ConsensusMechanism>(
    mechanism: &Arc<M>,
    backend: &Arc<dyn ProofBackend>,
    tip: &Tip<M::State>,
    transactions_per_bundle: usize,
) -> (Bundle, HashingWorker<M::State>) {
    let transactions = tip.pool.get(transactions_per_bundle);
    let bundle = Bundle::build(Arc::clone(backend), tip.ledger.clone(), transactions);
    let worker = HashingWorker::spawn(
        Arc::clone(mechanism),
        tip.state.consensus_state.clone(),
        tip.state.hash(),
        *bundle.target_hash(),
    );
    (bundle, worker)
}

fn witness<S: ConsensusState>(
    bundle: &Bundle,
    proof: ProofBytes,
    state: &S,
    nonce: Nonce,
) -> TransitionWithWitness {
    TransitionWithWitness {
        transition: Transition {
            ledger_hash: *bundle.target_hash(),
            ledger_proof: proof,
            timestamp: state.timestamp(),
            nonce,
        },
        transactions: bundle.transactions().to_vec(),
    }
}

/// Awaits both workers, reacting to whichever terminates first. A failed
/// bundle cancels the search; a cancelled search makes the attempt moot.
async fn finish<S: ConsensusState>(
    bundle: &mut Bundle,
    worker: &mut HashingWorker<S>,
) -> ChainResult<TransitionWithWitness> {
    let proof;
    let outcome;
    tokio::select! {
        resolved = bundle.result() => {
            proof = resolved;
            if proof.is_none() {
                worker.cancel();
            }
            outcome = worker.result().await;
        }
        resolved = worker.result() => {
            outcome = resolved;
            if matches!(outcome, HashingOutcome::Cancelled) {
                bundle.cancel();
            }
            proof = bundle.result().await;
        }
    }
    match (proof, outcome) {
        (Some(proof), HashingOutcome::Found { state, nonce }) => {
            Ok(witness(bundle, proof, &state, nonce))
        }
        (_, HashingOutcome::Cancelled) => Err(ChainError::MiningCancelled),
        (None, _) => Err(ChainError::BundlingFailed),
    }
}

async fn run<M: ConsensusMechanism>(
    mechanism: Arc<M>,
    backend: Arc<dyn ProofBackend>,
    config: MinerConfig,
    mut tips: mpsc::Receiver<TipChange<M::State>>,
    transitions: mpsc::Sender<TransitionWithWitness>,
) -> ChainResult<()> {
    let Some(TipChange(mut tip)) = tips.recv().await else {
        return Err(ChainError::TipStreamEnded("before the first tip"));
    };
    info!(target: "miner", mechanism = mechanism.name(), "mining coordinator started");
    loop {
        let (mut bundle, mut worker) =
            start_attempt(&mechanism, &backend, &tip, config.transactions_per_bundle);
        debug!(
            target: "miner",
            length = tip.state.consensus_state.length(),
            transactions = bundle.transactions().len(),
            "mining attempt started"
        );
        tokio::select! {
            next = tips.recv() => {
                // The previous attempt's cancellation is observed before the
                // replacement starts; its pending result is discarded.
                bundle.cancel();
                worker.cancel();
                let _ = bundle.result().await;
                let _ = worker.result().await;
                match next {
                    Some(TipChange(new_tip)) => {
                        debug!(target: "miner", "tip changed, restarting attempt");
                        tip = new_tip;
                    }
                    None => return Err(ChainError::TipStreamEnded("while mining")),
                }
            }
            attempt = finish(&mut bundle, &mut worker) => {
                match attempt {
                    Ok(mined) => {
                        info!(
                            target: "miner",
                            transactions = mined.transactions.len(),
                            nonce = %mined.transition.nonce,
                            ledger_hash = %mined.transition.ledger_hash,
                            "emitting transition"
                        );
                        match transitions.try_send(mined) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                return Err(ChainError::EmissionOverflow(
                                    "transition consumer stalled",
                                ));
                            }
                            Err(TrySendError::Closed(_)) => {
                                return Err(ChainError::ChannelClosed("transition stream"));
                            }
                        }
                    }
                    Err(err) => {
                        warn!(target: "miner", error = %err, "mining attempt failed");
                    }
                }
                // One attempt per tip: the next one waits for a tip change.
                match tips.recv().await {
                    Some(TipChange(new_tip)) => tip = new_tip,
                    None => return Err(ChainError::TipStreamEnded("after an attempt completed")),
                }
            }
        }
    }
}
