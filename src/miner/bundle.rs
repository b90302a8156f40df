use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::ledger::{Ledger, SignedTransaction};
use crate::proofs::{ProofBackend, ProofBytes, TransitionStatement};
use crate::types::LedgerHash;

/// A batch of transactions applied to a ledger snapshot, paired with the
/// asynchronous production of the ledger-transition proof. The target hash is
/// available immediately; the proof arrives through [`Bundle::result`].
pub struct Bundle {
    target_hash: LedgerHash,
    transactions: Vec<SignedTransaction>,
    cancel: watch::Sender<bool>,
    result_rx: oneshot::Receiver<Option<ProofBytes>>,
    resolved: Option<Option<ProofBytes>>,
}

impl Bundle {
    /// Applies `transactions` to a snapshot of `ledger` and starts proving the
    /// transition. Transactions that no longer apply are dropped from the
    /// bundle. The snapshot is owned; concurrent mutation of the controller's
    /// ledger cannot reach it.
    pub fn build(
        backend: Arc<dyn ProofBackend>,
        ledger: Ledger,
        transactions: Vec<SignedTransaction>,
    ) -> Bundle {
        let source = ledger.hash();
        let mut staged = ledger;
        let mut applied = Vec::with_capacity(transactions.len());
        for tx in transactions {
            match staged.apply(&tx) {
                Ok(()) => applied.push(tx),
                Err(err) => {
                    warn!(
                        target: "miner.bundle",
                        error = %err,
                        "dropping transaction that does not apply"
                    );
                }
            }
        }
        let target_hash = staged.hash();
        let statement = TransitionStatement::new(source, target_hash, &applied);

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (result_tx, result_rx) = oneshot::channel();
        tokio::spawn(async move {
            let proving = tokio::task::spawn_blocking(move || backend.prove_transition(&statement));
            let outcome = tokio::select! {
                _ = cancel_rx.changed() => {
                    debug!(target: "miner.bundle", "bundle cancelled before the proof completed");
                    None
                }
                joined = proving => match joined {
                    Ok(Ok(proof)) => Some(proof),
                    Ok(Err(err)) => {
                        warn!(target: "miner.bundle", error = %err, "proving failed");
                        None
                    }
                    Err(err) => {
                        warn!(target: "miner.bundle", error = %err, "proving task failed");
                        None
                    }
                }
            };
            let _ = result_tx.send(outcome);
        });

        Bundle {
            target_hash,
            transactions: applied,
            cancel: cancel_tx,
            result_rx,
            resolved: None,
        }
    }

    /// Deterministic result of applying the bundled transactions to the
    /// snapshot; available before the proof is.
    pub fn target_hash(&self) -> &LedgerHash {
        &self.target_hash
    }

    /// The transactions that made it into the bundle, in application order.
    pub fn transactions(&self) -> &[SignedTransaction] {
        &self.transactions
    }

    /// Idempotent; a bundle cancelled before the proof completes resolves its
    /// result to `None`.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Resolves to `None` iff proving failed or was cancelled. Safe to await
    /// again after resolution.
    pub async fn result(&mut self) -> Option<ProofBytes> {
        if self.resolved.is_none() {
            let value = (&mut self.result_rx).await.unwrap_or(None);
            self.resolved = Some(value);
        }
        self.resolved.clone().unwrap_or(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{address_from_public_key, generate_keypair};
    use crate::ledger::Transaction;
    use crate::proofs::HashCommitBackend;

    fn backend() -> Arc<dyn ProofBackend> {
        Arc::new(HashCommitBackend)
    }

    #[tokio::test]
    async fn empty_bundle_targets_the_snapshot_itself() {
        let ledger = Ledger::genesis([("alice".to_string(), 10u64)]);
        let expected = ledger.hash();
        let mut bundle = Bundle::build(backend(), ledger.clone(), Vec::new());
        assert_eq!(*bundle.target_hash(), expected);
        let proof = bundle.result().await.expect("trivial proof");
        let statement = TransitionStatement::new(expected, expected, &[]);
        assert!(HashCommitBackend
            .verify_transition(&statement, &proof)
            .expect("verify"));
    }

    #[tokio::test]
    async fn proof_matches_the_applied_transactions() {
        let keypair = generate_keypair();
        let sender = address_from_public_key(&keypair.public);
        let ledger = Ledger::genesis([(sender.clone(), 100u64)]);
        let source = ledger.hash();
        let tx = SignedTransaction::sign(
            Transaction {
                sender,
                receiver: "bob".into(),
                amount: 10,
                fee: 0,
            },
            &keypair,
        );
        let mut expected = ledger.clone();
        expected.apply(&tx).expect("apply");

        let mut bundle = Bundle::build(backend(), ledger, vec![tx.clone()]);
        assert_eq!(*bundle.target_hash(), expected.hash());
        assert_eq!(bundle.transactions(), &[tx.clone()]);
        let proof = bundle.result().await.expect("proof");
        let statement = TransitionStatement::new(source, expected.hash(), &[tx]);
        assert!(HashCommitBackend
            .verify_transition(&statement, &proof)
            .expect("verify"));
    }

    #[tokio::test]
    async fn unappliable_transactions_are_dropped() {
        let keypair = generate_keypair();
        let sender = address_from_public_key(&keypair.public);
        let ledger = Ledger::genesis([(sender.clone(), 5u64)]);
        let overdraft = SignedTransaction::sign(
            Transaction {
                sender,
                receiver: "bob".into(),
                amount: 50,
                fee: 0,
            },
            &keypair,
        );
        let bundle = Bundle::build(backend(), ledger.clone(), vec![overdraft]);
        assert!(bundle.transactions().is_empty());
        assert_eq!(*bundle.target_hash(), ledger.hash());
    }

    /// Backend that blocks until its gate is released, so cancellation races
    /// can be exercised deterministically.
    struct StalledBackend(std::sync::Mutex<std::sync::mpsc::Receiver<()>>);

    impl ProofBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn prove_transition(
            &self,
            statement: &TransitionStatement,
        ) -> crate::errors::ChainResult<ProofBytes> {
            let _ = self.0.lock().expect("gate lock").recv();
            HashCommitBackend.prove_transition(statement)
        }

        fn verify_transition(
            &self,
            statement: &TransitionStatement,
            proof: &ProofBytes,
        ) -> crate::errors::ChainResult<bool> {
            HashCommitBackend.verify_transition(statement, proof)
        }
    }

    #[tokio::test]
    async fn cancellation_resolves_to_none_and_is_idempotent() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let backend: Arc<dyn ProofBackend> =
            Arc::new(StalledBackend(std::sync::Mutex::new(gate_rx)));
        let ledger = Ledger::genesis([("alice".to_string(), 10u64)]);
        let mut bundle = Bundle::build(backend, ledger, Vec::new());
        bundle.cancel();
        bundle.cancel();
        assert!(bundle.result().await.is_none());
        assert!(bundle.result().await.is_none());
        drop(gate_tx);
    }
}
