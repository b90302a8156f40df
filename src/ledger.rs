use std::collections::{BTreeMap, VecDeque};

use ed25519_dalek::Keypair;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::{
    address_from_public_key, digest, public_key_from_hex, public_key_to_hex, sign_message,
    signature_from_hex, signature_to_hex, verify_signature,
};
use crate::errors::{ChainError, ChainResult};
use crate::types::LedgerHash;

pub type Address = String;

pub const DEFAULT_POOL_LIMIT: usize = 8_192;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub sender: Address,
    pub receiver: Address,
    pub amount: u64,
    pub fee: u64,
}

impl Transaction {
    pub fn message_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"coda-transaction");
        data.extend_from_slice(self.sender.as_bytes());
        data.extend_from_slice(self.receiver.as_bytes());
        data.extend_from_slice(&self.amount.to_le_bytes());
        data.extend_from_slice(&self.fee.to_le_bytes());
        data
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    pub payload: Transaction,
    pub public_key: String,
    pub signature: String,
}

impl SignedTransaction {
    pub fn sign(payload: Transaction, keypair: &Keypair) -> Self {
        let signature = sign_message(keypair, &payload.message_bytes());
        Self {
            payload,
            public_key: public_key_to_hex(&keypair.public),
            signature: signature_to_hex(&signature),
        }
    }

    pub fn verify(&self) -> ChainResult<()> {
        let public_key = public_key_from_hex(&self.public_key)?;
        let derived = address_from_public_key(&public_key);
        if derived != self.payload.sender {
            return Err(ChainError::Transaction(
                "transaction public key does not match sender address".into(),
            ));
        }
        let signature = signature_from_hex(&self.signature)?;
        verify_signature(&public_key, &self.payload.message_bytes(), &signature)
    }

    pub fn hash(&self) -> [u8; 32] {
        digest(&self.payload.message_bytes())
    }
}

/// In-memory account ledger. A clone is the logical snapshot handed to the
/// bundle builder; the chain controller mutates only its own copy.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ledger {
    accounts: BTreeMap<Address, u64>,
}

impl Ledger {
    pub fn genesis<I>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (Address, u64)>,
    {
        Self {
            accounts: accounts.into_iter().collect(),
        }
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    pub fn total_currency(&self) -> u64 {
        self.accounts.values().fold(0u64, |acc, b| acc.saturating_add(*b))
    }

    pub fn stake_distribution(&self) -> BTreeMap<Address, u64> {
        self.accounts.clone()
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.accounts).expect("serializing ledger accounts")
    }

    pub fn hash(&self) -> LedgerHash {
        LedgerHash(digest(&self.canonical_bytes()))
    }

    pub fn apply(&mut self, tx: &SignedTransaction) -> ChainResult<()> {
        tx.verify()?;
        let debit = tx
            .payload
            .amount
            .checked_add(tx.payload.fee)
            .ok_or_else(|| ChainError::Transaction("amount plus fee overflows".into()))?;
        let sender_balance = self.balance(&tx.payload.sender);
        if sender_balance < debit {
            return Err(ChainError::Transaction(format!(
                "insufficient balance: {} < {}",
                sender_balance, debit
            )));
        }
        self.accounts
            .insert(tx.payload.sender.clone(), sender_balance - debit);
        let receiver_balance = self.balance(&tx.payload.receiver);
        self.accounts.insert(
            tx.payload.receiver.clone(),
            receiver_balance.saturating_add(tx.payload.amount),
        );
        Ok(())
    }

    pub fn apply_all(&mut self, txs: &[SignedTransaction]) -> ChainResult<()> {
        for tx in txs {
            self.apply(tx)?;
        }
        Ok(())
    }
}

/// Ordered pool of pending transactions. `get` removes atomically; concurrent
/// callers are serialized on the internal mutex.
#[derive(Debug)]
pub struct TransactionPool {
    queue: Mutex<VecDeque<SignedTransaction>>,
    limit: usize,
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_POOL_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            limit,
        }
    }

    pub fn submit(&self, tx: SignedTransaction) -> ChainResult<()> {
        tx.verify()?;
        let mut queue = self.queue.lock();
        if queue.len() >= self.limit {
            return Err(ChainError::Transaction("transaction pool is full".into()));
        }
        queue.push_back(tx);
        Ok(())
    }

    /// Removes and returns up to `count` valid transactions in arrival order.
    /// Entries that no longer verify are dropped.
    pub fn get(&self, count: usize) -> Vec<SignedTransaction> {
        let mut queue = self.queue.lock();
        let mut taken = Vec::with_capacity(count.min(queue.len()));
        while taken.len() < count {
            let Some(tx) = queue.pop_front() else {
                break;
            };
            match tx.verify() {
                Ok(()) => taken.push(tx),
                Err(err) => {
                    warn!(target: "pool", error = %err, "dropping invalid pooled transaction");
                }
            }
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn funded_sender() -> (Keypair, Address, Ledger) {
        let keypair = generate_keypair();
        let address = address_from_public_key(&keypair.public);
        let ledger = Ledger::genesis([(address.clone(), 1_000u64)]);
        (keypair, address, ledger)
    }

    fn transfer(keypair: &Keypair, sender: &str, amount: u64) -> SignedTransaction {
        SignedTransaction::sign(
            Transaction {
                sender: sender.to_string(),
                receiver: "receiver".to_string(),
                amount,
                fee: 1,
            },
            keypair,
        )
    }

    #[test]
    fn apply_moves_funds_and_changes_the_root() {
        let (keypair, address, mut ledger) = funded_sender();
        let before = ledger.hash();
        ledger
            .apply(&transfer(&keypair, &address, 100))
            .expect("apply");
        assert_eq!(ledger.balance(&address), 899);
        assert_eq!(ledger.balance("receiver"), 100);
        assert_ne!(ledger.hash(), before);
    }

    #[test]
    fn apply_rejects_overdraft() {
        let (keypair, address, mut ledger) = funded_sender();
        let err = ledger
            .apply(&transfer(&keypair, &address, 10_000))
            .expect_err("overdraft");
        assert!(matches!(err, ChainError::Transaction(_)));
    }

    #[test]
    fn apply_rejects_forged_sender() {
        let (keypair, _, mut ledger) = funded_sender();
        let other = generate_keypair();
        let forged = SignedTransaction::sign(
            Transaction {
                sender: address_from_public_key(&other.public),
                receiver: "receiver".into(),
                amount: 1,
                fee: 0,
            },
            &keypair,
        );
        assert!(ledger.apply(&forged).is_err());
    }

    #[test]
    fn pool_get_removes_in_order() {
        let (keypair, address, _) = funded_sender();
        let pool = TransactionPool::new();
        for amount in 1..=3u64 {
            pool.submit(transfer(&keypair, &address, amount))
                .expect("submit");
        }
        let taken = pool.get(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].payload.amount, 1);
        assert_eq!(taken[1].payload.amount, 2);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(5).len(), 1);
        assert!(pool.is_empty());
    }
}
