//! Confirmed-coin records and the read abstraction over them.
//!
//! [`Coins`] is the per-transaction record of still-unspent outputs, the
//! unit the pool queries when deciding whether an input is satisfiable
//! outside the pool. [`CoinsView`] is the read interface the pool and its
//! overlay require from chain state; [`MemoryCoinsStore`] is an in-memory
//! implementation used by tests and by the pool's consistency audit.
//!
//! Blocks and script validation live in the consensus layer; this module
//! only models output availability.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Hash256, OutPoint, Transaction, TxOutput};

/// Unspent outputs of a single transaction.
///
/// `outputs[n]` is `None` once output `n` has been spent. A record whose
/// outputs are all spent is *fully spent* and reads as absent through
/// view implementations.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Coins {
    /// Outputs by index; `None` marks a spent slot.
    pub outputs: Vec<Option<TxOutput>>,
    /// Height of the block that confirmed the transaction.
    pub height: u32,
    /// Whether the transaction was a coinbase (maturity applies).
    pub is_coinbase: bool,
}

impl Coins {
    /// Build the coin record of a freshly confirmed (or pool-resident)
    /// transaction: every output unspent.
    pub fn from_tx(tx: &Transaction, height: u32) -> Self {
        Self {
            outputs: tx.outputs.iter().cloned().map(Some).collect(),
            height,
            is_coinbase: tx.is_coinbase(),
        }
    }

    /// Whether output `index` exists and is unspent.
    pub fn is_available(&self, index: u32) -> bool {
        self.outputs
            .get(index as usize)
            .is_some_and(|slot| slot.is_some())
    }

    /// Whether every output has been spent.
    pub fn is_fully_spent(&self) -> bool {
        self.outputs.iter().all(|slot| slot.is_none())
    }

    /// Mark output `index` spent. Returns false if it was already spent
    /// or out of range.
    pub fn spend(&mut self, index: u32) -> bool {
        match self.outputs.get_mut(index as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

/// Read access to confirmed-coin records.
///
/// Implementations must treat fully-spent records as absent from
/// [`get_coins`](CoinsView::get_coins): a transaction with no unspent
/// outputs is not a valid source of new spends.
pub trait CoinsView {
    /// Look up the unspent outputs of `txid`. `None` if unknown or fully spent.
    fn get_coins(&self, txid: &Hash256) -> Option<Coins>;

    /// Whether `txid` has a coin record (even a partially spent one).
    fn have_coins(&self, txid: &Hash256) -> bool {
        self.get_coins(txid).is_some()
    }
}

/// In-memory coin store for tests and audit replay.
///
/// Not thread-safe; callers wrap it if shared.
#[derive(Default)]
pub struct MemoryCoinsStore {
    coins: HashMap<Hash256, Coins>,
}

impl MemoryCoinsStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the outputs of a confirmed transaction at `height`.
    ///
    /// Returns the txid, or the serialization error if the transaction
    /// cannot be encoded.
    pub fn add_tx(
        &mut self,
        tx: &Transaction,
        height: u32,
    ) -> Result<Hash256, crate::error::TransactionError> {
        let txid = tx.txid()?;
        self.coins.insert(txid, Coins::from_tx(tx, height));
        Ok(txid)
    }

    /// Insert a coin record directly.
    pub fn insert(&mut self, txid: Hash256, coins: Coins) {
        self.coins.insert(txid, coins);
    }

    /// Spend one output. Removes the record once fully spent.
    /// Returns false if the outpoint was not available.
    pub fn spend(&mut self, outpoint: &OutPoint) -> bool {
        let Some(coins) = self.coins.get_mut(&outpoint.txid) else {
            return false;
        };
        if !coins.spend(outpoint.index) {
            return false;
        }
        if coins.is_fully_spent() {
            self.coins.remove(&outpoint.txid);
        }
        true
    }

    /// Remove a record outright (reorg pruning in tests).
    pub fn remove(&mut self, txid: &Hash256) -> Option<Coins> {
        self.coins.remove(txid)
    }

    /// Number of coin records held.
    pub fn len(&self) -> usize {
        self.coins.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }
}

impl CoinsView for MemoryCoinsStore {
    fn get_coins(&self, txid: &Hash256) -> Option<Coins> {
        self.coins
            .get(txid)
            .filter(|coins| !coins.is_fully_spent())
            .cloned()
    }

    fn have_coins(&self, txid: &Hash256) -> bool {
        self.coins.contains_key(txid)
    }
}
