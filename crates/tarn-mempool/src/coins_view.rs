//! Coins view overlaying the pool on top of confirmed chain state.
//!
//! While validating a candidate transaction, the node must treat
//! pool-resident outputs as spendable even though no block confirms them
//! yet. [`MempoolCoinsView`] wraps the confirmed-coin view and answers
//! from the pool first.

use tarn_core::coins::{Coins, CoinsView};
use tarn_core::constants::MEMPOOL_HEIGHT;
use tarn_core::types::Hash256;

use crate::pool::TxMemPool;

/// A [`CoinsView`] that sees both confirmed coins and pool-resident
/// (unconfirmed) outputs.
pub struct MempoolCoinsView<'a, V: CoinsView> {
    base: &'a V,
    pool: &'a TxMemPool,
}

impl<'a, V: CoinsView> MempoolCoinsView<'a, V> {
    /// Overlay `pool` on top of `base`.
    pub fn new(base: &'a V, pool: &'a TxMemPool) -> Self {
        Self { base, pool }
    }
}

impl<V: CoinsView> CoinsView for MempoolCoinsView<'_, V> {
    /// A pool entry always wins over the base view: it can never conflict
    /// with the underlying cache and is never pruned or partial, so the
    /// synthesized record is a full reconstruction. Checking the base
    /// first would risk returning a stale partial record instead.
    fn get_coins(&self, txid: &Hash256) -> Option<Coins> {
        if let Some(tx) = self.pool.lookup(txid) {
            return Some(Coins::from_tx(&tx, MEMPOOL_HEIGHT));
        }
        // A fully-spent confirmed record is not a source of new spends.
        self.base
            .get_coins(txid)
            .filter(|coins| !coins.is_fully_spent())
    }

    fn have_coins(&self, txid: &Hash256) -> bool {
        self.pool.exists(txid) || self.base.have_coins(txid)
    }
}
