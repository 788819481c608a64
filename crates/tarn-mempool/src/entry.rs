//! Pool entry: one accepted transaction plus the data the pool and the
//! estimator derive policy from.
//!
//! Entries are immutable after construction. External fee/priority
//! adjustments go through the pool's prioritisation delta map, never
//! through the entry itself.

use tarn_core::error::TransactionError;
use tarn_core::fee_rate::FeeRate;
use tarn_core::types::Transaction;

/// Largest per-input byte count discounted from the serialized size when
/// computing the modified size. Inputs carrying more witness data than
/// this still only get the capped discount.
const MAX_INPUT_DISCOUNT: usize = 110;

/// Fixed per-input overhead (outpoint + length prefixes) included in the
/// discount alongside the witness bytes.
const INPUT_OVERHEAD: usize = 41;

/// Serialized size minus discounts for trivially-spendable inputs.
///
/// A transaction's priority should not be inflated by inputs that are
/// cheap to verify, so each input's overhead and up to
/// [`MAX_INPUT_DISCOUNT`] bytes of its signature data are subtracted.
/// The result is clamped to `1..=serialized_size`.
pub fn compute_modified_size(tx: &Transaction, serialized_size: usize) -> usize {
    let mut size = serialized_size;
    for input in &tx.inputs {
        let witness = input.signature.len() + input.public_key.len();
        let discount = INPUT_OVERHEAD + witness.min(MAX_INPUT_DISCOUNT);
        size = size.saturating_sub(discount);
    }
    size.max(1)
}

/// A transaction resident in the pool, with everything recorded at
/// acceptance time.
#[derive(Clone, Debug)]
pub struct PoolEntry {
    tx: Transaction,
    /// Fee paid, in tarns.
    fee: u64,
    /// Serialized size in bytes.
    tx_size: usize,
    /// Size after cheap-input discounts, used for priority decay.
    mod_size: usize,
    /// Acceptance time, unix seconds.
    time: i64,
    /// Priority when the transaction entered the pool.
    start_priority: f64,
    /// Chain height at acceptance; `MEMPOOL_HEIGHT` if unknown.
    height: u32,
    /// Whether, at acceptance, none of the inputs were pool transactions.
    had_no_pool_inputs: bool,
}

impl PoolEntry {
    /// Build an entry for an accepted transaction.
    ///
    /// Fails only if the transaction cannot be serialized (which also
    /// means it could never have been relayed).
    pub fn new(
        tx: Transaction,
        fee: u64,
        time: i64,
        start_priority: f64,
        height: u32,
        had_no_pool_inputs: bool,
    ) -> Result<Self, TransactionError> {
        let tx_size = tx.serialized_size()?;
        let mod_size = compute_modified_size(&tx, tx_size);
        Ok(Self {
            tx,
            fee,
            tx_size,
            mod_size,
            time,
            start_priority,
            height,
            had_no_pool_inputs,
        })
    }

    /// The transaction body.
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    /// Consume the entry, yielding the transaction body.
    pub fn into_tx(self) -> Transaction {
        self.tx
    }

    /// Fee paid, in tarns.
    pub fn fee(&self) -> u64 {
        self.fee
    }

    /// Serialized size in bytes.
    pub fn tx_size(&self) -> usize {
        self.tx_size
    }

    /// Modified size used for priority computations.
    pub fn mod_size(&self) -> usize {
        self.mod_size
    }

    /// Acceptance time, unix seconds.
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Chain height at acceptance.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Whether none of the inputs were pool-resident at acceptance.
    pub fn had_no_pool_inputs(&self) -> bool {
        self.had_no_pool_inputs
    }

    /// Fee rate of this transaction alone.
    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::from_fee_and_size(self.fee, self.tx_size)
    }

    /// Coin-age-weighted priority at `current_height`.
    ///
    /// Grows linearly with confirmation depth of the inputs:
    /// `start + (current - acceptance) * value_in / mod_size`, where
    /// `value_in` is total output value plus fee.
    pub fn priority(&self, current_height: u32) -> f64 {
        let value_in = self
            .tx
            .total_output_value()
            .unwrap_or(u64::MAX)
            .saturating_add(self.fee);
        let depth = current_height.saturating_sub(self.height);
        self.start_priority + (depth as f64) * (value_in as f64) / (self.mod_size as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_core::types::{Hash256, OutPoint, TxInput, TxOutput};

    fn tx_with_inputs(n: usize, output_value: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: (0..n)
                .map(|i| TxInput {
                    previous_output: OutPoint {
                        txid: Hash256([i as u8 + 1; 32]),
                        index: 0,
                    },
                    signature: vec![0; 64],
                    public_key: vec![0; 32],
                })
                .collect(),
            outputs: vec![TxOutput {
                value: output_value,
                pubkey_hash: Hash256::ZERO,
            }],
            lock_time: 0,
        }
    }

    // --- compute_modified_size ---

    #[test]
    fn modified_size_below_serialized() {
        let tx = tx_with_inputs(2, 1000);
        let size = tx.serialized_size().unwrap();
        let modified = compute_modified_size(&tx, size);
        assert!(modified < size);
        assert!(modified >= 1);
    }

    #[test]
    fn modified_size_never_zero() {
        // Many inputs in a small tx: discounts exceed the size entirely.
        let tx = tx_with_inputs(50, 1);
        let size = tx.serialized_size().unwrap();
        assert_eq!(compute_modified_size(&tx, size.min(10)), 1);
    }

    #[test]
    fn discount_capped_per_input() {
        let mut tx = tx_with_inputs(1, 1000);
        tx.inputs[0].signature = vec![0; 10_000];
        let size = tx.serialized_size().unwrap();
        let modified = compute_modified_size(&tx, size);
        // Only INPUT_OVERHEAD + MAX_INPUT_DISCOUNT came off.
        assert_eq!(size - modified, INPUT_OVERHEAD + MAX_INPUT_DISCOUNT);
    }

    // --- PoolEntry ---

    #[test]
    fn entry_records_fields() {
        let tx = tx_with_inputs(1, 9000);
        let entry = PoolEntry::new(tx.clone(), 1000, 1_700_000_000, 0.0, 50, true).unwrap();
        assert_eq!(entry.fee(), 1000);
        assert_eq!(entry.height(), 50);
        assert_eq!(entry.time(), 1_700_000_000);
        assert!(entry.had_no_pool_inputs());
        assert_eq!(entry.tx(), &tx);
        assert_eq!(entry.tx_size(), tx.serialized_size().unwrap());
    }

    #[test]
    fn priority_grows_with_depth() {
        // start 0, fee 1000, outputs 9000, mod size forced to 250:
        // value_in = 10000, ten blocks deep -> 10 * 10000 / 250 = 400.
        let tx = tx_with_inputs(1, 9000);
        let mut entry = PoolEntry::new(tx, 1000, 0, 0.0, 100, true).unwrap();
        entry.mod_size = 250;
        let priority = entry.priority(110);
        assert!((priority - 400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn priority_flat_at_acceptance_height() {
        let tx = tx_with_inputs(1, 9000);
        let entry = PoolEntry::new(tx, 1000, 0, 7.5, 100, true).unwrap();
        assert!((entry.priority(100) - 7.5).abs() < f64::EPSILON);
    }

    #[test]
    fn priority_keeps_start_offset() {
        let tx = tx_with_inputs(1, 9000);
        let mut entry = PoolEntry::new(tx, 1000, 0, 100.0, 100, true).unwrap();
        entry.mod_size = 250;
        assert!((entry.priority(110) - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fee_rate_from_entry() {
        let tx = tx_with_inputs(1, 9000);
        let entry = PoolEntry::new(tx, 1000, 0, 0.0, 100, true).unwrap();
        assert_eq!(
            entry.fee_rate(),
            FeeRate::from_fee_and_size(1000, entry.tx_size())
        );
    }
}
