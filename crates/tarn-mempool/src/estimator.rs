//! Fee and priority estimation from confirmation history.
//!
//! The estimator watches transactions enter the pool and records, when a
//! block confirms them, how many blocks they waited together with the fee
//! rate and priority they carried. Samples are bucketed by blocks-waited;
//! each bucket keeps the 100 most recent observations, so estimates track
//! a moving window of recent market conditions rather than all history.
//!
//! Only transactions whose inputs were all confirmed at acceptance are
//! sampled: when a transaction depends on other pool transactions its
//! confirmation time is not attributable to its own fee or priority.
//!
//! The estimator state can be snapshotted to a byte stream and reloaded
//! across restarts. A missing, stale, or corrupt snapshot only degrades
//! estimate quality; loading never aborts the node.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};

use tracing::{debug, warn};

use tarn_core::constants::{CLIENT_VERSION, ESTIMATES_MIN_VERSION};
use tarn_core::error::EstimatorError;
use tarn_core::fee_rate::FeeRate;
use tarn_core::types::Hash256;

use crate::entry::PoolEntry;

/// Deepest confirmation target tracked, in blocks.
///
/// A compromise between memory and usefulness: confirmation times beyond
/// a day of blocks are dominated by noise, so slower confirmations all
/// land in the last bucket.
pub const MAX_CONFIRM_TARGET: u32 = 25;

/// Most recent samples kept per bucket.
const SAMPLES_PER_BUCKET: usize = 100;

/// Minimum combined samples before an estimate is considered meaningful.
const MIN_ESTIMATE_SAMPLES: usize = 11;

/// A fee sample above `min_relay_fee * SANE_FEE_MULTIPLIER` in a loaded
/// snapshot is treated as file corruption.
const SANE_FEE_MULTIPLIER: u64 = 10_000;

/// Returned by the priority estimators when there is no answer.
pub const NO_PRIORITY_ESTIMATE: f64 = -1.0;

/// Sample rings for one blocks-to-confirm bucket.
#[derive(Clone, Debug, Default)]
struct ConfirmSamples {
    fees: VecDeque<FeeRate>,
    priorities: VecDeque<f64>,
}

impl ConfirmSamples {
    fn record_fee(&mut self, rate: FeeRate) {
        if self.fees.len() == SAMPLES_PER_BUCKET {
            self.fees.pop_front();
        }
        self.fees.push_back(rate);
    }

    fn record_priority(&mut self, priority: f64) {
        if self.priorities.len() == SAMPLES_PER_BUCKET {
            self.priorities.pop_front();
        }
        self.priorities.push_back(priority);
    }
}

/// An admitted transaction we are waiting to see confirmed.
#[derive(Clone, Debug)]
struct PendingObservation {
    height: u32,
    fee_rate: FeeRate,
    priority: f64,
}

/// Learns, from recent confirmation history, the fee rate or priority
/// empirically sufficient to confirm within a target number of blocks.
#[derive(Clone, Debug)]
pub struct FeeEstimator {
    min_relay_fee_rate: FeeRate,
    /// `buckets[i]` holds samples of transactions confirmed within
    /// `i + 1` blocks of acceptance.
    buckets: Vec<ConfirmSamples>,
    /// Candidates admitted to the pool, awaiting confirmation.
    pending: HashMap<Hash256, PendingObservation>,
    /// Highest block height processed; stale blocks are not re-sampled.
    best_seen_height: u32,
}

impl FeeEstimator {
    /// Create an estimator with no history.
    pub fn new(min_relay_fee_rate: FeeRate) -> Self {
        Self {
            min_relay_fee_rate,
            buckets: vec![ConfirmSamples::default(); MAX_CONFIRM_TARGET as usize],
            pending: HashMap::new(),
            best_seen_height: 0,
        }
    }

    /// Register a newly admitted transaction as an estimation candidate.
    ///
    /// Skipped when `current_estimate` is false (initial-load replay of
    /// stale transactions must not bias the model) and when the entry had
    /// unconfirmed ancestors at acceptance (its wait time would not be
    /// attributable to its own fee/priority).
    pub fn process_transaction(&mut self, txid: Hash256, entry: &PoolEntry, current_estimate: bool) {
        if !current_estimate || !entry.had_no_pool_inputs() {
            return;
        }
        self.pending.insert(
            txid,
            PendingObservation {
                height: entry.height(),
                fee_rate: entry.fee_rate(),
                priority: entry.priority(entry.height()),
            },
        );
    }

    /// Record the confirmation of a batch of pool entries at `height`.
    ///
    /// Every confirmed hash stops being pending regardless; samples are
    /// only recorded for current-estimate blocks newer than any already
    /// processed (side-chain and replayed blocks carry no signal).
    pub fn process_block(
        &mut self,
        height: u32,
        entries: &[(Hash256, PoolEntry)],
        current_estimate: bool,
    ) {
        let record = current_estimate && height > self.best_seen_height;
        if record {
            self.best_seen_height = height;
        }

        let mut sampled = 0usize;
        for (txid, entry) in entries {
            let Some(observation) = self.pending.remove(txid) else {
                continue;
            };
            if !record || observation.height >= height {
                continue;
            }
            let blocks_waited = height - observation.height;
            let bucket = blocks_waited.min(MAX_CONFIRM_TARGET) as usize - 1;
            self.buckets[bucket].record_fee(observation.fee_rate);
            self.buckets[bucket].record_priority(entry.priority(height));
            sampled += 1;
        }
        if sampled > 0 {
            debug!(height, sampled, "recorded confirmation samples");
        }
    }

    /// Drop a pending observation without sampling it (the transaction
    /// was evicted or conflicted out rather than confirmed).
    pub fn remove_tx(&mut self, txid: &Hash256) {
        self.pending.remove(txid);
    }

    /// Fee rate empirically sufficient to confirm within `target` blocks.
    ///
    /// Median of the samples from every bucket up to `target` (confirming
    /// faster than the target also satisfies it). [`FeeRate::ZERO`] when
    /// the target is out of range or the samples are too few to mean
    /// anything.
    pub fn estimate_fee(&self, target: u32) -> FeeRate {
        if target == 0 || target > MAX_CONFIRM_TARGET {
            return FeeRate::ZERO;
        }
        let mut samples: Vec<FeeRate> = self.buckets[..target as usize]
            .iter()
            .flat_map(|bucket| bucket.fees.iter().copied())
            .collect();
        if samples.len() < MIN_ESTIMATE_SAMPLES {
            return FeeRate::ZERO;
        }
        samples.sort_unstable();
        samples[samples.len() / 2]
    }

    /// Priority empirically sufficient to confirm within `target` blocks.
    ///
    /// [`NO_PRIORITY_ESTIMATE`] when there is no answer.
    pub fn estimate_priority(&self, target: u32) -> f64 {
        if target == 0 || target > MAX_CONFIRM_TARGET {
            return NO_PRIORITY_ESTIMATE;
        }
        let mut samples: Vec<f64> = self.buckets[..target as usize]
            .iter()
            .flat_map(|bucket| bucket.priorities.iter().copied())
            .collect();
        if samples.len() < MIN_ESTIMATE_SAMPLES {
            return NO_PRIORITY_ESTIMATE;
        }
        samples.sort_unstable_by(f64::total_cmp);
        samples[samples.len() / 2]
    }

    /// Like [`estimate_fee`](Self::estimate_fee), but widens the target
    /// toward slower buckets until an answer exists. Returns the estimate
    /// and the target that actually produced it (0 if none did).
    pub fn estimate_smart_fee(&self, target: u32) -> (FeeRate, u32) {
        for widened in target.max(1)..=MAX_CONFIRM_TARGET {
            let rate = self.estimate_fee(widened);
            if !rate.is_zero() {
                return (rate, widened);
            }
        }
        (FeeRate::ZERO, 0)
    }

    /// Smart-widening variant of [`estimate_priority`](Self::estimate_priority).
    pub fn estimate_smart_priority(&self, target: u32) -> (f64, u32) {
        for widened in target.max(1)..=MAX_CONFIRM_TARGET {
            let priority = self.estimate_priority(widened);
            if priority >= 0.0 {
                return (priority, widened);
            }
        }
        (NO_PRIORITY_ESTIMATE, 0)
    }

    /// Number of pending (unconfirmed) observations.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Serialize the sample history.
    ///
    /// Layout: required-version, writer-version, then per-bucket fee
    /// rings (tarns/kB scalars) and per-bucket priority rings, each a
    /// length-prefixed sequence. Pending observations are not persisted;
    /// they are only meaningful against a live pool.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), EstimatorError> {
        let config = bincode::config::standard();
        let fee_rings: Vec<Vec<u64>> = self
            .buckets
            .iter()
            .map(|bucket| bucket.fees.iter().map(|rate| rate.per_kb()).collect())
            .collect();
        let priority_rings: Vec<Vec<f64>> = self
            .buckets
            .iter()
            .map(|bucket| bucket.priorities.iter().copied().collect())
            .collect();

        bincode::encode_into_std_write(ESTIMATES_MIN_VERSION, writer, config)
            .map_err(|e| EstimatorError::Codec(e.to_string()))?;
        bincode::encode_into_std_write(CLIENT_VERSION, writer, config)
            .map_err(|e| EstimatorError::Codec(e.to_string()))?;
        bincode::encode_into_std_write(fee_rings, writer, config)
            .map_err(|e| EstimatorError::Codec(e.to_string()))?;
        bincode::encode_into_std_write(priority_rings, writer, config)
            .map_err(|e| EstimatorError::Codec(e.to_string()))?;
        Ok(())
    }

    /// Load sample history written by [`write`](Self::write).
    ///
    /// Refuses files written for a newer client before reading any
    /// samples. Every sample is bounds-checked; any out-of-range value
    /// aborts the load as corruption. Existing in-memory history is
    /// replaced only when the whole file loads cleanly.
    pub fn read<R: Read>(&mut self, reader: &mut R) -> Result<(), EstimatorError> {
        let config = bincode::config::standard();

        let required: u32 = bincode::decode_from_std_read(reader, config)
            .map_err(|e| EstimatorError::Codec(e.to_string()))?;
        if required > CLIENT_VERSION {
            return Err(EstimatorError::UpVersion {
                required,
                supported: CLIENT_VERSION,
            });
        }
        let _written: u32 = bincode::decode_from_std_read(reader, config)
            .map_err(|e| EstimatorError::Codec(e.to_string()))?;

        let fee_rings: Vec<Vec<u64>> = bincode::decode_from_std_read(reader, config)
            .map_err(|e| EstimatorError::Codec(e.to_string()))?;
        let priority_rings: Vec<Vec<f64>> = bincode::decode_from_std_read(reader, config)
            .map_err(|e| EstimatorError::Codec(e.to_string()))?;

        if fee_rings.len() > MAX_CONFIRM_TARGET as usize
            || priority_rings.len() > MAX_CONFIRM_TARGET as usize
        {
            return Err(EstimatorError::CorruptSample(format!(
                "bucket count {} / {} exceeds {}",
                fee_rings.len(),
                priority_rings.len(),
                MAX_CONFIRM_TARGET
            )));
        }

        let max_sane_fee = self
            .min_relay_fee_rate
            .per_kb()
            .saturating_mul(SANE_FEE_MULTIPLIER);
        for ring in &fee_rings {
            for &per_kb in ring {
                if per_kb > max_sane_fee {
                    return Err(EstimatorError::CorruptSample(format!(
                        "fee sample {per_kb} tarns/kB exceeds sane bound {max_sane_fee}"
                    )));
                }
            }
        }
        for ring in &priority_rings {
            for &priority in ring {
                if !priority.is_finite() || priority < 0.0 {
                    return Err(EstimatorError::CorruptSample(format!(
                        "priority sample {priority} out of range"
                    )));
                }
            }
        }

        let mut buckets = vec![ConfirmSamples::default(); MAX_CONFIRM_TARGET as usize];
        let mut fee_count = 0usize;
        let mut priority_count = 0usize;
        for (bucket, ring) in buckets.iter_mut().zip(&fee_rings) {
            for &per_kb in ring {
                bucket.record_fee(FeeRate::from_per_kb(per_kb));
                fee_count += 1;
            }
        }
        for (bucket, ring) in buckets.iter_mut().zip(&priority_rings) {
            for &priority in ring {
                bucket.record_priority(priority);
                priority_count += 1;
            }
        }
        self.buckets = buckets;

        if fee_count + priority_count > 0 {
            debug!(fee_count, priority_count, "loaded estimator samples");
        }
        Ok(())
    }
}

/// Log an estimator persistence failure at the appropriate level.
///
/// Tier split: an up-version file is a policy refusal, corruption and
/// codec failures are recoverable data loss. Neither stops the node.
pub(crate) fn log_load_failure(err: &EstimatorError) {
    match err {
        EstimatorError::UpVersion { required, supported } => {
            warn!(required, supported, "refusing estimator snapshot from newer client");
        }
        other => warn!(error = %other, "unable to load estimator snapshot; starting fresh"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_core::constants::MIN_RELAY_FEE_RATE;
    use tarn_core::types::{OutPoint, Transaction, TxInput, TxOutput};

    fn relay() -> FeeRate {
        FeeRate::from_per_kb(MIN_RELAY_FEE_RATE)
    }

    fn entry(seed: u8, fee: u64, height: u32, had_no_pool_inputs: bool) -> (Hash256, PoolEntry) {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: Hash256([seed; 32]), index: 0 },
                signature: vec![0; 64],
                public_key: vec![0; 32],
            }],
            outputs: vec![TxOutput { value: 9000, pubkey_hash: Hash256::ZERO }],
            lock_time: seed as u64,
        };
        let txid = tx.txid().unwrap();
        let entry = PoolEntry::new(tx, fee, 0, 0.0, height, had_no_pool_inputs).unwrap();
        (txid, entry)
    }

    /// Admit `n` distinct transactions at `accept_height` and confirm
    /// them all in one block at `confirm_height`.
    fn feed_samples(est: &mut FeeEstimator, n: usize, fee: u64, accept_height: u32, confirm_height: u32) {
        let mut confirmed = Vec::new();
        for i in 0..n {
            let (txid, e) = entry(i as u8 + 1, fee + i as u64, accept_height, true);
            est.process_transaction(txid, &e, true);
            confirmed.push((txid, e));
        }
        est.process_block(confirm_height, &confirmed, true);
    }

    // ------------------------------------------------------------------
    // Pending observation gating
    // ------------------------------------------------------------------

    #[test]
    fn not_current_estimate_not_tracked() {
        let mut est = FeeEstimator::new(relay());
        let (txid, e) = entry(1, 5000, 10, true);
        est.process_transaction(txid, &e, false);
        assert_eq!(est.pending_len(), 0);
    }

    #[test]
    fn pool_ancestors_not_tracked() {
        let mut est = FeeEstimator::new(relay());
        let (txid, e) = entry(1, 5000, 10, false);
        est.process_transaction(txid, &e, true);
        assert_eq!(est.pending_len(), 0);
    }

    #[test]
    fn remove_tx_drops_pending() {
        let mut est = FeeEstimator::new(relay());
        let (txid, e) = entry(1, 5000, 10, true);
        est.process_transaction(txid, &e, true);
        assert_eq!(est.pending_len(), 1);
        est.remove_tx(&txid);
        assert_eq!(est.pending_len(), 0);
    }

    #[test]
    fn confirmation_consumes_pending() {
        let mut est = FeeEstimator::new(relay());
        let (txid, e) = entry(1, 5000, 10, true);
        est.process_transaction(txid, &e, true);
        est.process_block(12, &[(txid, e)], true);
        assert_eq!(est.pending_len(), 0);
    }

    #[test]
    fn stale_block_drops_pending_without_sampling() {
        let mut est = FeeEstimator::new(relay());
        feed_samples(&mut est, MIN_ESTIMATE_SAMPLES, 5000, 10, 12);
        let before = est.estimate_fee(MAX_CONFIRM_TARGET);

        // A block below best_seen_height removes pending but records nothing.
        let (txid, e) = entry(200, 999_999, 1, true);
        est.process_transaction(txid, &e, true);
        est.process_block(2, &[(txid, e)], true);
        assert_eq!(est.pending_len(), 0);
        assert_eq!(est.estimate_fee(MAX_CONFIRM_TARGET), before);
    }

    // ------------------------------------------------------------------
    // Estimates
    // ------------------------------------------------------------------

    #[test]
    fn too_few_samples_no_answer() {
        let mut est = FeeEstimator::new(relay());
        feed_samples(&mut est, MIN_ESTIMATE_SAMPLES - 1, 5000, 10, 12);
        assert_eq!(est.estimate_fee(MAX_CONFIRM_TARGET), FeeRate::ZERO);
        assert_eq!(est.estimate_priority(MAX_CONFIRM_TARGET), NO_PRIORITY_ESTIMATE);
    }

    #[test]
    fn enough_samples_yields_median() {
        let mut est = FeeEstimator::new(relay());
        feed_samples(&mut est, 11, 5000, 10, 12);
        let rate = est.estimate_fee(MAX_CONFIRM_TARGET);
        assert!(!rate.is_zero());
        // All samples near 5000 tarns fee over the same size.
        let expected = FeeRate::from_fee_and_size(5005, entry(1, 0, 0, true).1.tx_size());
        assert_eq!(rate, expected);
    }

    #[test]
    fn target_out_of_range_no_answer() {
        let est = FeeEstimator::new(relay());
        assert_eq!(est.estimate_fee(0), FeeRate::ZERO);
        assert_eq!(est.estimate_fee(MAX_CONFIRM_TARGET + 1), FeeRate::ZERO);
        assert_eq!(est.estimate_priority(0), NO_PRIORITY_ESTIMATE);
    }

    #[test]
    fn fast_confirmations_count_toward_slower_targets() {
        let mut est = FeeEstimator::new(relay());
        // All confirmed two blocks after acceptance.
        feed_samples(&mut est, 11, 5000, 10, 12);
        assert!(!est.estimate_fee(2).is_zero());
        assert!(!est.estimate_fee(MAX_CONFIRM_TARGET).is_zero());
        // But a 1-block target has no bucket-1 samples.
        assert_eq!(est.estimate_fee(1), FeeRate::ZERO);
    }

    #[test]
    fn priority_estimate_present() {
        let mut est = FeeEstimator::new(relay());
        feed_samples(&mut est, 11, 5000, 10, 12);
        assert!(est.estimate_priority(MAX_CONFIRM_TARGET) >= 0.0);
    }

    // ------------------------------------------------------------------
    // Smart widening
    // ------------------------------------------------------------------

    #[test]
    fn smart_fee_widens_and_reports_bucket() {
        let mut est = FeeEstimator::new(relay());
        feed_samples(&mut est, 11, 5000, 10, 12);

        let (rate, found_at) = est.estimate_smart_fee(1);
        assert!(!rate.is_zero());
        assert!(found_at > 1);
        assert_eq!(rate, est.estimate_fee(found_at));
    }

    #[test]
    fn smart_fee_no_history_reports_zero() {
        let est = FeeEstimator::new(relay());
        assert_eq!(est.estimate_smart_fee(1), (FeeRate::ZERO, 0));
        let (priority, found_at) = est.estimate_smart_priority(1);
        assert_eq!(priority, NO_PRIORITY_ESTIMATE);
        assert_eq!(found_at, 0);
    }

    // ------------------------------------------------------------------
    // Ring capacity
    // ------------------------------------------------------------------

    #[test]
    fn ring_keeps_most_recent_samples() {
        let mut bucket = ConfirmSamples::default();
        for i in 0..(SAMPLES_PER_BUCKET + 10) {
            bucket.record_fee(FeeRate::from_per_kb(i as u64));
        }
        assert_eq!(bucket.fees.len(), SAMPLES_PER_BUCKET);
        // Oldest ten aged out.
        assert_eq!(bucket.fees.front().copied(), Some(FeeRate::from_per_kb(10)));
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    #[test]
    fn snapshot_round_trip() {
        let mut est = FeeEstimator::new(relay());
        feed_samples(&mut est, 20, 5000, 10, 12);

        let mut buf = Vec::new();
        est.write(&mut buf).unwrap();

        let mut loaded = FeeEstimator::new(relay());
        loaded.read(&mut buf.as_slice()).unwrap();

        for target in 1..=MAX_CONFIRM_TARGET {
            assert_eq!(est.estimate_fee(target), loaded.estimate_fee(target));
            assert_eq!(est.estimate_priority(target), loaded.estimate_priority(target));
        }
    }

    #[test]
    fn up_version_snapshot_refused() {
        let config = bincode::config::standard();
        let mut buf = Vec::new();
        bincode::encode_into_std_write(CLIENT_VERSION + 1, &mut buf, config).unwrap();
        bincode::encode_into_std_write(CLIENT_VERSION + 1, &mut buf, config).unwrap();
        bincode::encode_into_std_write(Vec::<Vec<u64>>::new(), &mut buf, config).unwrap();
        bincode::encode_into_std_write(Vec::<Vec<f64>>::new(), &mut buf, config).unwrap();

        let mut est = FeeEstimator::new(relay());
        let err = est.read(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, EstimatorError::UpVersion { .. }));
    }

    #[test]
    fn corrupt_fee_sample_aborts_load_keeps_state() {
        let mut est = FeeEstimator::new(relay());
        feed_samples(&mut est, 11, 5000, 10, 12);
        let before = est.estimate_fee(MAX_CONFIRM_TARGET);

        let config = bincode::config::standard();
        let mut buf = Vec::new();
        bincode::encode_into_std_write(ESTIMATES_MIN_VERSION, &mut buf, config).unwrap();
        bincode::encode_into_std_write(CLIENT_VERSION, &mut buf, config).unwrap();
        // One absurd sample: far past 10000x the relay fee.
        bincode::encode_into_std_write(vec![vec![u64::MAX]], &mut buf, config).unwrap();
        bincode::encode_into_std_write(Vec::<Vec<f64>>::new(), &mut buf, config).unwrap();

        let err = est.read(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, EstimatorError::CorruptSample(_)));
        // Prior history untouched.
        assert_eq!(est.estimate_fee(MAX_CONFIRM_TARGET), before);
    }

    #[test]
    fn corrupt_priority_sample_aborts_load() {
        let config = bincode::config::standard();
        let mut buf = Vec::new();
        bincode::encode_into_std_write(ESTIMATES_MIN_VERSION, &mut buf, config).unwrap();
        bincode::encode_into_std_write(CLIENT_VERSION, &mut buf, config).unwrap();
        bincode::encode_into_std_write(Vec::<Vec<u64>>::new(), &mut buf, config).unwrap();
        bincode::encode_into_std_write(vec![vec![-1.0f64]], &mut buf, config).unwrap();

        let mut est = FeeEstimator::new(relay());
        assert!(matches!(
            est.read(&mut buf.as_slice()).unwrap_err(),
            EstimatorError::CorruptSample(_)
        ));
    }

    #[test]
    fn excess_bucket_count_rejected() {
        let config = bincode::config::standard();
        let mut buf = Vec::new();
        bincode::encode_into_std_write(ESTIMATES_MIN_VERSION, &mut buf, config).unwrap();
        bincode::encode_into_std_write(CLIENT_VERSION, &mut buf, config).unwrap();
        let rings: Vec<Vec<u64>> = vec![vec![]; MAX_CONFIRM_TARGET as usize + 1];
        bincode::encode_into_std_write(rings, &mut buf, config).unwrap();
        bincode::encode_into_std_write(Vec::<Vec<f64>>::new(), &mut buf, config).unwrap();

        let mut est = FeeEstimator::new(relay());
        assert!(matches!(
            est.read(&mut buf.as_slice()).unwrap_err(),
            EstimatorError::CorruptSample(_)
        ));
    }

    #[test]
    fn truncated_snapshot_is_codec_error() {
        let mut est = FeeEstimator::new(relay());
        let mut buf = Vec::new();
        est.write(&mut buf).unwrap();
        buf.truncate(buf.len() / 2);

        let mut loaded = FeeEstimator::new(relay());
        assert!(matches!(
            loaded.read(&mut buf.as_slice()).unwrap_err(),
            EstimatorError::Codec(_)
        ));
    }
}
