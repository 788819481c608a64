//! The unconfirmed-transaction pool.
//!
//! [`TxMemPool`] is the authoritative set of transactions that passed
//! validation but are not yet in a block. It maintains, atomically under
//! one internal lock:
//!
//! - the entry map (txid → [`PoolEntry`])
//! - the reverse spend index (outpoint → claiming txid + input index),
//!   which is exactly the union of all resident entries' inputs
//! - a fee-rate-ordered index for eviction and block-template consumers
//! - running size totals and the content-change counter
//! - the prioritisation delta map
//! - the fee/priority estimator
//!
//! Admission trusts the caller: full validation and conflict resolution
//! (via [`remove_conflicts`](TxMemPool::remove_conflicts)) happen before
//! [`add_unchecked`](TxMemPool::add_unchecked). No operation blocks while
//! holding the lock; validation and disk I/O stay outside.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{Read, Write};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tarn_core::coins::{Coins, CoinsView};
use tarn_core::constants::{DEFAULT_COINBASE_MATURITY, MEMPOOL_HEIGHT, MIN_RELAY_FEE_RATE};
use tarn_core::error::EstimatorError;
use tarn_core::fee_rate::FeeRate;
use tarn_core::types::{Hash256, OutPoint, Transaction};

use crate::entry::PoolEntry;
use crate::estimator::{self, FeeEstimator};

/// Half-life of the rolling minimum fee decay, in seconds.
const ROLLING_FEE_HALFLIFE: i64 = 60 * 60 * 12;

/// The rolling fee is recomputed at most this often, in seconds.
const MIN_FEE_UPDATE_INTERVAL: i64 = 10;

/// Assumed per-node bookkeeping overhead of the backing maps, in bytes.
const MAP_NODE_OVERHEAD: usize = 48;

/// Which pool transaction claims an outpoint, and through which input.
///
/// A key into the entry map, never a reference: erasing the owning entry
/// cannot leave this dangling, only stale — and the two maps are always
/// mutated together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SpendRecord {
    txid: Hash256,
    input_index: u32,
}

/// Deployment-dependent pool policy.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Baseline relay fee rate; the floor the rolling minimum relaxes to.
    pub min_relay_fee_rate: FeeRate,
    /// Confirmations before a coinbase output is spendable.
    pub coinbase_maturity: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_relay_fee_rate: FeeRate::from_per_kb(MIN_RELAY_FEE_RATE),
            coinbase_maturity: DEFAULT_COINBASE_MATURITY,
        }
    }
}

/// Everything guarded by the pool lock.
struct PoolState {
    entries: HashMap<Hash256, PoolEntry>,
    /// Ordered so all outpoints of one txid form a contiguous range.
    spends: BTreeMap<OutPoint, SpendRecord>,
    /// Ascending `(fee rate, txid)`; lowest first for eviction, iterate
    /// in reverse for block templates.
    by_fee_rate: BTreeSet<(FeeRate, Hash256)>,
    /// Accumulated (priority delta, fee delta) per hash, independent of
    /// residency.
    deltas: HashMap<Hash256, (f64, i64)>,
    /// Sum of serialized sizes of all resident entries.
    total_tx_size: u64,
    /// Bumped on every content change; relay code polls it instead of
    /// enumerating the pool.
    transactions_updated: u64,
    estimator: FeeEstimator,
    /// Rolling minimum fee floor, tarns/kB. Zero means no floor.
    rolling_min_fee: f64,
    /// Unix time of the last rolling-fee decay step.
    last_rolling_fee_update: i64,
    /// Expensive audit switch; off by default (admission would go
    /// quadratic in pool size).
    sanity_check: bool,
}

impl PoolState {
    /// Children of `txid`: pool transactions spending any of its outputs.
    fn claimants_of(&self, txid: Hash256) -> Vec<Hash256> {
        let start = OutPoint { txid, index: 0 };
        let end = OutPoint { txid, index: u32::MAX };
        self.spends.range(start..=end).map(|(_, rec)| rec.txid).collect()
    }

    /// Remove `origin_txid` and, if `recursive`, every descendant found
    /// breadth-first through the spend index. Candidates are resolved
    /// through the index before each erase, so traversal never walks
    /// freed state.
    ///
    /// Handles the reorg case where the origin is not resident but pool
    /// children still claim its outputs.
    fn remove_cascade(
        &mut self,
        origin_txid: Hash256,
        recursive: bool,
    ) -> Vec<(Hash256, Transaction)> {
        let mut queue = VecDeque::new();
        queue.push_back(origin_txid);
        if recursive && !self.entries.contains_key(&origin_txid) {
            queue.extend(self.claimants_of(origin_txid));
        }

        let mut removed = Vec::new();
        while let Some(hash) = queue.pop_front() {
            let Some(entry) = self.entries.remove(&hash) else {
                continue;
            };
            if recursive {
                queue.extend(self.claimants_of(hash));
            }
            for input in &entry.tx().inputs {
                self.spends.remove(&input.previous_output);
            }
            self.by_fee_rate.remove(&(entry.fee_rate(), hash));
            self.total_tx_size -= entry.tx_size() as u64;
            self.transactions_updated += 1;
            self.estimator.remove_tx(&hash);
            removed.push((hash, entry.into_tx()));
        }
        removed
    }

    /// Evict (recursively) every resident transaction other than `keep`
    /// that claims one of `tx`'s inputs.
    fn remove_conflicts_of(
        &mut self,
        tx: &Transaction,
        keep: Hash256,
    ) -> Vec<(Hash256, Transaction)> {
        let mut removed = Vec::new();
        for input in &tx.inputs {
            let Some(rec) = self.spends.get(&input.previous_output).copied() else {
                continue;
            };
            if rec.txid != keep {
                removed.extend(self.remove_cascade(rec.txid, true));
            }
        }
        removed
    }

    /// Deterministic model of the pool's memory footprint: struct sizes
    /// plus per-node map overhead plus serialized transaction bytes.
    fn dynamic_memory_usage(&self) -> usize {
        use std::mem::size_of;
        let entry_node = size_of::<Hash256>() + size_of::<PoolEntry>() + MAP_NODE_OVERHEAD;
        let spend_node = size_of::<OutPoint>() + size_of::<SpendRecord>() + MAP_NODE_OVERHEAD;
        let delta_node = size_of::<Hash256>() + size_of::<(f64, i64)>() + MAP_NODE_OVERHEAD;
        let rate_node = size_of::<(FeeRate, Hash256)>() + MAP_NODE_OVERHEAD;
        self.entries.len() * entry_node
            + self.total_tx_size as usize
            + self.spends.len() * spend_node
            + self.deltas.len() * delta_node
            + self.by_fee_rate.len() * rate_node
    }
}

/// The guarded unconfirmed-transaction pool.
///
/// All operations serialize on one internal exclusive lock; the
/// invariants span every index, so they must move together. Callers hold
/// only `&TxMemPool` — the lock discipline is not theirs to get wrong.
pub struct TxMemPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl TxMemPool {
    /// Create a pool with the given policy.
    pub fn new(config: PoolConfig) -> Self {
        let estimator = FeeEstimator::new(config.min_relay_fee_rate);
        Self {
            config,
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                spends: BTreeMap::new(),
                by_fee_rate: BTreeSet::new(),
                deltas: HashMap::new(),
                total_tx_size: 0,
                transactions_updated: 0,
                estimator,
                rolling_min_fee: 0.0,
                last_rolling_fee_update: 0,
                sanity_check: false,
            }),
        }
    }

    /// Create a pool with default policy.
    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    /// The pool's policy configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Enable or disable the consistency audit run by [`check`](Self::check).
    pub fn set_sanity_check(&self, enabled: bool) {
        self.state.lock().sanity_check = enabled;
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Insert an already-validated entry without any checking.
    ///
    /// The caller must have run full validation and resolved input
    /// conflicts (see [`remove_conflicts`](Self::remove_conflicts));
    /// admitting a conflicting transaction silently corrupts the spend
    /// index. A duplicate txid is a no-op returning false.
    ///
    /// `current_estimate` is false while replaying saved transactions at
    /// startup, so stale data does not feed the estimator.
    pub fn add_unchecked(&self, txid: Hash256, entry: PoolEntry, current_estimate: bool) -> bool {
        let mut st = self.state.lock();
        if st.entries.contains_key(&txid) {
            return false;
        }
        for (i, input) in entry.tx().inputs.iter().enumerate() {
            st.spends.insert(
                input.previous_output,
                SpendRecord { txid, input_index: i as u32 },
            );
        }
        st.by_fee_rate.insert((entry.fee_rate(), txid));
        st.total_tx_size += entry.tx_size() as u64;
        st.transactions_updated += 1;
        st.estimator.process_transaction(txid, &entry, current_estimate);
        st.entries.insert(txid, entry);
        debug!(%txid, "accepted transaction into pool");
        true
    }

    /// True iff none of `tx`'s inputs spend a pool-resident transaction's
    /// output — i.e. it has no unconfirmed ancestors.
    pub fn has_no_inputs_of(&self, tx: &Transaction) -> bool {
        let st = self.state.lock();
        !tx.inputs
            .iter()
            .any(|input| st.entries.contains_key(&input.previous_output.txid))
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove `tx` from the pool; with `recursive`, also every resident
    /// descendant spending its outputs (directly or transitively).
    ///
    /// Also covers the reorg case where `tx` itself is absent but pool
    /// children still claim its outputs. Removing an absent, childless
    /// transaction is a no-op. Returns the removed transactions.
    pub fn remove(&self, tx: &Transaction, recursive: bool) -> Vec<Transaction> {
        let Ok(txid) = tx.txid() else {
            debug!("cannot hash transaction for removal");
            return Vec::new();
        };
        let mut st = self.state.lock();
        st.remove_cascade(txid, recursive)
            .into_iter()
            .map(|(_, tx)| tx)
            .collect()
    }

    /// Evict (recursively) every resident transaction claiming one of
    /// `tx`'s inputs. Called before `tx` is admitted or confirmed so it
    /// holds exclusive claim to its inputs.
    pub fn remove_conflicts(&self, tx: &Transaction) -> Vec<Transaction> {
        let Ok(txid) = tx.txid() else {
            return Vec::new();
        };
        let mut st = self.state.lock();
        st.remove_conflicts_of(tx, txid)
            .into_iter()
            .map(|(_, tx)| tx)
            .collect()
    }

    /// Evict transactions spending coinbase outputs that are no longer
    /// spendable at `pool_height`: the confirming block was reorged away
    /// (coin gone from `view`) or no longer satisfies maturity.
    pub fn remove_coinbase_spends<V: CoinsView>(
        &self,
        view: &V,
        pool_height: u32,
    ) -> Vec<Transaction> {
        let mut st = self.state.lock();

        let mut to_remove = Vec::new();
        for (hash, entry) in &st.entries {
            for input in &entry.tx().inputs {
                let parent = input.previous_output.txid;
                if st.entries.contains_key(&parent) {
                    continue;
                }
                let coins = view.get_coins(&parent);
                if st.sanity_check {
                    assert!(coins.is_some(), "pool entry {hash} spends unknown coin {parent}");
                }
                let immature = coins.as_ref().is_some_and(|c| {
                    c.is_coinbase
                        && pool_height.saturating_sub(c.height) < self.config.coinbase_maturity
                });
                if coins.is_none() || immature {
                    to_remove.push(*hash);
                    break;
                }
            }
        }

        let mut removed = Vec::new();
        for hash in to_remove {
            removed.extend(
                st.remove_cascade(hash, true)
                    .into_iter()
                    .map(|(_, tx)| tx),
            );
        }
        removed
    }

    /// Process a connected block under a single lock acquisition.
    ///
    /// For each confirmed transaction: capture its entry for the
    /// estimator, remove it non-recursively, evict anything conflicting
    /// with it, and clear its prioritisation delta. The captured batch is
    /// then fed to the estimator with the block height. Returns the
    /// evicted conflicts.
    pub fn remove_for_block(
        &self,
        confirmed: &[Transaction],
        block_height: u32,
        current_estimate: bool,
    ) -> Vec<Transaction> {
        let mut st = self.state.lock();

        let pairs: Vec<(Hash256, &Transaction)> = confirmed
            .iter()
            .filter_map(|tx| tx.txid().ok().map(|txid| (txid, tx)))
            .collect();

        let mut confirmed_entries = Vec::new();
        for (txid, _) in &pairs {
            if let Some(entry) = st.entries.get(txid) {
                confirmed_entries.push((*txid, entry.clone()));
            }
        }

        let mut conflicts = Vec::new();
        for (txid, tx) in &pairs {
            st.remove_cascade(*txid, false);
            conflicts.extend(
                st.remove_conflicts_of(tx, *txid)
                    .into_iter()
                    .map(|(_, tx)| tx),
            );
            st.deltas.remove(txid);
        }

        st.estimator
            .process_block(block_height, &confirmed_entries, current_estimate);
        conflicts
    }

    /// Empty the pool entirely (reload / reorg reset).
    ///
    /// Prioritisation deltas survive; they are tied to hashes, not
    /// residency.
    pub fn clear(&self) {
        let mut st = self.state.lock();
        st.entries.clear();
        st.spends.clear();
        st.by_fee_rate.clear();
        st.total_tx_size = 0;
        st.transactions_updated += 1;
    }

    /// Trim the pool under `size_limit` bytes of modelled memory usage by
    /// evicting lowest-fee-rate entries (with their descendants), raising
    /// the rolling minimum fee above each evicted rate. Returns the
    /// evicted txids.
    pub fn trim_to_size(&self, size_limit: usize) -> Vec<Hash256> {
        self.trim_to_size_at(size_limit, Utc::now().timestamp())
    }

    fn trim_to_size_at(&self, size_limit: usize, now: i64) -> Vec<Hash256> {
        let mut st = self.state.lock();
        let mut evicted = Vec::new();
        let mut max_evicted_rate = FeeRate::ZERO;

        while st.dynamic_memory_usage() > size_limit {
            let Some(&(rate, txid)) = st.by_fee_rate.iter().next() else {
                break;
            };
            max_evicted_rate = max_evicted_rate.max(rate);
            evicted.extend(st.remove_cascade(txid, true).into_iter().map(|(hash, _)| hash));
        }

        if !evicted.is_empty() {
            let floor = max_evicted_rate
                .per_kb()
                .saturating_add(self.config.min_relay_fee_rate.per_kb());
            if (floor as f64) > st.rolling_min_fee {
                st.rolling_min_fee = floor as f64;
                st.last_rolling_fee_update = now;
            }
            info!(evicted = evicted.len(), floor, "trimmed pool to size limit");
        }
        evicted
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether `txid` is pool-resident.
    pub fn exists(&self, txid: &Hash256) -> bool {
        self.state.lock().entries.contains_key(txid)
    }

    /// The resident transaction with this txid, if any.
    pub fn lookup(&self, txid: &Hash256) -> Option<Transaction> {
        self.state.lock().entries.get(txid).map(|e| e.tx().clone())
    }

    /// The full entry record for a resident transaction.
    pub fn entry(&self, txid: &Hash256) -> Option<PoolEntry> {
        self.state.lock().entries.get(txid).cloned()
    }

    /// All resident txids, in arbitrary order.
    pub fn query_hashes(&self) -> Vec<Hash256> {
        self.state.lock().entries.keys().copied().collect()
    }

    /// Resident txids ordered by fee rate, highest first, for block
    /// template assembly.
    pub fn hashes_by_descending_fee_rate(&self) -> Vec<Hash256> {
        self.state
            .lock()
            .by_fee_rate
            .iter()
            .rev()
            .map(|&(_, txid)| txid)
            .collect()
    }

    /// Number of resident transactions.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the pool holds no transactions.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Sum of serialized sizes of all resident transactions.
    pub fn total_tx_size(&self) -> u64 {
        self.state.lock().total_tx_size
    }

    /// Modelled memory footprint of the pool, in bytes.
    pub fn dynamic_memory_usage(&self) -> usize {
        self.state.lock().dynamic_memory_usage()
    }

    /// Monotonic content-change counter.
    pub fn transactions_updated(&self) -> u64 {
        self.state.lock().transactions_updated
    }

    /// Advance the content-change counter without a content change
    /// (callers use this to force dependent caches to refresh).
    pub fn add_transactions_updated(&self, n: u64) {
        self.state.lock().transactions_updated += n;
    }

    /// Mark spent, in `coins`, every output of `txid` that a resident
    /// transaction already claims. Lets validation see a confirmed coin
    /// record net of pending pool spends.
    pub fn prune_spent(&self, txid: &Hash256, coins: &mut Coins) {
        let st = self.state.lock();
        let start = OutPoint { txid: *txid, index: 0 };
        let end = OutPoint { txid: *txid, index: u32::MAX };
        for (outpoint, _) in st.spends.range(start..=end) {
            coins.spend(outpoint.index);
        }
    }

    // ------------------------------------------------------------------
    // Prioritisation
    // ------------------------------------------------------------------

    /// Accumulate a (priority, fee) bias for `txid`, resident or not.
    /// Persists until the hash confirms; eviction for other reasons does
    /// not clear it.
    pub fn prioritise(&self, txid: Hash256, priority_delta: f64, fee_delta: i64) {
        let mut st = self.state.lock();
        let deltas = st.deltas.entry(txid).or_insert((0.0, 0));
        deltas.0 += priority_delta;
        deltas.1 += fee_delta;
        info!(%txid, priority_delta, fee_delta, "prioritised transaction");
    }

    /// Add any recorded bias for `txid` onto the caller's base values.
    /// No-op if none is recorded.
    pub fn apply_deltas(&self, txid: &Hash256, priority: &mut f64, fee: &mut i64) {
        let st = self.state.lock();
        if let Some((priority_delta, fee_delta)) = st.deltas.get(txid) {
            *priority += priority_delta;
            *fee += fee_delta;
        }
    }

    /// Drop any recorded bias for `txid`.
    pub fn clear_prioritisation(&self, txid: &Hash256) {
        self.state.lock().deltas.remove(txid);
    }

    // ------------------------------------------------------------------
    // Rolling minimum fee
    // ------------------------------------------------------------------

    /// The decaying fee floor below which transactions are not accepted
    /// or relayed.
    ///
    /// Decays exponentially since the last trim; the half-life halves
    /// when usage falls under `size_limit / 2` and quarters under
    /// `size_limit / 4`, so an emptying pool relaxes faster. Recomputed
    /// lazily, at most every 10 seconds. Once the floor falls under half
    /// the baseline relay fee it snaps to zero; otherwise the reported
    /// value is at least the baseline.
    pub fn min_fee_rate(&self, size_limit: usize) -> FeeRate {
        self.min_fee_rate_at(size_limit, Utc::now().timestamp())
    }

    fn min_fee_rate_at(&self, size_limit: usize, now: i64) -> FeeRate {
        let mut st = self.state.lock();
        if st.rolling_min_fee == 0.0 {
            return FeeRate::ZERO;
        }
        if now > st.last_rolling_fee_update + MIN_FEE_UPDATE_INTERVAL {
            let mut halflife = ROLLING_FEE_HALFLIFE as f64;
            let usage = st.dynamic_memory_usage();
            if usage < size_limit / 4 {
                halflife /= 4.0;
            } else if usage < size_limit / 2 {
                halflife /= 2.0;
            }
            let elapsed = (now - st.last_rolling_fee_update) as f64;
            st.rolling_min_fee /= 2f64.powf(elapsed / halflife);
            st.last_rolling_fee_update = now;

            if st.rolling_min_fee < (self.config.min_relay_fee_rate.per_kb() / 2) as f64 {
                st.rolling_min_fee = 0.0;
                return FeeRate::ZERO;
            }
        }
        FeeRate::from_per_kb(st.rolling_min_fee as u64).max(self.config.min_relay_fee_rate)
    }

    // ------------------------------------------------------------------
    // Estimation
    // ------------------------------------------------------------------

    /// Fee rate sufficient to confirm within `target` blocks.
    pub fn estimate_fee(&self, target: u32) -> FeeRate {
        self.state.lock().estimator.estimate_fee(target)
    }

    /// Like [`estimate_fee`](Self::estimate_fee), widening the target
    /// until an answer exists; also returns the target that answered.
    pub fn estimate_smart_fee(&self, target: u32) -> (FeeRate, u32) {
        self.state.lock().estimator.estimate_smart_fee(target)
    }

    /// Priority sufficient to confirm within `target` blocks.
    pub fn estimate_priority(&self, target: u32) -> f64 {
        self.state.lock().estimator.estimate_priority(target)
    }

    /// Smart-widening variant of [`estimate_priority`](Self::estimate_priority).
    pub fn estimate_smart_priority(&self, target: u32) -> (f64, u32) {
        self.state.lock().estimator.estimate_smart_priority(target)
    }

    /// Persist the estimator's sample history. Failure is logged and
    /// non-fatal: the caller loses nothing but future estimate quality.
    pub fn write_fee_estimates<W: Write>(&self, writer: &mut W) -> Result<(), EstimatorError> {
        let st = self.state.lock();
        st.estimator
            .write(writer)
            .inspect_err(|e| warn!(error = %e, "unable to write estimator snapshot"))
    }

    /// Load estimator history written by
    /// [`write_fee_estimates`](Self::write_fee_estimates). Up-version and
    /// corrupt files are refused, logged, and leave prior state intact.
    pub fn read_fee_estimates<R: Read>(&self, reader: &mut R) -> Result<(), EstimatorError> {
        let mut st = self.state.lock();
        st.estimator
            .read(reader)
            .inspect_err(estimator::log_load_failure)
    }

    // ------------------------------------------------------------------
    // Consistency audit
    // ------------------------------------------------------------------

    /// Audit every pool invariant against `view`. No-op unless enabled
    /// via [`set_sanity_check`](Self::set_sanity_check) — the audit is
    /// O(pool size × dependency depth).
    ///
    /// Panics on any violation: a broken spend index or drifted size
    /// total means the admission/removal logic itself is wrong, and
    /// continuing would risk double-spends in mining input.
    pub fn check<V: CoinsView>(&self, view: &V) {
        let st = self.state.lock();
        if !st.sanity_check {
            return;
        }
        debug!(
            entries = st.entries.len(),
            spends = st.spends.len(),
            "checking mempool consistency"
        );

        let mut check_total: u64 = 0;
        let mut overlay: HashMap<Hash256, Coins> = HashMap::new();
        let mut waiting: VecDeque<&PoolEntry> = VecDeque::new();

        for (hash, entry) in &st.entries {
            check_total += entry.tx_size() as u64;
            let tx = entry.tx();
            let mut depends_wait = false;
            for (i, input) in tx.inputs.iter().enumerate() {
                let prevout = &input.previous_output;
                if let Some(parent) = st.entries.get(&prevout.txid) {
                    assert!(
                        (prevout.index as usize) < parent.tx().outputs.len(),
                        "pool entry {hash} spends missing output {prevout}"
                    );
                    depends_wait = true;
                } else {
                    let coins = view.get_coins(&prevout.txid);
                    assert!(
                        coins.as_ref().is_some_and(|c| c.is_available(prevout.index)),
                        "pool entry {hash} spends unavailable coin {prevout}"
                    );
                }
                let rec = st.spends.get(prevout);
                assert!(
                    rec.is_some_and(|r| r.txid == *hash && r.input_index == i as u32),
                    "spend index does not own input {i} of {hash}"
                );
            }
            if depends_wait {
                waiting.push_back(entry);
            } else {
                Self::replay_spends(&mut overlay, view, tx);
            }
        }

        // Entries with pool-resident parents replay once those parents
        // have; a full pass without progress means a cycle or corruption.
        let mut steps_since_progress = 0usize;
        while let Some(entry) = waiting.pop_front() {
            if Self::inputs_available(&overlay, view, entry.tx()) {
                Self::replay_spends(&mut overlay, view, entry.tx());
                steps_since_progress = 0;
            } else {
                waiting.push_back(entry);
                steps_since_progress += 1;
                assert!(
                    steps_since_progress < waiting.len(),
                    "dependency cycle or corrupt spend index in mempool"
                );
            }
        }

        for (outpoint, rec) in &st.spends {
            let entry = st.entries.get(&rec.txid);
            assert!(
                entry.is_some(),
                "spend index references evicted entry {}",
                rec.txid
            );
            let tx = entry.expect("asserted above").tx();
            assert!(
                (rec.input_index as usize) < tx.inputs.len(),
                "spend index input position out of range for {}",
                rec.txid
            );
            assert_eq!(
                tx.inputs[rec.input_index as usize].previous_output, *outpoint,
                "spend index key does not match the indexed input"
            );
        }

        assert_eq!(st.total_tx_size, check_total, "pool size accounting drifted");
    }

    /// Whether every input of `tx` is available in the replay overlay or
    /// the base view.
    fn inputs_available<V: CoinsView>(
        overlay: &HashMap<Hash256, Coins>,
        base: &V,
        tx: &Transaction,
    ) -> bool {
        tx.inputs.iter().all(|input| {
            let prevout = &input.previous_output;
            match overlay.get(&prevout.txid) {
                Some(coins) => coins.is_available(prevout.index),
                None => base
                    .get_coins(&prevout.txid)
                    .is_some_and(|coins| coins.is_available(prevout.index)),
            }
        })
    }

    /// Replay `tx` onto the overlay: spend its inputs, add its outputs.
    fn replay_spends<V: CoinsView>(
        overlay: &mut HashMap<Hash256, Coins>,
        base: &V,
        tx: &Transaction,
    ) {
        for input in &tx.inputs {
            let prevout = input.previous_output;
            let coins = overlay.entry(prevout.txid).or_insert_with(|| {
                base.get_coins(&prevout.txid)
                    .expect("availability checked before replay")
            });
            assert!(
                coins.spend(prevout.index),
                "double spend surfaced during mempool replay at {prevout}"
            );
        }
        let txid = tx.txid().expect("pool transactions serialize");
        overlay.insert(txid, Coins::from_tx(tx, MEMPOOL_HEIGHT));
    }
}
