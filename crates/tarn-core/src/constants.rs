//! Protocol constants. All monetary values in tarns (1 TARN = 10^8 tarns).

pub const COIN: u64 = 100_000_000;

/// Baseline relay fee rate in tarns per kilobyte.
///
/// Transactions paying less than this are not relayed under normal
/// conditions; the pool's rolling minimum fee never reports a value
/// below it (until it snaps to zero entirely).
pub const MIN_RELAY_FEE_RATE: u64 = 1_000;

/// Default number of confirmations before a coinbase output may be spent.
///
/// Deployment parameter: the pool takes the effective value through its
/// configuration rather than reading this directly.
pub const DEFAULT_COINBASE_MATURITY: u32 = 100;

/// Sentinel height marking a pool-resident (unconfirmed) transaction.
///
/// Used both as the acceptance height of entries created before their
/// chain context is known and as the height of coins synthesized from
/// pool transactions by the coins-view overlay.
pub const MEMPOOL_HEIGHT: u32 = u32::MAX;

/// Version of this client, written into persisted estimator snapshots.
pub const CLIENT_VERSION: u32 = 10_000;

/// Oldest snapshot format this client can read.
pub const ESTIMATES_MIN_VERSION: u32 = 10_000;

pub const MAX_TX_SIZE: usize = 100_000;
pub const MAX_BLOCK_SIZE: usize = 1_048_576;
