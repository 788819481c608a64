//! # tarn-core
//! Foundation types for the Tarn unconfirmed-transaction pool.

pub mod coins;
pub mod constants;
pub mod error;
pub mod fee_rate;
pub mod types;
