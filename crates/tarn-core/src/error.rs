//! Error types for the Tarn pool subsystem.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("serialization: {0}")] Serialization(String),
}

/// Failures while persisting or loading the fee-estimator snapshot.
///
/// All of these are recoverable: a node that cannot read its snapshot
/// starts with an empty estimator and degrades estimate quality only.
#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error("snapshot codec: {0}")] Codec(String),
    #[error("snapshot requires client version {required}, running {supported}")] UpVersion { required: u32, supported: u32 },
    #[error("corrupt sample: {0}")] CorruptSample(String),
}
