//! DNSP error types

use thiserror::Error;

/// Result type for DNSP record operations
pub type Result<T> = std::result::Result<T, DnspError>;

/// DNSP-specific errors
#[derive(Error, Debug)]
pub enum DnspError {
    /// Underlying NDR codec error
    #[error("NDR error: {0}")]
    Ndr(#[from] msrpc_ndr::NdrError),

    /// Node name or text longer than its 8-bit length prefix allows
    #[error("name too long: {len} bytes, at most 255")]
    NameTooLong { len: usize },

    /// IP address record data that is neither 4 nor 16 bytes
    #[error("invalid address length: {0} bytes")]
    InvalidAddress(usize),

    /// Record data does not belong to the requested record type
    #[error("record type mismatch: record is type {record_type}, data is type {data_type}")]
    RecordTypeMismatch { record_type: u16, data_type: u16 },
}
