//! NDR error types

use thiserror::Error;

/// NDR encoding/decoding errors
///
/// Every variant is recoverable: a malformed peer message fails the one call
/// that is decoding it and nothing else.
#[derive(Debug, Error)]
pub enum NdrError {
    /// Buffer exhausted before a required read completed
    #[error("truncated input at offset {offset}: needed {needed} bytes, have {have}")]
    Truncated {
        needed: usize,
        have: usize,
        offset: usize,
    },

    /// A declared or inherited element count would read past the buffer
    #[error("buffer overflow at offset {offset}: count {count} exceeds {remaining} remaining bytes")]
    BufferOverflow {
        count: u64,
        remaining: usize,
        offset: usize,
    },

    /// A count or length exceeds a protocol-defined maximum
    #[error("{what} out of range: {value} exceeds maximum {max}")]
    Range {
        what: &'static str,
        value: u64,
        max: u64,
    },

    /// Union discriminant with no registered arm
    #[error("unsupported union variant: discriminant {0}")]
    UnsupportedVariant(u32),

    /// Union discriminant on the wire disagrees with the enclosing switch field
    #[error("union discriminant mismatch: switch field says {expected}, wire says {found}")]
    DiscriminantMismatch { expected: u32, found: u32 },

    /// Referent id reused inconsistently, or a deferred body is missing
    #[error("protocol violation for referent 0x{referent:08x}: {reason}")]
    ProtocolViolation { referent: u64, reason: &'static str },

    /// Invalid string - non-zero offset or invalid encoding
    #[error("invalid string: {0}")]
    InvalidString(String),

    /// Dynamic value does not match its declared layout
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Size arithmetic overflowed
    #[error("integer overflow in size computation")]
    IntegerOverflow,

    /// Element count above the configured allocation ceiling
    #[error("allocation limit exceeded: requested {requested} elements, limit {limit}")]
    AllocationLimit { requested: u64, limit: usize },

    /// Error raised while processing a named field
    #[error("{field}: {source}")]
    Field {
        field: String,
        #[source]
        source: Box<NdrError>,
    },
}

impl NdrError {
    /// The innermost error, with all field context stripped
    pub fn root(&self) -> &NdrError {
        match self {
            NdrError::Field { source, .. } => source.root(),
            other => other,
        }
    }

    /// Byte offset at which the error was detected, if known
    pub fn offset(&self) -> Option<usize> {
        match self.root() {
            NdrError::Truncated { offset, .. } | NdrError::BufferOverflow { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Input that runs out inside a deferred pointer body means the body
    /// the referent announced is not all there. Reported as a protocol
    /// violation for `referent`, keeping the field path.
    pub(crate) fn in_deferred_body(self, referent: u64) -> Self {
        match self {
            NdrError::Field { field, source } => NdrError::Field {
                field,
                source: Box::new(source.in_deferred_body(referent)),
            },
            NdrError::Truncated { .. } => NdrError::ProtocolViolation {
                referent,
                reason: "deferred referent body truncated",
            },
            other => other,
        }
    }

    /// Field path from the outermost record down to the failing field
    pub fn field_path(&self) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = self;
        while let NdrError::Field { field, source } = current {
            path.push(field.as_str());
            current = source;
        }
        path
    }
}

/// Attach field context to an NDR result
pub trait ResultExt<T> {
    fn field(self, name: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn field(self, name: &str) -> Result<T> {
        self.map_err(|source| NdrError::Field {
            field: name.to_string(),
            source: Box::new(source),
        })
    }
}

/// Result type for NDR operations
pub type Result<T> = std::result::Result<T, NdrError>;
