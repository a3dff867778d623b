//! NDR encoding/decoding context
//!
//! The context carries the per-call codec configuration: byte order, the
//! width of counts and referent ids on the wire, and the resource limits
//! applied to untrusted input.

/// Width of conformance and variance counts (max-count, offset, actual-count)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeWidth {
    U32,
    U64,
}

impl SizeWidth {
    /// Size in bytes, which is also the alignment
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            SizeWidth::U32 => 4,
            SizeWidth::U64 => 8,
        }
    }
}

/// Width of pointer referent ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    U32,
    U64,
}

impl PointerWidth {
    /// Size in bytes, which is also the alignment
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            PointerWidth::U32 => 4,
            PointerWidth::U64 => 8,
        }
    }
}

/// Wire widths for the variable-sized parts of NDR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    pub size_width: SizeWidth,
    pub pointer_width: PointerWidth,
}

impl WireFormat {
    /// Classic NDR (transfer syntax 8a885d04-...): 32-bit counts and referents
    pub const NDR20: Self = Self {
        size_width: SizeWidth::U32,
        pointer_width: PointerWidth::U32,
    };

    /// NDR64: 64-bit counts and referents
    pub const NDR64: Self = Self {
        size_width: SizeWidth::U64,
        pointer_width: PointerWidth::U64,
    };

    /// 64-bit counts with 32-bit referents
    pub const MIXED: Self = Self {
        size_width: SizeWidth::U64,
        pointer_width: PointerWidth::U32,
    };
}

impl Default for WireFormat {
    fn default() -> Self {
        Self::MIXED
    }
}

/// Resource limits applied while decoding untrusted input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of elements in any single array or string
    pub max_elements: usize,
    /// Maximum nesting depth of deferred pointer bodies
    pub max_depth: usize,
}

impl Limits {
    pub const DEFAULT_MAX_ELEMENTS: usize = 1 << 24;
    pub const DEFAULT_MAX_DEPTH: usize = 256;
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_elements: Self::DEFAULT_MAX_ELEMENTS,
            max_depth: Self::DEFAULT_MAX_DEPTH,
        }
    }
}

/// NDR encoding/decoding context
///
/// Cheap to copy; every writer and reader holds its own copy for the
/// duration of one marshal or unmarshal call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdrContext {
    /// Whether to use little-endian byte order
    pub little_endian: bool,
    /// Count and referent widths
    pub format: WireFormat,
    /// Limits on untrusted counts
    pub limits: Limits,
}

impl NdrContext {
    /// Create a new NDR context with little-endian byte order (default)
    pub fn new() -> Self {
        Self {
            little_endian: true,
            format: WireFormat::default(),
            limits: Limits::default(),
        }
    }

    /// Create a context with big-endian byte order
    pub fn big_endian() -> Self {
        Self::with_byte_order(false)
    }

    /// Create a context with specified byte order
    pub fn with_byte_order(little_endian: bool) -> Self {
        Self {
            little_endian,
            ..Self::new()
        }
    }

    /// Little-endian context using 32-bit counts and referents
    pub fn ndr20() -> Self {
        Self::new().with_format(WireFormat::NDR20)
    }

    /// Little-endian context using 64-bit counts and referents
    pub fn ndr64() -> Self {
        Self::new().with_format(WireFormat::NDR64)
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Alignment of a referent id
    #[inline]
    pub fn pointer_align(&self) -> usize {
        self.format.pointer_width.bytes()
    }

    /// Alignment of a conformance or variance count
    #[inline]
    pub fn size_align(&self) -> usize {
        self.format.size_width.bytes()
    }

    /// Calculate padding needed to align to the given boundary
    #[inline]
    pub fn align_padding(position: usize, alignment: usize) -> usize {
        if alignment == 0 || alignment == 1 {
            return 0;
        }
        let remainder = position % alignment;
        if remainder == 0 {
            0
        } else {
            alignment - remainder
        }
    }
}

impl Default for NdrContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_padding() {
        assert_eq!(NdrContext::align_padding(0, 4), 0);
        assert_eq!(NdrContext::align_padding(1, 4), 3);
        assert_eq!(NdrContext::align_padding(2, 4), 2);
        assert_eq!(NdrContext::align_padding(3, 4), 1);
        assert_eq!(NdrContext::align_padding(4, 4), 0);
        assert_eq!(NdrContext::align_padding(5, 8), 3);
        assert_eq!(NdrContext::align_padding(0, 1), 0);
        assert_eq!(NdrContext::align_padding(5, 1), 0);
    }

    #[test]
    fn test_default_format() {
        let ctx = NdrContext::default();
        assert!(ctx.little_endian);
        assert_eq!(ctx.size_align(), 8);
        assert_eq!(ctx.pointer_align(), 4);

        let ctx = NdrContext::ndr20();
        assert_eq!(ctx.size_align(), 4);
        assert_eq!(ctx.pointer_align(), 4);

        let ctx = NdrContext::ndr64();
        assert_eq!(ctx.size_align(), 8);
        assert_eq!(ctx.pointer_align(), 8);
    }

    #[test]
    fn test_builder_keeps_other_settings() {
        let limits = Limits {
            max_elements: 16,
            max_depth: 4,
        };
        let ctx = NdrContext::big_endian().with_limits(limits).with_format(WireFormat::NDR20);
        assert!(!ctx.little_endian);
        assert_eq!(ctx.limits, limits);
        assert_eq!(ctx.format, WireFormat::NDR20);
    }
}
