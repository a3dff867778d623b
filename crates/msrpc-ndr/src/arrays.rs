//! NDR array types
//!
//! NDR supports several array types:
//!
//! - Fixed arrays: size known at compile time, elements only
//! - Conformant arrays: maximum count prefix, then elements
//! - Varying arrays: offset and actual count prefix, then elements
//! - Conformant varying arrays: maximum count, offset, actual count
//!
//! Counts are written in the context's size width. A conformant array that
//! ends a structure has its maximum count hoisted to the start of that
//! structure; the structure writes it with [`NdrWriter::write_conformance`]
//! and hands it down as inherited size information.

use tracing::{trace, warn};

use crate::{
    NdrDecode, NdrDecodeOwned, NdrEncode, NdrError, NdrReader, NdrWriter, Result, SizeWidth,
};

/// Conformance counts handed from a structure to the conformant array it
/// ends, one per dimension.
pub type SizeInfo = Vec<u64>;

/// Length to encode for a derived count field: the declared value, or the
/// live length when the field was left at zero.
#[inline]
pub fn backfill(declared: u64, live: usize) -> u64 {
    if declared == 0 {
        live as u64
    } else {
        declared
    }
}

impl<'a> NdrWriter<'a> {
    /// Write one conformance or variance count
    pub fn write_size(&mut self, count: u64) -> Result<()> {
        match self.context().format.size_width {
            SizeWidth::U32 => {
                let count = u32::try_from(count).map_err(|_| NdrError::Range {
                    what: "array count",
                    value: count,
                    max: u64::from(u32::MAX),
                })?;
                self.write_u32(count);
            }
            SizeWidth::U64 => self.write_u64(count),
        }
        Ok(())
    }

    /// Run `f` with `sizes` available to the first nested conformant array.
    /// The sizes are dropped when `f` returns, consumed or not.
    pub fn with_inherited_size<R>(&mut self, sizes: SizeInfo, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let outer = self.inherited.replace(sizes);
        let result = f(self);
        self.inherited = outer;
        result
    }

    pub fn take_inherited_size(&mut self) -> Option<SizeInfo> {
        self.inherited.take()
    }

    /// Hoisted conformance at the start of a conformant structure. Sizes
    /// inherited from an enclosing structure were already written and are
    /// passed through unchanged.
    pub fn write_conformance(&mut self, sizes: SizeInfo) -> Result<SizeInfo> {
        if let Some(inherited) = self.take_inherited_size() {
            return Ok(inherited);
        }
        for &count in &sizes {
            self.write_size(count)?;
        }
        Ok(sizes)
    }

    pub(crate) fn check_encode_count(&self, count: u64) -> Result<usize> {
        let limit = self.context().limits.max_elements;
        usize::try_from(count)
            .ok()
            .filter(|&n| n <= limit)
            .ok_or(NdrError::AllocationLimit {
                requested: count,
                limit,
            })
    }

    /// Exactly `count` elements: surplus items are dropped and missing ones
    /// are filled with `T::default()`.
    pub fn write_fixed_array<T>(&mut self, items: &'a [T], count: u64) -> Result<()>
    where
        T: NdrEncode + Default,
    {
        let count = self.check_encode_count(count)?;
        for item in items.iter().take(count) {
            item.ndr_encode(self)?;
        }
        for _ in items.len()..count {
            self.write_default::<T>()?;
        }
        Ok(())
    }

    fn write_default<T: NdrEncode + Default>(&mut self) -> Result<()> {
        let filler = T::default();
        let mut scratch = self.scratch();
        filler.ndr_encode(&mut scratch)?;
        scratch.flush_deferred()?;
        self.append(scratch.as_bytes());
        Ok(())
    }

    /// Conformant array. A `declared` count of zero is taken from the live
    /// length; inherited sizes replace the count prefix.
    pub fn write_conformant_array<T>(&mut self, items: &'a [T], declared: u64) -> Result<()>
    where
        T: NdrEncode + Default,
    {
        let count = match self.take_inherited_size() {
            Some(sizes) => sizes.first().copied().unwrap_or(0),
            None => {
                let count = backfill(declared, items.len());
                self.write_size(count)?;
                count
            }
        };
        self.write_fixed_array(items, count)
    }

    /// Varying array of capacity `capacity`: offset 0, actual count, elements
    pub fn write_varying_array<T>(&mut self, items: &'a [T], capacity: u64) -> Result<()>
    where
        T: NdrEncode + Default,
    {
        let actual = items.len() as u64;
        if actual > capacity {
            return Err(NdrError::Range {
                what: "varying array count",
                value: actual,
                max: capacity,
            });
        }
        self.write_size(0)?;
        self.write_size(actual)?;
        self.write_fixed_array(items, actual)
    }

    /// Conformant varying array: maximum count, offset 0, actual count, elements
    pub fn write_conformant_varying_array<T>(&mut self, items: &'a [T], max_count: u64) -> Result<()>
    where
        T: NdrEncode + Default,
    {
        let max_count = match self.take_inherited_size() {
            Some(sizes) => sizes.first().copied().unwrap_or(0),
            None => {
                let max_count = backfill(max_count, items.len());
                self.write_size(max_count)?;
                max_count
            }
        };
        self.write_varying_array(items, max_count)
    }
}

impl<'a> NdrReader<'a> {
    /// Read one conformance or variance count
    pub fn read_size(&mut self) -> Result<u64> {
        match self.context().format.size_width {
            SizeWidth::U32 => self.read_u32().map(u64::from),
            SizeWidth::U64 => self.read_u64(),
        }
    }

    /// Run `f` with `sizes` available to the first nested conformant array.
    /// The sizes are dropped when `f` returns, consumed or not.
    pub fn with_inherited_size<R>(&mut self, sizes: SizeInfo, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let outer = self.inherited.replace(sizes);
        let result = f(self);
        self.inherited = outer;
        result
    }

    pub fn take_inherited_size(&mut self) -> Option<SizeInfo> {
        self.inherited.take()
    }

    pub(crate) fn replace_inherited_size(&mut self, sizes: Option<SizeInfo>) -> Option<SizeInfo> {
        std::mem::replace(&mut self.inherited, sizes)
    }

    /// Hoisted conformance of a structure with `dimensions` conformant
    /// dimensions, or the sizes inherited from the enclosing structure.
    pub fn read_conformance(&mut self, dimensions: usize) -> Result<SizeInfo> {
        if let Some(inherited) = self.take_inherited_size() {
            return Ok(inherited);
        }
        (0..dimensions).map(|_| self.read_size()).collect()
    }

    /// Bound an untrusted element count by the bytes left in the message and
    /// by the allocation limit, before anything is allocated.
    pub fn check_count(&self, count: u64, min_element_size: usize) -> Result<usize> {
        let remaining = self.remaining();
        let needed = count.saturating_mul(min_element_size.max(1) as u64);
        if needed > remaining as u64 {
            warn!(count, remaining, offset = self.position(), "array count exceeds buffer");
            return Err(NdrError::BufferOverflow {
                count,
                remaining,
                offset: self.position(),
            });
        }
        let limit = self.context().limits.max_elements;
        usize::try_from(count)
            .ok()
            .filter(|&n| n <= limit)
            .ok_or(NdrError::AllocationLimit {
                requested: count,
                limit,
            })
    }

    /// Reconcile a count read from the wire with the record's declared
    /// length field. The larger of the two wins, subject to [`check_count`].
    ///
    /// [`check_count`]: NdrReader::check_count
    pub fn resolve_count(&self, wire: u64, declared: u64, min_element_size: usize) -> Result<usize> {
        if declared != 0 && declared != wire {
            trace!(wire, declared, "array count disagrees with length field");
        }
        self.check_count(wire.max(declared), min_element_size)
    }

    /// Decode `count` elements in place, replacing the contents of `slot`
    pub fn read_elements<T>(&mut self, slot: &'a mut Vec<T>, count: usize) -> Result<()>
    where
        T: NdrDecode + Default,
    {
        slot.clear();
        slot.resize_with(count, T::default);
        for item in slot.iter_mut() {
            item.ndr_decode(self)?;
        }
        Ok(())
    }

    /// Decode `count` owned elements
    pub fn read_vec<T: NdrDecodeOwned>(&mut self, count: usize) -> Result<Vec<T>> {
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::ndr_decode_owned(self)?);
        }
        Ok(items)
    }

    pub(crate) fn conformant_count(&mut self, declared: u64, min_element_size: usize) -> Result<usize> {
        let wire = match self.take_inherited_size() {
            Some(sizes) => sizes.first().copied().unwrap_or(0),
            None => self.read_size()?,
        };
        self.resolve_count(wire, declared, min_element_size)
    }

    /// Conformant array; see [`resolve_count`](NdrReader::resolve_count)
    /// for how `declared` is used.
    pub fn read_conformant_array<T>(&mut self, slot: &'a mut Vec<T>, declared: u64) -> Result<()>
    where
        T: NdrDecode + Default,
    {
        let count = self.conformant_count(declared, T::ndr_min_size())?;
        self.read_elements(slot, count)
    }

    /// Conformant array of owned elements
    pub fn read_conformant_vec<T>(&mut self, declared: u64) -> Result<Vec<T>>
    where
        T: NdrDecodeOwned + NdrDecode,
    {
        let count = self.conformant_count(declared, T::ndr_min_size())?;
        self.read_vec(count)
    }

    /// Offset and actual count of a varying array with the given capacity
    pub fn read_variance(&mut self, capacity: u64, min_element_size: usize) -> Result<usize> {
        let offset = self.read_size()?;
        if offset != 0 {
            return Err(NdrError::Range {
                what: "varying array offset",
                value: offset,
                max: 0,
            });
        }
        let actual = self.read_size()?;
        if actual > capacity {
            warn!(actual, capacity, "varying array count above capacity");
            return Err(NdrError::Range {
                what: "varying array count",
                value: actual,
                max: capacity,
            });
        }
        self.check_count(actual, min_element_size)
    }

    pub fn read_varying_array<T>(&mut self, slot: &'a mut Vec<T>, capacity: u64) -> Result<()>
    where
        T: NdrDecode + Default,
    {
        let count = self.read_variance(capacity, T::ndr_min_size())?;
        self.read_elements(slot, count)
    }

    /// Conformant varying array; returns the maximum count
    pub fn read_conformant_varying_array<T>(&mut self, slot: &'a mut Vec<T>) -> Result<u64>
    where
        T: NdrDecode + Default,
    {
        let max_count = match self.take_inherited_size() {
            Some(sizes) => sizes.first().copied().unwrap_or(0),
            None => self.read_size()?,
        };
        let count = self.read_variance(max_count, T::ndr_min_size())?;
        self.read_elements(slot, count)?;
        Ok(max_count)
    }
}

/// Fixed-size array
///
/// Wire format: just the elements (no size prefix)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedArray<T, const N: usize> {
    pub elements: [T; N],
}

impl<T: Default, const N: usize> Default for FixedArray<T, N> {
    fn default() -> Self {
        Self {
            elements: std::array::from_fn(|_| T::default()),
        }
    }
}

impl<T, const N: usize> FixedArray<T, N> {
    pub fn new(elements: [T; N]) -> Self {
        Self { elements }
    }
}

impl<T: NdrEncode, const N: usize> NdrEncode for FixedArray<T, N> {
    fn ndr_prepare(&mut self) -> Result<()> {
        self.elements.iter_mut().try_for_each(NdrEncode::ndr_prepare)
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        for elem in &self.elements {
            elem.ndr_encode(w)?;
        }
        Ok(())
    }
}

impl<T: NdrDecode, const N: usize> NdrDecode for FixedArray<T, N> {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        for elem in self.elements.iter_mut() {
            elem.ndr_decode(r)?;
        }
        Ok(())
    }

    fn ndr_min_size() -> usize {
        T::ndr_min_size() * N
    }
}

/// Conformant array - size determined at runtime
///
/// Wire format:
/// ```text
/// max_count: size     # Maximum elements
/// elements[max_count] # Element data
/// ```
///
/// In struct context, max_count is at struct start while the elements are
/// at the end (conformant data comes last).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConformantArray<T> {
    pub elements: Vec<T>,
}

impl<T> ConformantArray<T> {
    pub fn new(elements: Vec<T>) -> Self {
        Self { elements }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<T> From<Vec<T>> for ConformantArray<T> {
    fn from(elements: Vec<T>) -> Self {
        Self { elements }
    }
}

impl<T: NdrEncode + Default> NdrEncode for ConformantArray<T> {
    fn ndr_prepare(&mut self) -> Result<()> {
        self.elements.iter_mut().try_for_each(NdrEncode::ndr_prepare)
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_conformant_array(&self.elements, 0)
    }
}

impl<T: NdrDecode + Default> NdrDecode for ConformantArray<T> {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        r.read_conformant_array(&mut self.elements, 0)
    }
}

/// Varying array - subset of a fixed-capacity array transmitted
///
/// Wire format:
/// ```text
/// offset: size       # First transmitted element (always 0)
/// actual_count: size # Number of transmitted elements
/// elements[actual_count]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaryingArray<T, const N: usize> {
    pub elements: Vec<T>,
}

impl<T, const N: usize> Default for VaryingArray<T, N> {
    fn default() -> Self {
        Self { elements: Vec::new() }
    }
}

impl<T, const N: usize> VaryingArray<T, N> {
    pub fn new(elements: Vec<T>) -> Self {
        Self { elements }
    }
}

impl<T: NdrEncode + Default, const N: usize> NdrEncode for VaryingArray<T, N> {
    fn ndr_prepare(&mut self) -> Result<()> {
        self.elements.iter_mut().try_for_each(NdrEncode::ndr_prepare)
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_varying_array(&self.elements, N as u64)
    }
}

impl<T: NdrDecode + Default, const N: usize> NdrDecode for VaryingArray<T, N> {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        r.read_varying_array(&mut self.elements, N as u64)
    }
}

/// Conformant varying array - size and subset determined at runtime
///
/// Wire format:
/// ```text
/// max_count: size    # Maximum elements (conformance)
/// offset: size       # First transmitted element (always 0)
/// actual_count: size # Number of transmitted elements
/// elements[actual_count]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConformantVaryingArray<T> {
    /// Capacity; zero means "as many as there are elements"
    pub max_count: u64,
    pub elements: Vec<T>,
}

impl<T> ConformantVaryingArray<T> {
    pub fn new(elements: Vec<T>) -> Self {
        Self {
            max_count: elements.len() as u64,
            elements,
        }
    }

    pub fn with_max(max_count: u64, elements: Vec<T>) -> Self {
        Self { max_count, elements }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<T: NdrEncode + Default> NdrEncode for ConformantVaryingArray<T> {
    fn ndr_prepare(&mut self) -> Result<()> {
        self.max_count = backfill(self.max_count, self.elements.len());
        self.elements.iter_mut().try_for_each(NdrEncode::ndr_prepare)
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_conformant_varying_array(&self.elements, self.max_count)
    }
}

impl<T: NdrDecode + Default> NdrDecode for ConformantVaryingArray<T> {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        self.max_count = r.read_conformant_varying_array(&mut self.elements)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record, NdrContext};

    #[test]
    fn test_fixed_array() {
        let mut arr = FixedArray::new([1u32, 2, 3, 4]);
        let bytes = record::encode(&mut arr).unwrap();
        assert_eq!(bytes.len(), 16);

        let decoded: FixedArray<u32, 4> = record::decode(bytes).unwrap();
        assert_eq!(arr.elements, decoded.elements);
    }

    #[test]
    fn test_conformant_array() {
        let mut arr = ConformantArray::new(vec![10i32, 20, 30]);
        let bytes = record::encode(&mut arr).unwrap();
        assert_eq!(&bytes[..8], &[3, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(bytes.len(), 20);

        let decoded: ConformantArray<i32> = record::decode(bytes).unwrap();
        assert_eq!(arr.elements, decoded.elements);
    }

    #[test]
    fn test_conformant_array_ndr20() {
        let mut arr = ConformantArray::new(vec![0xABu8, 0xCD]);
        let bytes = record::encode_with(&mut arr, NdrContext::ndr20()).unwrap();
        assert_eq!(&bytes[..], &[2, 0, 0, 0, 0xAB, 0xCD]);
    }

    #[test]
    fn test_conformant_varying_array() {
        let mut arr = ConformantVaryingArray::with_max(100, vec![1u16, 2, 3, 4, 5]);
        let bytes = record::encode(&mut arr).unwrap();

        let decoded: ConformantVaryingArray<u16> = record::decode(bytes).unwrap();
        assert_eq!(decoded.max_count, 100);
        assert_eq!(decoded.elements, arr.elements);
    }

    #[test]
    fn test_conformant_varying_backfills_max() {
        let mut arr = ConformantVaryingArray::with_max(0, vec![9u8; 3]);
        let bytes = record::encode_with(&mut arr, NdrContext::ndr20()).unwrap();
        assert_eq!(arr.max_count, 3);
        assert_eq!(&bytes[..12], &[3, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn test_varying_array_capacity() {
        let mut arr: VaryingArray<u8, 2> = VaryingArray::new(vec![1, 2, 3]);
        let err = record::encode(&mut arr).unwrap_err();
        assert!(matches!(err, NdrError::Range { what: "varying array count", .. }));
    }

    #[test]
    fn test_empty_conformant_array() {
        let mut arr: ConformantArray<u32> = ConformantArray::new(vec![]);
        let bytes = record::encode_with(&mut arr, NdrContext::ndr20()).unwrap();
        assert_eq!(bytes.len(), 4); // Just max_count

        let decoded: ConformantArray<u32> = record::decode_with(bytes, NdrContext::ndr20()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_fixed_array_truncates_and_pads() {
        let items = vec![1u16, 2, 3];
        let mut w = NdrWriter::new(NdrContext::new());
        w.write_fixed_array(&items, 2).unwrap();
        assert_eq!(w.as_bytes(), &[1, 0, 2, 0]);

        let mut w = NdrWriter::new(NdrContext::new());
        w.write_u8(0xFF);
        w.write_fixed_array(&items, 5).unwrap();
        assert_eq!(
            w.as_bytes(),
            &[0xFF, 0, 1, 0, 2, 0, 3, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_count_checked_against_remaining() {
        let mut wire = vec![0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0];
        wire.extend_from_slice(&[0u8; 8]);
        let err = record::decode::<ConformantArray<u32>>(wire).unwrap_err();
        assert!(matches!(
            err,
            NdrError::BufferOverflow {
                count: 0xFFFF_FFFF,
                remaining: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_declared_count_wins_when_larger() {
        let r = NdrReader::new(vec![0u8; 16], NdrContext::new());
        assert_eq!(r.resolve_count(2, 4, 4).unwrap(), 4);
        assert_eq!(r.resolve_count(3, 0, 4).unwrap(), 3);
        assert!(r.resolve_count(2, 5, 4).is_err());
    }

    #[test]
    fn test_allocation_limit() {
        let ctx = NdrContext::new().with_limits(crate::Limits {
            max_elements: 4,
            max_depth: 8,
        });
        let r = NdrReader::new(vec![0u8; 64], ctx);
        assert!(matches!(
            r.check_count(5, 1),
            Err(NdrError::AllocationLimit { requested: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_inherited_size_is_scoped() {
        let items = [7u8, 8];
        let mut w = NdrWriter::new(NdrContext::ndr20());
        w.with_inherited_size(vec![2], |w| w.write_conformant_array(&items, 0))
            .unwrap();
        assert_eq!(w.as_bytes(), &[7, 8]);
        assert!(w.take_inherited_size().is_none());
    }
}
