//! NDR string types
//!
//! NDR strings are conformant varying arrays of 8-bit or 16-bit code units
//! with a null terminator.
//!
//! Wire format:
//! ```text
//! max_count: size    # Maximum code units including null
//! offset: size       # Always 0
//! actual_count: size # Transmitted code units including null
//! units[actual_count]
//! ```
//!
//! A string stored in a fixed-size buffer (`char name[64]`) is a varying
//! string: the same layout without `max_count`.
//!
//! On encode the value is truncated to `max_count - 1` units (never
//! splitting a character) and a terminator is appended unless the layout
//! omits it. On decode the trailing run of nulls is stripped.

use tracing::warn;

use crate::{NdrDecode, NdrDecodeOwned, NdrEncode, NdrError, NdrReader, NdrWriter, Result};

/// Code unit width of a string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharWidth {
    /// 8-bit units, UTF-8 on the Rust side
    Narrow,
    /// 16-bit units, UTF-16
    Wide,
}

impl CharWidth {
    #[inline]
    pub fn unit_size(self) -> usize {
        match self {
            CharWidth::Narrow => 1,
            CharWidth::Wide => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminator {
    Append,
    Omit,
}

/// Declared encoding of one string field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringLayout {
    pub width: CharWidth,
    /// Declared maximum in code units, terminator included
    pub max_count: Option<u64>,
    pub terminator: Terminator,
}

impl StringLayout {
    /// `[string] char*`
    pub const NARROW: Self = Self {
        width: CharWidth::Narrow,
        max_count: None,
        terminator: Terminator::Append,
    };

    /// `[string] wchar_t*`
    pub const WIDE: Self = Self {
        width: CharWidth::Wide,
        max_count: None,
        terminator: Terminator::Append,
    };

    pub const fn with_max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    pub const fn without_terminator(mut self) -> Self {
        self.terminator = Terminator::Omit;
        self
    }

    /// Code units available for characters
    fn char_limit(&self) -> usize {
        match (self.max_count, self.terminator) {
            (Some(max), Terminator::Append) => usize::try_from(max.saturating_sub(1)).unwrap_or(usize::MAX),
            (Some(max), Terminator::Omit) => usize::try_from(max).unwrap_or(usize::MAX),
            (None, _) => usize::MAX,
        }
    }
}

/// Wire length in code units of `s`, terminator included
pub fn string_len(s: &str, width: CharWidth) -> u64 {
    let units = match width {
        CharWidth::Narrow => s.len(),
        CharWidth::Wide => s.encode_utf16().count(),
    };
    units as u64 + 1
}

/// Wire length in code units of a multi-string, both terminators included
pub fn multi_sz_len<S: AsRef<str>>(strings: &[S], width: CharWidth) -> u64 {
    strings.iter().map(|s| string_len(s.as_ref(), width)).sum::<u64>() + 1
}

enum Units {
    Narrow(Vec<u8>),
    Wide(Vec<u16>),
}

impl Units {
    fn encode(s: &str, layout: &StringLayout) -> Self {
        let limit = layout.char_limit();
        let mut units = match layout.width {
            CharWidth::Narrow => {
                let mut end = s.len().min(limit);
                while !s.is_char_boundary(end) {
                    end -= 1;
                }
                Units::Narrow(s.as_bytes()[..end].to_vec())
            }
            CharWidth::Wide => {
                let mut units: Vec<u16> = s.encode_utf16().collect();
                if units.len() > limit {
                    let mut end = limit;
                    // keep surrogate pairs whole
                    if end > 0 && (0xD800..0xDC00).contains(&units[end - 1]) {
                        end -= 1;
                    }
                    units.truncate(end);
                }
                Units::Wide(units)
            }
        };
        if layout.terminator == Terminator::Append {
            units.push_null();
        }
        units
    }

    fn empty(width: CharWidth) -> Self {
        match width {
            CharWidth::Narrow => Units::Narrow(Vec::new()),
            CharWidth::Wide => Units::Wide(Vec::new()),
        }
    }

    fn push_null(&mut self) {
        match self {
            Units::Narrow(units) => units.push(0),
            Units::Wide(units) => units.push(0),
        }
    }

    fn append(&mut self, other: Units) {
        match (self, other) {
            (Units::Narrow(a), Units::Narrow(b)) => a.extend(b),
            (Units::Wide(a), Units::Wide(b)) => a.extend(b),
            _ => {}
        }
    }

    fn len(&self) -> usize {
        match self {
            Units::Narrow(units) => units.len(),
            Units::Wide(units) => units.len(),
        }
    }

    fn write(&self, w: &mut NdrWriter<'_>) {
        match self {
            Units::Narrow(units) => w.write_bytes(units),
            Units::Wide(units) => {
                for &unit in units {
                    w.write_u16(unit);
                }
            }
        }
    }

    fn read(r: &mut NdrReader<'_>, count: usize, width: CharWidth) -> Result<Self> {
        match width {
            CharWidth::Narrow => Ok(Units::Narrow(r.read_bytes(count)?.to_vec())),
            CharWidth::Wide => r.read_vec(count).map(Units::Wide),
        }
    }

    fn into_string(self) -> Result<String> {
        match self {
            Units::Narrow(mut units) => {
                while units.last() == Some(&0) {
                    units.pop();
                }
                String::from_utf8(units).map_err(|e| NdrError::InvalidString(e.to_string()))
            }
            Units::Wide(mut units) => {
                while units.last() == Some(&0) {
                    units.pop();
                }
                String::from_utf16(&units).map_err(|e| NdrError::InvalidString(e.to_string()))
            }
        }
    }

    /// Split on nulls; the list ends at the first empty string
    fn into_strings(self) -> Result<Vec<String>> {
        let parts: Vec<Units> = match self {
            Units::Narrow(units) => units.split(|u| *u == 0).map(|p| Units::Narrow(p.to_vec())).collect(),
            Units::Wide(units) => units.split(|u| *u == 0).map(|p| Units::Wide(p.to_vec())).collect(),
        };
        parts
            .into_iter()
            .take_while(|p| p.len() > 0)
            .map(Units::into_string)
            .collect()
    }
}

/// Truncated code units of `s`. A maximum too small to hold even the
/// terminator is a range error.
fn bounded_units(s: &str, layout: &StringLayout) -> Result<Units> {
    let units = Units::encode(s, layout);
    match layout.max_count {
        Some(max) if units.len() as u64 > max => Err(NdrError::Range {
            what: "string length",
            value: units.len() as u64,
            max,
        }),
        _ => Ok(units),
    }
}

impl<'a> NdrWriter<'a> {
    /// Conformant varying string: `(max, 0, actual)` then the code units
    pub fn write_string(&mut self, s: &str, layout: StringLayout) -> Result<()> {
        let units = bounded_units(s, &layout)?;
        let actual = units.len() as u64;
        self.write_size(layout.max_count.unwrap_or(actual))?;
        self.write_size(0)?;
        self.write_size(actual)?;
        units.write(self);
        Ok(())
    }

    /// Varying string in a fixed buffer of `layout.max_count` units:
    /// `(0, actual)` then the code units
    pub fn write_varying_string(&mut self, s: &str, layout: StringLayout) -> Result<()> {
        let units = bounded_units(s, &layout)?;
        self.write_size(0)?;
        self.write_size(units.len() as u64)?;
        units.write(self);
        Ok(())
    }

    /// `MULTI_SZ`: each string null-terminated, the list closed by one more
    /// null. Unlike single strings, a list over its maximum is rejected.
    pub fn write_multi_sz<S: AsRef<str>>(&mut self, strings: &[S], layout: StringLayout) -> Result<()> {
        let mut units = Units::empty(layout.width);
        let each = StringLayout {
            max_count: None,
            terminator: Terminator::Append,
            ..layout
        };
        for s in strings {
            units.append(Units::encode(s.as_ref(), &each));
        }
        units.push_null();

        let actual = units.len() as u64;
        let max = layout.max_count.unwrap_or(actual);
        if actual > max {
            return Err(NdrError::Range {
                what: "multi-string length",
                value: actual,
                max,
            });
        }
        self.write_size(max)?;
        self.write_size(0)?;
        self.write_size(actual)?;
        units.write(self);
        Ok(())
    }
}

impl<'a> NdrReader<'a> {
    fn read_string_units(&mut self, max: u64, width: CharWidth) -> Result<Units> {
        let offset = self.read_size()?;
        if offset != 0 {
            warn!(offset, "string with non-zero offset");
            return Err(NdrError::InvalidString(format!("non-zero offset {}", offset)));
        }
        let actual = self.read_size()?;
        if actual > max {
            warn!(actual, max, "string longer than its maximum count");
            return Err(NdrError::Range {
                what: "string length",
                value: actual,
                max,
            });
        }
        let count = self.check_count(actual, width.unit_size())?;
        Units::read(self, count, width)
    }

    /// Conformant varying string
    pub fn read_string(&mut self, layout: StringLayout) -> Result<String> {
        let max = self.read_size()?;
        self.read_string_units(max, layout.width)?.into_string()
    }

    /// Varying string in a fixed buffer; the buffer size is the bound
    pub fn read_varying_string(&mut self, layout: StringLayout) -> Result<String> {
        let max = layout.max_count.unwrap_or(u64::MAX);
        self.read_string_units(max, layout.width)?.into_string()
    }

    pub fn read_multi_sz(&mut self, layout: StringLayout) -> Result<Vec<String>> {
        let max = self.read_size()?;
        self.read_string_units(max, layout.width)?.into_strings()
    }
}

/// ANSI string type (null-terminated char*)
///
/// Used for [string] annotated char* parameters in MIDL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NdrString(pub String);

impl NdrString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for NdrString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for NdrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl NdrEncode for NdrString {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_string(&self.0, StringLayout::NARROW)
    }
}

impl NdrDecodeOwned for NdrString {
    fn ndr_decode_owned(r: &mut NdrReader<'_>) -> Result<Self> {
        r.read_string(StringLayout::NARROW).map(Self)
    }
}

impl NdrDecode for NdrString {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        self.0 = r.read_string(StringLayout::NARROW)?;
        Ok(())
    }
}

/// Unicode string type (null-terminated wchar_t*)
///
/// Used for [string] annotated wchar_t* parameters in MIDL.
/// Encoded as UTF-16 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NdrWString(pub String);

impl NdrWString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for NdrWString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for NdrWString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl NdrEncode for NdrWString {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_string(&self.0, StringLayout::WIDE)
    }
}

impl NdrDecodeOwned for NdrWString {
    fn ndr_decode_owned(r: &mut NdrReader<'_>) -> Result<Self> {
        r.read_string(StringLayout::WIDE).map(Self)
    }
}

impl NdrDecode for NdrWString {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        self.0 = r.read_string(StringLayout::WIDE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record, NdrContext};

    #[test]
    fn test_ndr_string_roundtrip() {
        let mut s = NdrString::new("Hello, World!");
        let bytes = record::encode(&mut s).unwrap();
        let decoded: NdrString = record::decode(bytes).unwrap();
        assert_eq!(s, decoded);
    }

    #[test]
    fn test_ndr_wstring_wire_layout() {
        let mut s = NdrWString::new("Hi");
        let bytes = record::encode_with(&mut s, NdrContext::ndr20()).unwrap();
        assert_eq!(
            &bytes[..],
            &[
                3, 0, 0, 0, // max_count
                0, 0, 0, 0, // offset
                3, 0, 0, 0, // actual_count
                b'H', 0, b'i', 0, 0, 0,
            ]
        );
    }

    #[test]
    fn test_ndr_wstring_unicode() {
        let mut s = NdrWString::new("Hello\u{00e9}\u{1F600}");
        let bytes = record::encode(&mut s).unwrap();
        let decoded: NdrWString = record::decode(bytes).unwrap();
        assert_eq!(s.0, decoded.0);
    }

    #[test]
    fn test_empty_string() {
        let mut s = NdrString::new("");
        let bytes = record::encode_with(&mut s, NdrContext::ndr20()).unwrap();
        // max_count=1, offset=0, actual_count=1 for the null terminator
        assert_eq!(bytes.len(), 13);

        let decoded: NdrString = record::decode_with(bytes, NdrContext::ndr20()).unwrap();
        assert_eq!(decoded.0, "");
    }

    #[test]
    fn test_truncate_to_max_count() {
        let mut w = NdrWriter::new(NdrContext::ndr20());
        w.write_string("abcdefghij", StringLayout::WIDE.with_max_count(5))
            .unwrap();
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..12], &[5, 0, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0]);
        assert_eq!(bytes.len(), 12 + 10);

        let mut r = NdrReader::new(bytes, NdrContext::ndr20());
        assert_eq!(r.read_string(StringLayout::WIDE).unwrap(), "abcd");
    }

    #[test]
    fn test_truncate_keeps_characters_whole() {
        let mut w = NdrWriter::new(NdrContext::ndr20());
        w.write_string("a\u{00e9}", StringLayout::NARROW.with_max_count(3))
            .unwrap();
        // 'é' is two bytes and does not fit in two units
        assert_eq!(&w.as_bytes()[8..], &[2, 0, 0, 0, b'a', 0]);

        let mut w = NdrWriter::new(NdrContext::ndr20());
        w.write_string("a\u{1F600}", StringLayout::WIDE.with_max_count(3))
            .unwrap();
        assert_eq!(&w.as_bytes()[8..], &[2, 0, 0, 0, b'a', 0, 0, 0]);
    }

    #[test]
    fn test_zero_max_count_cannot_hold_terminator() {
        let mut w = NdrWriter::new(NdrContext::ndr20());
        let err = w.write_string("abc", StringLayout::NARROW.with_max_count(0)).unwrap_err();
        assert!(matches!(err, NdrError::Range { value: 1, max: 0, .. }));
        let err = w
            .write_varying_string("", StringLayout::WIDE.with_max_count(0))
            .unwrap_err();
        assert!(matches!(err, NdrError::Range { value: 1, max: 0, .. }));
        assert!(w.is_empty());

        w.write_string("abc", StringLayout::NARROW.with_max_count(0).without_terminator())
            .unwrap();
        assert_eq!(w.as_bytes(), &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_omitted_terminator() {
        let mut w = NdrWriter::new(NdrContext::ndr20());
        w.write_string("abc", StringLayout::NARROW.without_terminator())
            .unwrap();
        assert_eq!(&w.as_bytes()[..], &[3, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_varying_string_in_fixed_buffer() {
        let layout = StringLayout::NARROW.with_max_count(4);
        let mut w = NdrWriter::new(NdrContext::ndr20());
        w.write_varying_string("zone.local", layout).unwrap();
        assert_eq!(&w.as_bytes()[..], &[0, 0, 0, 0, 4, 0, 0, 0, b'z', b'o', b'n', 0]);

        let mut r = NdrReader::new(w.into_bytes(), NdrContext::ndr20());
        assert_eq!(r.read_varying_string(layout).unwrap(), "zon");
    }

    #[test]
    fn test_strip_terminator_run() {
        let wire = vec![5, 0, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0, b'a', b'b', 0, 0, 0];
        let mut r = NdrReader::new(wire, NdrContext::ndr20());
        assert_eq!(r.read_string(StringLayout::NARROW).unwrap(), "ab");
    }

    #[test]
    fn test_reject_bad_headers() {
        let wire = vec![2, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, b'a', b'b', 0];
        let mut r = NdrReader::new(wire, NdrContext::ndr20());
        assert!(matches!(r.read_string(StringLayout::NARROW), Err(NdrError::Range { .. })));

        let wire = vec![3, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, b'a', 0];
        let mut r = NdrReader::new(wire, NdrContext::ndr20());
        assert!(matches!(r.read_string(StringLayout::NARROW), Err(NdrError::InvalidString(_))));

        let wire = vec![9, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, b'a', 0];
        let mut r = NdrReader::new(wire, NdrContext::ndr20());
        assert!(matches!(r.read_string(StringLayout::WIDE), Err(NdrError::BufferOverflow { .. })));
    }

    #[test]
    fn test_multi_sz() {
        let names = ["a", "bc"];
        assert_eq!(multi_sz_len(&names, CharWidth::Wide), 6);

        let mut w = NdrWriter::new(NdrContext::ndr20());
        w.write_multi_sz(&names, StringLayout::WIDE).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(&bytes[8..12], &[6, 0, 0, 0]);

        let mut r = NdrReader::new(bytes, NdrContext::ndr20());
        assert_eq!(r.read_multi_sz(StringLayout::WIDE).unwrap(), vec!["a", "bc"]);

        let mut w = NdrWriter::new(NdrContext::ndr20());
        let err = w
            .write_multi_sz(&names, StringLayout::WIDE.with_max_count(4))
            .unwrap_err();
        assert!(matches!(err, NdrError::Range { .. }));
    }

    #[test]
    fn test_string_len() {
        assert_eq!(string_len("abc", CharWidth::Narrow), 4);
        assert_eq!(string_len("\u{1F600}", CharWidth::Wide), 3);
    }
}
