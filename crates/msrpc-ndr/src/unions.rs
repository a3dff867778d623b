//! NDR discriminated unions
//!
//! An encapsulated union is written as: align, discriminant, align, arm.
//! A non-encapsulated union has no discriminant of its own; the arm is
//! selected by a switch field of the enclosing structure.

use tracing::{debug, warn};

use crate::{NdrContext, NdrError, NdrReader, NdrWriter, Result};

/// Wire width of a union discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchWidth {
    /// `unsigned short` switch type
    U16,
    /// `long`/`unsigned long` switch type
    U32,
}

/// A tagged union whose arms are selected by a discriminant
///
/// Implemented by enums; a variant carrying the raw discriminant can serve
/// as the IDL `default:` arm by accepting any value in
/// [`for_discriminant`](NdrUnion::for_discriminant).
pub trait NdrUnion: Sized {
    const SWITCH: SwitchWidth = SwitchWidth::U32;

    /// Alignment of the union: the largest of the discriminant and the arms
    fn union_align(_ctx: &NdrContext) -> usize {
        4
    }

    /// Discriminant of the current arm
    fn discriminant(&self) -> u32;

    /// Empty arm for `discriminant`, or `None` if no arm matches
    fn for_discriminant(discriminant: u32) -> Option<Self>;

    fn prepare_arm(&mut self) -> Result<()> {
        Ok(())
    }

    fn encode_arm<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()>;

    fn decode_arm<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()>;
}

impl<'a> NdrWriter<'a> {
    pub fn write_switch(&mut self, discriminant: u32, width: SwitchWidth) -> Result<()> {
        match width {
            SwitchWidth::U16 => {
                let d = u16::try_from(discriminant).map_err(|_| NdrError::Range {
                    what: "union discriminant",
                    value: u64::from(discriminant),
                    max: u64::from(u16::MAX),
                })?;
                self.write_u16(d);
            }
            SwitchWidth::U32 => self.write_u32(discriminant),
        }
        Ok(())
    }

    /// Align, discriminant, align; the caller writes the arm next
    pub fn write_union_header(&mut self, discriminant: u32, align: usize, width: SwitchWidth) -> Result<()> {
        self.align(align);
        self.write_switch(discriminant, width)?;
        self.align(align);
        Ok(())
    }

    /// Encapsulated union
    pub fn write_union<U: NdrUnion>(&mut self, value: &'a U) -> Result<()> {
        let align = U::union_align(self.context());
        self.write_union_header(value.discriminant(), align, U::SWITCH)?;
        value.encode_arm(self)
    }

    /// Non-encapsulated union: the arm only, aligned to the union
    pub fn write_union_arm<U: NdrUnion>(&mut self, value: &'a U) -> Result<()> {
        self.align(U::union_align(self.context()));
        value.encode_arm(self)
    }
}

impl<'a> NdrReader<'a> {
    pub fn read_switch(&mut self, width: SwitchWidth) -> Result<u32> {
        match width {
            SwitchWidth::U16 => self.read_u16().map(u32::from),
            SwitchWidth::U32 => self.read_u32(),
        }
    }

    /// Align, discriminant, align; returns the discriminant so the caller
    /// can dispatch to the arm
    pub fn read_union_header(&mut self, align: usize, width: SwitchWidth) -> Result<u32> {
        self.align(align)?;
        let discriminant = self.read_switch(width)?;
        self.align(align)?;
        Ok(discriminant)
    }

    /// Encapsulated union; returns the discriminant read
    pub fn read_union<U: NdrUnion>(&mut self, slot: &'a mut U) -> Result<u32> {
        let align = U::union_align(self.context());
        let discriminant = self.read_union_header(align, U::SWITCH)?;
        self.decode_union_arm(slot, discriminant)?;
        Ok(discriminant)
    }

    /// Encapsulated union whose discriminant must agree with an already
    /// decoded switch field
    pub fn read_union_switched<U: NdrUnion>(&mut self, slot: &'a mut U, expected: u32) -> Result<()> {
        let align = U::union_align(self.context());
        let found = self.read_union_header(align, U::SWITCH)?;
        if found != expected {
            warn!(expected, found, "union discriminant disagrees with switch field");
            return Err(NdrError::DiscriminantMismatch { expected, found });
        }
        self.decode_union_arm(slot, found)
    }

    /// Non-encapsulated union selected by `discriminant`
    pub fn read_union_arm<U: NdrUnion>(&mut self, slot: &'a mut U, discriminant: u32) -> Result<()> {
        self.align(U::union_align(self.context()))?;
        self.decode_union_arm(slot, discriminant)
    }

    fn decode_union_arm<U: NdrUnion>(&mut self, slot: &'a mut U, discriminant: u32) -> Result<()> {
        let Some(arm) = U::for_discriminant(discriminant) else {
            warn!(discriminant, offset = self.position(), "no union arm for discriminant");
            return Err(NdrError::UnsupportedVariant(discriminant));
        };
        debug!(discriminant, "union arm selected");
        *slot = arm;
        slot.decode_arm(self)
    }

    /// Decode a union arm carried in an opaque byte array, as a
    /// self-contained stream using this reader's context
    pub fn decode_nested_arm<U: NdrUnion>(&self, bytes: bytes::Bytes, discriminant: u32) -> Result<U> {
        let Some(mut arm) = U::for_discriminant(discriminant) else {
            warn!(discriminant, "no union arm for discriminant");
            return Err(NdrError::UnsupportedVariant(discriminant));
        };
        {
            let mut nested = NdrReader::new(bytes, *self.context());
            arm.decode_arm(&mut nested)?;
            nested.flush_deferred()?;
        }
        Ok(arm)
    }
}

impl<'a> NdrWriter<'a> {
    /// Encode a union arm as a self-contained stream, for records that carry
    /// it inside an opaque byte array
    pub fn encode_nested_arm<U: NdrUnion>(&self, value: &U) -> Result<bytes::Bytes> {
        let mut nested = NdrWriter::new(*self.context());
        value.encode_arm(&mut nested)?;
        nested.flush_deferred()?;
        Ok(nested.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Sample {
        Word(u16),
        Long(u32),
        Unknown(u32),
    }

    impl Default for Sample {
        fn default() -> Self {
            Sample::Word(0)
        }
    }

    impl NdrUnion for Sample {
        fn discriminant(&self) -> u32 {
            match self {
                Sample::Word(_) => 1,
                Sample::Long(_) => 2,
                Sample::Unknown(d) => *d,
            }
        }

        fn for_discriminant(discriminant: u32) -> Option<Self> {
            Some(match discriminant {
                1 => Sample::Word(0),
                2 => Sample::Long(0),
                7 => return None,
                other => Sample::Unknown(other),
            })
        }

        fn encode_arm<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
            match self {
                Sample::Word(v) => w.write_u16(*v),
                Sample::Long(v) => w.write_u32(*v),
                Sample::Unknown(_) => {}
            }
            Ok(())
        }

        fn decode_arm<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
            match self {
                Sample::Word(v) => *v = r.read_u16()?,
                Sample::Long(v) => *v = r.read_u32()?,
                Sample::Unknown(_) => {}
            }
            Ok(())
        }
    }

    #[test]
    fn test_union_header_alignment() {
        let value = Sample::Word(0xBEEF);
        let mut w = NdrWriter::new(NdrContext::new());
        w.write_u8(9);
        w.write_union(&value).unwrap();
        assert_eq!(w.as_bytes(), &[9, 0, 0, 0, 1, 0, 0, 0, 0xEF, 0xBE]);

        let bytes = w.into_bytes();
        let mut slot = Sample::default();
        let mut r = NdrReader::new(bytes, NdrContext::new());
        r.read_u8().unwrap();
        assert_eq!(r.read_union(&mut slot).unwrap(), 1);
        drop(r);
        assert_eq!(slot, Sample::Word(0xBEEF));
    }

    #[test]
    fn test_default_arm_keeps_discriminant() {
        let mut slot = Sample::default();
        let mut r = NdrReader::new(vec![42, 0, 0, 0], NdrContext::new());
        r.read_union(&mut slot).unwrap();
        drop(r);
        assert_eq!(slot, Sample::Unknown(42));
    }

    #[test]
    fn test_unknown_discriminant() {
        let mut slot = Sample::default();
        let mut r = NdrReader::new(vec![7, 0, 0, 0, 1, 2, 3, 4], NdrContext::new());
        let err = r.read_union(&mut slot).unwrap_err();
        assert!(matches!(err, NdrError::UnsupportedVariant(7)));
    }

    #[test]
    fn test_switch_mismatch() {
        let mut slot = Sample::default();
        let mut r = NdrReader::new(vec![2, 0, 0, 0, 1, 0, 0, 0], NdrContext::new());
        let err = r.read_union_switched(&mut slot, 1).unwrap_err();
        assert!(matches!(err, NdrError::DiscriminantMismatch { expected: 1, found: 2 }));
    }

    #[test]
    fn test_non_encapsulated_arm() {
        let value = Sample::Long(5);
        let mut w = NdrWriter::new(NdrContext::new());
        w.write_union_arm(&value).unwrap();
        assert_eq!(w.as_bytes(), &[5, 0, 0, 0]);

        let mut slot = Sample::default();
        let mut r = NdrReader::new(w.into_bytes(), NdrContext::new());
        r.read_union_arm(&mut slot, 2).unwrap();
        drop(r);
        assert_eq!(slot, Sample::Long(5));
    }

    #[test]
    fn test_u16_switch_range() {
        let mut w = NdrWriter::new(NdrContext::new());
        assert!(w.write_switch(0x1_0000, SwitchWidth::U16).is_err());
        w.write_switch(3, SwitchWidth::U16).unwrap();
        assert_eq!(w.as_bytes(), &[3, 0]);
    }
}
