//! NDR primitive type implementations
//!
//! | MIDL Type      | Rust Type | Size | Alignment |
//! |----------------|-----------|------|-----------|
//! | boolean        | bool      | 1    | 1         |
//! | byte/char      | u8        | 1    | 1         |
//! | small          | i8        | 1    | 1         |
//! | short          | i16       | 2    | 2         |
//! | long/int       | i32       | 4    | 4         |
//! | hyper          | i64       | 8    | 8         |
//! | unsigned short | u16       | 2    | 2         |
//! | unsigned long  | u32       | 4    | 4         |
//! | unsigned hyper | u64       | 8    | 8         |
//! | float          | f32       | 4    | 4         |
//! | double         | f64       | 8    | 8         |
//! | wchar_t        | u16       | 2    | 2         |
//! | GUID           | NdrUuid   | 16   | 4         |

use crate::{NdrDecode, NdrDecodeOwned, NdrEncode, NdrReader, NdrWriter, Result};

macro_rules! impl_ndr_primitive {
    ($ty:ty, $size:expr, $write:ident, $read:ident) => {
        impl NdrEncode for $ty {
            fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
                w.$write(*self);
                Ok(())
            }
        }

        impl NdrDecode for $ty {
            fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
                *self = r.$read()?;
                Ok(())
            }

            fn ndr_min_size() -> usize {
                $size
            }
        }

        impl NdrDecodeOwned for $ty {
            fn ndr_decode_owned(r: &mut NdrReader<'_>) -> Result<Self> {
                r.$read()
            }
        }
    };
}

impl_ndr_primitive!(bool, 1, write_bool, read_bool);
impl_ndr_primitive!(u8, 1, write_u8, read_u8);
impl_ndr_primitive!(i8, 1, write_i8, read_i8);
impl_ndr_primitive!(u16, 2, write_u16, read_u16);
impl_ndr_primitive!(i16, 2, write_i16, read_i16);
impl_ndr_primitive!(u32, 4, write_u32, read_u32);
impl_ndr_primitive!(i32, 4, write_i32, read_i32);
impl_ndr_primitive!(u64, 8, write_u64, read_u64);
impl_ndr_primitive!(i64, 8, write_i64, read_i64);
impl_ndr_primitive!(f32, 4, write_f32, read_f32);
impl_ndr_primitive!(f64, 8, write_f64, read_f64);

/// GUID/UUID type for NDR encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NdrUuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl NdrUuid {
    /// Nil UUID
    pub const NIL: Self = Self {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Parse from string "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('{').trim_end_matches('}');
        if s.len() != 36 {
            return None;
        }
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5 || parts[4].len() != 12 {
            return None;
        }

        let data1 = u32::from_str_radix(parts[0], 16).ok()?;
        let data2 = u16::from_str_radix(parts[1], 16).ok()?;
        let data3 = u16::from_str_radix(parts[2], 16).ok()?;
        let clock = u16::from_str_radix(parts[3], 16).ok()?;

        let mut data4 = [0u8; 8];
        data4[..2].copy_from_slice(&clock.to_be_bytes());
        for (i, byte) in data4[2..].iter_mut().enumerate() {
            *byte = u8::from_str_radix(parts[4].get(i * 2..i * 2 + 2)?, 16).ok()?;
        }

        Some(Self { data1, data2, data3, data4 })
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl std::fmt::Display for NdrUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1],
        )?;
        for byte in &self.data4[2..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl NdrEncode for NdrUuid {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_u32(self.data1);
        w.write_u16(self.data2);
        w.write_u16(self.data3);
        w.write_bytes(&self.data4);
        Ok(())
    }
}

impl NdrDecodeOwned for NdrUuid {
    fn ndr_decode_owned(r: &mut NdrReader<'_>) -> Result<Self> {
        let data1 = r.read_u32()?;
        let data2 = r.read_u16()?;
        let data3 = r.read_u16()?;
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&r.read_bytes(8)?);
        Ok(Self { data1, data2, data3, data4 })
    }
}

impl NdrDecode for NdrUuid {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        *self = Self::ndr_decode_owned(r)?;
        Ok(())
    }

    fn ndr_min_size() -> usize {
        16
    }
}
