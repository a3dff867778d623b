//! NDR decoding: the read cursor and the decoding traits

use bytes::{Buf, Bytes};
use tracing::{trace, warn};

use crate::arrays::SizeInfo;
use crate::pointers::ReferentRegistry;
use crate::{NdrContext, NdrError, Result};

/// Trait for types that can be decoded from NDR format
///
/// Decoding fills an existing value in place. Deferred pointer bodies write
/// into storage owned by `self` once the enclosing fixed part is done, so the
/// reader borrows `self` for its whole lifetime.
pub trait NdrDecode {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()>;

    /// Minimum bytes one element occupies on the wire, used to bound
    /// untrusted counts before allocating.
    fn ndr_min_size() -> usize
    where
        Self: Sized,
    {
        1
    }
}

impl<T: NdrDecode + ?Sized> NdrDecode for Box<T> {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> Result<()> {
        (**self).ndr_decode(r)
    }
}

/// Types that decode to an owned value with no deferred parts
///
/// Primitives, UUIDs and strings qualify. Shared (full) pointer targets must
/// be of this kind since their storage is created after the body is read.
pub trait NdrDecodeOwned: Sized {
    fn ndr_decode_owned(r: &mut NdrReader<'_>) -> Result<Self>;
}

pub(crate) type DeferredRead<'a> = Box<dyn FnOnce(&mut NdrReader<'a>) -> Result<()> + 'a>;

macro_rules! read_scalar {
    ($name:ident, $ty:ty, $size:expr, $le:ident, $be:ident) => {
        #[doc = concat!("Align to ", stringify!($size), " bytes and read a `", stringify!($ty), "`")]
        #[inline]
        pub fn $name(&mut self) -> Result<$ty> {
            self.align($size)?;
            self.ensure($size)?;
            let mut chunk = &self.buf[self.pos..self.pos + $size];
            let value = if self.ctx.little_endian {
                chunk.$le()
            } else {
                chunk.$be()
            };
            self.pos += $size;
            Ok(value)
        }
    };
}

/// Read cursor over one NDR message
pub struct NdrReader<'a> {
    buf: Bytes,
    pos: usize,
    ctx: NdrContext,
    pub(crate) referents: ReferentRegistry<'a>,
    pub(crate) deferred: Vec<DeferredRead<'a>>,
    pub(crate) inherited: Option<SizeInfo>,
    pub(crate) depth: usize,
}

impl<'a> NdrReader<'a> {
    pub fn new(buf: impl Into<Bytes>, ctx: NdrContext) -> Self {
        Self {
            buf: buf.into(),
            pos: 0,
            ctx,
            referents: ReferentRegistry::default(),
            deferred: Vec::new(),
            inherited: None,
            depth: 0,
        }
    }

    /// Detached reader over the same message at the current position, with
    /// its own referent and deferral state
    pub(crate) fn detached<'b>(&self) -> NdrReader<'b> {
        NdrReader {
            buf: self.buf.clone(),
            pos: self.pos,
            ctx: self.ctx,
            referents: ReferentRegistry::default(),
            deferred: Vec::new(),
            inherited: None,
            depth: 0,
        }
    }

    /// Continue from where a detached reader stopped
    pub(crate) fn resume_at(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    #[inline]
    pub fn context(&self) -> &NdrContext {
        &self.ctx
    }

    /// Current offset from the start of the message
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Unread bytes left in the message
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail with `Truncated` unless `n` more bytes are available
    #[inline]
    pub fn ensure(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(NdrError::Truncated {
                needed: n,
                have: self.remaining(),
                offset: self.pos,
            });
        }
        Ok(())
    }

    /// Skip padding up to the next multiple of `alignment`
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = NdrContext::align_padding(self.pos, alignment);
        self.skip(padding)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.pos += n;
        Ok(())
    }

    /// Consume the trailing gap of a structure. Senders may omit the gap at
    /// the very end of a message, so a short tail is accepted.
    pub fn read_trailing_gap(&mut self, alignment: usize) {
        let padding = NdrContext::align_padding(self.pos, alignment).min(self.remaining());
        self.pos += padding;
    }

    /// Raw byte run, no alignment
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.ensure(n)?;
        let bytes = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(bytes)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    #[inline]
    pub fn read_i8(&mut self) -> Result<i8> {
        self.read_u8().map(|b| b as i8)
    }

    /// NDR boolean: any non-zero byte is true
    #[inline]
    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_u8().map(|b| b != 0)
    }

    read_scalar!(read_u16, u16, 2, get_u16_le, get_u16);
    read_scalar!(read_i16, i16, 2, get_i16_le, get_i16);
    read_scalar!(read_u32, u32, 4, get_u32_le, get_u32);
    read_scalar!(read_i32, i32, 4, get_i32_le, get_i32);
    read_scalar!(read_u64, u64, 8, get_u64_le, get_u64);
    read_scalar!(read_i64, i64, 8, get_i64_le, get_i64);
    read_scalar!(read_f32, f32, 4, get_f32_le, get_f32);
    read_scalar!(read_f64, f64, 8, get_f64_le, get_f64);

    /// Enumeration in its 16-bit wire representation. Unknown values are
    /// returned as-is; mapping them is left to the caller.
    pub fn read_enum(&mut self) -> Result<u32> {
        self.read_u16().map(u32::from)
    }

    /// Decode a self-contained NDR stream carried inside an opaque byte
    /// array of the current message, using this reader's context.
    pub fn decode_nested<T: NdrDecode + Default>(&self, bytes: Bytes) -> Result<T> {
        trace!(len = bytes.len(), "decoding nested layout");
        crate::record::decode_with(bytes, self.ctx)
    }

    pub(crate) fn expect_body(&self, referent: u64) -> Result<()> {
        if self.is_empty() {
            warn!(referent, offset = self.pos, "deferred referent body missing");
            return Err(NdrError::ProtocolViolation {
                referent,
                reason: "deferred referent body missing",
            });
        }
        Ok(())
    }
}
