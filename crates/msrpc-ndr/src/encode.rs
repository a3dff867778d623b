//! NDR encoding: the write cursor and the encoding trait
//!
//! [`NdrWriter`] owns the output buffer for one marshal call together with
//! the call-scoped state the NDR rules need: the referent allocator, the
//! queue of deferred pointer bodies, and the inherited conformance sizes.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::arrays::SizeInfo;
use crate::pointers::ReferentAllocator;
use crate::{NdrContext, NdrError, Result};

/// Trait for types that can be encoded to NDR format
pub trait NdrEncode {
    /// Reconcile derived fields (lengths, counts, switch values) with the live
    /// contents. Runs once over the whole tree before any byte is written.
    fn ndr_prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Encode this value at the writer's current position.
    ///
    /// Embedded pointer bodies are queued on the writer and emitted after the
    /// fixed part of the outermost structure, so the writer borrows `self`
    /// for its own lifetime.
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()>;
}

impl<T: NdrEncode + ?Sized> NdrEncode for Box<T> {
    fn ndr_prepare(&mut self) -> Result<()> {
        (**self).ndr_prepare()
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        (**self).ndr_encode(w)
    }
}

pub(crate) type DeferredWrite<'a> = Box<dyn FnOnce(&mut NdrWriter<'a>) -> Result<()> + 'a>;

macro_rules! write_scalar {
    ($name:ident, $ty:ty, $size:expr, $le:ident, $be:ident) => {
        #[doc = concat!("Align to ", stringify!($size), " bytes and write a `", stringify!($ty), "`")]
        #[inline]
        pub fn $name(&mut self, value: $ty) {
            self.align($size);
            if self.ctx.little_endian {
                self.buf.$le(value);
            } else {
                self.buf.$be(value);
            }
        }
    };
}

/// Write cursor for one NDR message
pub struct NdrWriter<'a> {
    buf: BytesMut,
    /// Offset of `buf[0]` from the start of the enclosing message
    base: usize,
    ctx: NdrContext,
    pub(crate) referents: ReferentAllocator,
    pub(crate) deferred: Vec<DeferredWrite<'a>>,
    pub(crate) inherited: Option<SizeInfo>,
    pub(crate) depth: usize,
}

impl<'a> NdrWriter<'a> {
    pub fn new(ctx: NdrContext) -> Self {
        Self::at_offset(0, ctx)
    }

    /// Writer whose alignment is computed as if it started at `base` bytes
    /// into an enclosing message.
    pub(crate) fn at_offset(base: usize, ctx: NdrContext) -> Self {
        Self {
            buf: BytesMut::new(),
            base,
            ctx,
            referents: ReferentAllocator::default(),
            deferred: Vec::new(),
            inherited: None,
            depth: 0,
        }
    }

    /// Detached writer starting at the current position, for values that are
    /// encoded without borrowing into this message
    pub(crate) fn scratch<'b>(&self) -> NdrWriter<'b> {
        NdrWriter::at_offset(self.position(), self.ctx)
    }

    #[inline]
    pub fn context(&self) -> &NdrContext {
        &self.ctx
    }

    /// Current offset from the start of the message
    #[inline]
    pub fn position(&self) -> usize {
        self.base + self.buf.len()
    }

    /// Number of bytes written so far
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Finish the message. Pointer bodies still queued are not emitted.
    pub fn into_bytes(self) -> Bytes {
        if !self.deferred.is_empty() {
            trace!(pending = self.deferred.len(), "writer finished with unflushed deferred bodies");
        }
        self.buf.freeze()
    }

    /// Pad with zero bytes up to the next multiple of `alignment`
    pub fn align(&mut self, alignment: usize) {
        let padding = NdrContext::align_padding(self.position(), alignment);
        self.write_zero(padding);
    }

    /// Emit `n` zero bytes (reserved fields, explicit padding)
    pub fn write_zero(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    /// Pad the end of a structure to its alignment with no field following
    pub fn write_trailing_gap(&mut self, alignment: usize) {
        self.align(alignment);
    }

    /// Raw byte run, no alignment
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    #[inline]
    pub fn write_i8(&mut self, value: i8) {
        self.buf.put_i8(value);
    }

    /// NDR boolean - a single byte, 0x00 or 0x01
    #[inline]
    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    write_scalar!(write_u16, u16, 2, put_u16_le, put_u16);
    write_scalar!(write_i16, i16, 2, put_i16_le, put_i16);
    write_scalar!(write_u32, u32, 4, put_u32_le, put_u32);
    write_scalar!(write_i32, i32, 4, put_i32_le, put_i32);
    write_scalar!(write_u64, u64, 8, put_u64_le, put_u64);
    write_scalar!(write_i64, i64, 8, put_i64_le, put_i64);
    write_scalar!(write_f32, f32, 4, put_f32_le, put_f32);
    write_scalar!(write_f64, f64, 8, put_f64_le, put_f64);

    /// Enumeration in its 16-bit wire representation
    pub fn write_enum(&mut self, value: u32) -> Result<()> {
        let wire = u16::try_from(value).map_err(|_| NdrError::Range {
            what: "enumeration value",
            value: u64::from(value),
            max: u64::from(u16::MAX),
        })?;
        self.write_u16(wire);
        Ok(())
    }

    /// Encode `value` as a self-contained NDR stream, for records that carry
    /// a nested layout inside an opaque byte array.
    pub fn encode_nested<T: NdrEncode + ?Sized>(&self, value: &T) -> Result<Bytes> {
        let mut nested = NdrWriter::new(self.ctx);
        value.ndr_encode(&mut nested)?;
        nested.flush_deferred()?;
        Ok(nested.into_bytes())
    }
}
