//! Record composition
//!
//! Every record type implements [`NdrEncode`] and [`NdrDecode`]. The helpers
//! here are the only entry points that start and finish a message: they run
//! `ndr_prepare` before the first byte is written and flush the deferred
//! pointer bodies after the top-level fixed part.

use bytes::Bytes;
use tracing::trace;

use crate::{NdrContext, NdrDecode, NdrEncode, NdrError, NdrReader, NdrWriter, Result};

/// A type that can be used as a top-level NDR message
pub trait NdrRecord: NdrEncode + NdrDecode + Default {}

impl<T> NdrRecord for T where T: NdrEncode + NdrDecode + Default {}

/// Prepare and encode `value` at the writer's position, then emit every
/// pointer body it queued.
pub fn marshal<'a, T>(value: &'a mut T, w: &mut NdrWriter<'a>) -> Result<()>
where
    T: NdrEncode + ?Sized,
{
    value.ndr_prepare()?;
    let value: &'a T = value;
    value.ndr_encode(w)?;
    w.flush_deferred()
}

/// Decode `value` in place at the reader's position, then resolve every
/// pointer body it queued.
pub fn unmarshal<'a, T>(value: &'a mut T, r: &mut NdrReader<'a>) -> Result<()>
where
    T: NdrDecode + ?Sized,
{
    value.ndr_decode(r)?;
    r.flush_deferred()
}

/// Encode `value` as a complete message with the default context
pub fn encode<T: NdrEncode + ?Sized>(value: &mut T) -> Result<Bytes> {
    encode_with(value, NdrContext::default())
}

pub fn encode_with<T: NdrEncode + ?Sized>(value: &mut T, ctx: NdrContext) -> Result<Bytes> {
    let mut w = NdrWriter::new(ctx);
    marshal(value, &mut w)?;
    trace!(bytes = w.len(), "encoded NDR message");
    Ok(w.into_bytes())
}

/// Decode a complete message with the default context
pub fn decode<T: NdrDecode + Default>(bytes: impl Into<Bytes>) -> Result<T> {
    decode_with(bytes, NdrContext::default())
}

pub fn decode_with<T: NdrDecode + Default>(bytes: impl Into<Bytes>, ctx: NdrContext) -> Result<T> {
    let mut value = T::default();
    {
        let mut r = NdrReader::new(bytes, ctx);
        unmarshal(&mut value, &mut r)?;
        trace!(
            consumed = r.position(),
            trailing = r.remaining(),
            "decoded NDR message"
        );
    }
    Ok(value)
}

impl<'a> NdrWriter<'a> {
    /// Concatenated values, each followed by its own pointer bodies. Values
    /// are expected to be prepared by the enclosing record.
    pub fn write_sequence<T: NdrEncode>(&mut self, items: &'a [T]) -> Result<()> {
        for item in items {
            item.ndr_encode(self)?;
            self.flush_deferred()?;
        }
        Ok(())
    }
}

impl<'a> NdrReader<'a> {
    /// Concatenated values read until the message is exhausted. Each value
    /// is unmarshaled on its own, pointer bodies included.
    pub fn read_sequence<T: NdrDecode + Default>(&mut self) -> Result<Vec<T>> {
        let limit = self.context().limits.max_elements;
        let mut items = Vec::new();
        while !self.is_empty() {
            if items.len() >= limit {
                return Err(NdrError::AllocationLimit {
                    requested: items.len() as u64 + 1,
                    limit,
                });
            }
            let start = self.position();
            let mut item = T::default();
            let end = {
                let mut detached = self.detached();
                unmarshal(&mut item, &mut detached)?;
                detached.position()
            };
            if end == start {
                return Err(NdrError::LayoutMismatch(
                    "sequence element consumed no bytes".to_string(),
                ));
            }
            self.resume_at(end);
            items.push(item);
        }
        trace!(count = items.len(), "decoded sequence");
        Ok(items)
    }
}
