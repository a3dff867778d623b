//! NDR (Network Data Representation) codec for MS-RPC management protocols
//!
//! This crate turns typed records into NDR byte streams and back, as used by
//! DCE RPC and MS-RPCE interfaces such as the DNS server management protocol.
//!
//! # NDR Wire Format
//!
//! - Primitives align to their natural size, measured from the message start
//! - Structures align to their largest member
//! - Pointers are written as referent ids; the pointed-to bodies follow the
//!   enclosing fixed part, depth first
//! - Conformance counts of a structure's trailing array are hoisted in front
//!   of the structure
//! - Strings are conformant varying arrays of 8- or 16-bit units
//!
//! Records are described either by implementing [`NdrEncode`]/[`NdrDecode`]
//! by hand, or declaratively with a [`Layout`] interpreted over [`Value`]s.

mod arrays;
mod context;
mod decode;
mod encode;
mod error;
pub mod layout;
mod pointers;
mod primitives;
pub mod record;
mod strings;
mod unions;

pub use arrays::{backfill, ConformantArray, ConformantVaryingArray, FixedArray, SizeInfo, VaryingArray};
pub use context::{Limits, NdrContext, PointerWidth, SizeWidth, WireFormat};
pub use decode::{NdrDecode, NdrDecodeOwned, NdrReader};
pub use encode::{NdrEncode, NdrWriter};
pub use error::{NdrError, Result, ResultExt};
pub use layout::{decode_value, encode_value, Arm, Field, Layout, Scalar, Value};
pub use pointers::{FullPtr, RefPtr, UniquePtr, FIRST_REFERENT, REFERENT_STEP};
pub use primitives::NdrUuid;
pub use record::{decode, decode_with, encode, encode_with, marshal, unmarshal, NdrRecord};
pub use strings::{multi_sz_len, string_len, CharWidth, NdrString, NdrWString, StringLayout, Terminator};
pub use unions::{NdrUnion, SwitchWidth};

/// Re-export bytes for convenience
pub use bytes::{Buf, BufMut, Bytes, BytesMut};
