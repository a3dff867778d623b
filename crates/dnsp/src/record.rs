//! DNS_RPC_RECORD (MS-DNSP 2.2.2.2.5)

use bytes::Bytes;
use msrpc_ndr::{backfill, NdrDecode, NdrEncode, NdrError, NdrReader, NdrUnion, NdrWriter, ResultExt};
use tracing::{debug, warn};

use crate::data::RecordData;
use crate::error::{DnspError, Result};

/// DNS record types (DNS_RECORD_TYPE)
pub mod record_type {
    pub const ZERO: u16 = 0x0000;
    pub const A: u16 = 0x0001;
    pub const NS: u16 = 0x0002;
    pub const CNAME: u16 = 0x0005;
    pub const SOA: u16 = 0x0006;
    pub const NULL: u16 = 0x000A;
    pub const PTR: u16 = 0x000C;
    pub const HINFO: u16 = 0x000D;
    pub const MX: u16 = 0x000F;
    pub const TXT: u16 = 0x0010;
    pub const AAAA: u16 = 0x001C;
    pub const SRV: u16 = 0x0021;
    pub const DNAME: u16 = 0x0027;
    /// WINS lookup
    pub const WINS: u16 = 0xFF01;
    /// WINS reverse lookup
    pub const WINSR: u16 = 0xFF02;
}

/// Record rank and property flags (dwFlags)
pub mod flags {
    /// The record came from the cache
    pub const RANK_CACHE_BIT: u32 = 0x0000_0001;
    /// Preconfigured root hint
    pub const RANK_ROOT_HINT: u32 = 0x0000_0008;
    /// Glue record in an authoritative zone
    pub const RANK_GLUE: u32 = 0x0000_0080;
    /// Record from an authoritative zone
    pub const RANK_ZONE: u32 = 0x0000_00F0;
    /// Record sits at the root of a locally hosted zone
    pub const AUTH_ZONE_ROOT: u32 = 0x2000_0000;
    /// Record sits at the root of a zone
    pub const ZONE_ROOT: u32 = 0x4000_0000;
    /// Record came from the cache
    pub const CACHE_DATA: u32 = 0x8000_0000;
}

/// A single DNS resource record
///
/// A conformant structure: the byte count of the record data is hoisted in
/// front of the fixed part. The data travels as its own NDR stream and is
/// held parsed in `data`. `buffer` and `data_length` only override what
/// goes on the wire; a decoded record leaves them empty once `data` parses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub data_length: u16,
    pub record_type: u16,
    pub flags: u32,
    /// Must be zero on send
    pub serial: u32,
    pub ttl_seconds: u32,
    /// Hours since the last update
    pub timestamp: u32,
    pub buffer: Vec<u8>,
    pub data: Option<RecordData>,
}

impl Record {
    /// Zone record with the given TTL; the record type follows the data
    pub fn new(ttl_seconds: u32, data: RecordData) -> Self {
        Self {
            record_type: data.record_type(),
            flags: flags::RANK_ZONE,
            ttl_seconds,
            data: Some(data),
            ..Default::default()
        }
    }

    /// Record data, checked against the record type
    pub fn data(&self) -> Result<Option<&RecordData>> {
        match &self.data {
            Some(data) if data.record_type() != self.record_type => {
                warn!(
                    record_type = self.record_type,
                    data_type = data.record_type(),
                    "record data does not match record type"
                );
                Err(DnspError::RecordTypeMismatch {
                    record_type: self.record_type,
                    data_type: data.record_type(),
                })
            }
            other => Ok(other.as_ref()),
        }
    }

    /// Bytes carried in `buffer`: the raw buffer if set, otherwise the
    /// record data encoded with the writer's context
    fn payload(&self, w: &NdrWriter<'_>) -> msrpc_ndr::Result<Bytes> {
        match &self.data {
            Some(data) if self.buffer.is_empty() => w.encode_nested_arm(data),
            _ => Ok(Bytes::copy_from_slice(&self.buffer)),
        }
    }
}

fn u16_length(value: u64) -> msrpc_ndr::Result<u16> {
    u16::try_from(value).map_err(|_| NdrError::Range {
        what: "record data length",
        value,
        max: u64::from(u16::MAX),
    })
}

impl NdrEncode for Record {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        if let Some(data) = &mut self.data {
            data.prepare_arm()?;
            self.record_type = data.record_type();
        }
        if self.data_length == 0 {
            self.data_length = u16_length(self.buffer.len() as u64)?;
        }
        Ok(())
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        let payload = self.payload(w)?;
        let length = u16_length(backfill(u64::from(self.data_length), payload.len()))?;
        let sizes = w.write_conformance(vec![u64::from(length)])?;
        let count = sizes.first().copied().unwrap_or(u64::from(length));
        let count = usize::try_from(count).map_err(|_| NdrError::IntegerOverflow)?;

        w.align(4);
        w.write_u16(length);
        w.write_enum(u32::from(self.record_type))?;
        w.write_u32(self.flags);
        w.write_u32(self.serial);
        w.write_u32(self.ttl_seconds);
        w.write_u32(self.timestamp);
        // dwReserved
        w.write_u32(0);

        let written = count.min(payload.len());
        w.write_bytes(&payload[..written]);
        w.write_zero(count - written);
        w.write_trailing_gap(4);
        Ok(())
    }
}

impl NdrDecode for Record {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        let sizes = r.read_conformance(1).field("buffer")?;
        r.align(4)?;
        self.data_length = r.read_u16().field("data_length")?;
        // 16-bit on the wire
        self.record_type = r.read_enum().field("record_type")? as u16;
        self.flags = r.read_u32().field("flags")?;
        self.serial = r.read_u32().field("serial")?;
        self.ttl_seconds = r.read_u32().field("ttl_seconds")?;
        self.timestamp = r.read_u32().field("timestamp")?;
        r.read_u32().field("reserved")?;

        let wire = sizes.first().copied().unwrap_or(0);
        let count = r
            .resolve_count(wire, u64::from(self.data_length), 1)
            .field("buffer")?;
        self.buffer = r.read_bytes(count).field("buffer")?.to_vec();
        r.read_trailing_gap(4);

        self.data = if self.buffer.is_empty() {
            None
        } else {
            debug!(record_type = self.record_type, len = count, "decoding record data");
            let bytes = Bytes::copy_from_slice(&self.buffer);
            let data = r.decode_nested_arm(bytes, u32::from(self.record_type)).field("data")?;
            self.buffer.clear();
            self.data_length = 0;
            Some(data)
        };
        Ok(())
    }

    fn ndr_min_size() -> usize {
        24
    }
}
