//! DNS_NODE_NAME and DNS_NODE_TEXT
//!
//! Both are an 8-bit length followed by a unique pointer to the counted
//! bytes, sized by that length.

use std::borrow::Cow;
use std::fmt;

use msrpc_ndr::{NdrDecode, NdrEncode, NdrError, NdrReader, NdrWriter, ResultExt};

use crate::error::{DnspError, Result};

fn length_prefix(bytes: &[u8]) -> Result<u8> {
    u8::try_from(bytes.len()).map_err(|_| DnspError::NameTooLong { len: bytes.len() })
}

fn backfill_length(length: &mut u8, bytes: &Option<Vec<u8>>) -> msrpc_ndr::Result<()> {
    if let (0, Some(bytes)) = (*length, bytes) {
        *length = u8::try_from(bytes.len()).map_err(|_| NdrError::Range {
            what: "name length",
            value: bytes.len() as u64,
            max: u64::from(u8::MAX),
        })?;
    }
    Ok(())
}

fn encode_counted<'a>(w: &mut NdrWriter<'a>, length: u8, bytes: &'a Option<Vec<u8>>) -> msrpc_ndr::Result<()> {
    const NO_BYTES: &[u8] = &[];
    w.write_u8(length);
    let declared = u64::from(length);
    // a length without bytes still announces a body, zero-filled
    let bytes = match bytes.as_deref() {
        None if length > 0 => Some(NO_BYTES),
        bytes => bytes,
    };
    w.write_pointer(bytes, move |w, bytes: &'a [u8]| {
        w.write_conformant_array(bytes, declared)
    })
}

fn decode_counted<'a>(r: &mut NdrReader<'a>, length: u8, slot: &'a mut Option<Vec<u8>>) -> msrpc_ndr::Result<()> {
    let declared = u64::from(length);
    r.read_pointer(slot, move |r, bytes: &'a mut Vec<u8>| {
        r.read_conformant_array(bytes, declared)
    })
}

/// Length-prefixed DNS name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeName {
    pub name_length: u8,
    pub dns_name: Option<Vec<u8>>,
}

impl NodeName {
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            name_length: length_prefix(name.as_bytes())?,
            dns_name: Some(name.as_bytes().to_vec()),
        })
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.dns_name.as_deref().unwrap_or_default())
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl NdrEncode for NodeName {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        backfill_length(&mut self.name_length, &self.dns_name)
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        encode_counted(w, self.name_length, &self.dns_name)
    }
}

impl NdrDecode for NodeName {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.name_length = r.read_u8().field("name_length")?;
        decode_counted(r, self.name_length, &mut self.dns_name).field("dns_name")
    }
}

/// Length-prefixed character string of a TXT-style record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeText {
    pub text_length: u8,
    pub text: Option<Vec<u8>>,
}

impl NodeText {
    pub fn new(text: &str) -> Result<Self> {
        Ok(Self {
            text_length: length_prefix(text.as_bytes())?,
            text: Some(text.as_bytes().to_vec()),
        })
    }

    /// Text with any trailing NULs removed
    pub fn as_str(&self) -> Cow<'_, str> {
        let bytes = self.text.as_deref().unwrap_or_default();
        let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        String::from_utf8_lossy(&bytes[..end])
    }
}

impl fmt::Display for NodeText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl NdrEncode for NodeText {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        backfill_length(&mut self.text_length, &self.text)
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        encode_counted(w, self.text_length, &self.text)
    }
}

impl NdrDecode for NodeText {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.text_length = r.read_u8().field("text_length")?;
        decode_counted(r, self.text_length, &mut self.text).field("text")
    }
}
