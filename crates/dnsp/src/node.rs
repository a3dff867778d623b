//! DNS_RPC_NODE and DNS_RPC_NODE_LIST

use bytes::Bytes;
use msrpc_ndr::{NdrContext, NdrDecode, NdrEncode, NdrError, NdrReader, NdrWriter, ResultExt, UniquePtr};
use tracing::trace;

use crate::error::Result;
use crate::name::NodeName;
use crate::record::Record;

/// Header of one DNS node and the records stored at it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Length of the node header including the name, padded to 4 bytes
    pub length: u16,
    pub record_count: u16,
    pub flags: u32,
    pub child_count: u32,
    pub name: UniquePtr<NodeName>,
    /// Sized by `record_count`
    pub records: Option<Vec<Record>>,
}

impl Node {
    pub fn new(name: NodeName, records: Vec<Record>) -> Self {
        Self {
            name: UniquePtr::new(name),
            records: Some(records),
            ..Default::default()
        }
    }

    pub fn records(&self) -> &[Record] {
        self.records.as_deref().unwrap_or_default()
    }
}

impl NdrEncode for Node {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        self.name.ndr_prepare()?;
        if let Some(records) = &mut self.records {
            for record in records.iter_mut() {
                record.ndr_prepare()?;
            }
            if self.record_count == 0 {
                self.record_count = u16::try_from(records.len()).map_err(|_| NdrError::Range {
                    what: "record count",
                    value: records.len() as u64,
                    max: u64::from(u16::MAX),
                })?;
            }
        }
        Ok(())
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_u16(self.length);
        w.write_u16(self.record_count);
        w.write_u32(self.flags);
        w.write_u32(self.child_count);
        self.name.ndr_encode(w)?;
        let declared = u64::from(self.record_count);
        w.write_pointer(self.records.as_deref(), move |w, records: &'a [Record]| {
            w.write_conformant_array(records, declared)
        })?;
        w.write_trailing_gap(4);
        Ok(())
    }
}

impl NdrDecode for Node {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.length = r.read_u16().field("length")?;
        self.record_count = r.read_u16().field("record_count")?;
        self.flags = r.read_u32().field("flags")?;
        self.child_count = r.read_u32().field("child_count")?;
        self.name.ndr_decode(r).field("name")?;
        let declared = u64::from(self.record_count);
        r.read_pointer(&mut self.records, move |r, records: &'a mut Vec<Record>| {
            r.read_conformant_array(records, declared).field("records")
        })
        .field("records")?;
        r.read_trailing_gap(4);
        Ok(())
    }

    fn ndr_min_size() -> usize {
        20
    }
}

/// Nodes returned by a record enumeration, back to back until the end of
/// the buffer. Each node is followed by its own name and records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeList {
    pub nodes: Vec<Node>,
}

impl NodeList {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Encode the list as the contents of an enumeration buffer
    pub fn encode(&mut self, ctx: NdrContext) -> Result<Bytes> {
        let bytes = msrpc_ndr::encode_with(self, ctx)?;
        trace!(nodes = self.nodes.len(), bytes = bytes.len(), "encoded node list");
        Ok(bytes)
    }

    pub fn decode(bytes: impl Into<Bytes>, ctx: NdrContext) -> Result<Self> {
        Ok(msrpc_ndr::decode_with(bytes, ctx)?)
    }

    /// All records with the name of the node they belong to
    pub fn records(&self) -> impl Iterator<Item = (String, &Record)> + '_ {
        self.nodes.iter().flat_map(|node| {
            let name = node.name.as_ref().map(|n| n.to_string()).unwrap_or_default();
            node.records().iter().map(move |record| (name.clone(), record))
        })
    }
}

impl NdrEncode for NodeList {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        self.nodes.iter_mut().try_for_each(|node| node.ndr_prepare())
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_sequence(&self.nodes)
    }
}

impl NdrDecode for NodeList {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.nodes = r.read_sequence().field("nodes")?;
        Ok(())
    }
}
