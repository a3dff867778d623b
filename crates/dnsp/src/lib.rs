//! DNS Server Management Protocol (MS-DNSP) record types
//!
//! Record types as returned by `R_DnssrvEnumRecords2` and accepted by
//! `R_DnssrvUpdateRecord2`, written against the `msrpc-ndr` codec:
//! - Node names and texts: 8-bit length plus a pointer to counted bytes
//! - Records: a conformant structure whose buffer carries the record data
//!   as a nested NDR stream, selected by the record type
//! - Nodes: a header with a pointer to a conformant array of records
//! - Node lists: nodes back to back until the end of the buffer

mod data;
mod error;
mod name;
mod node;
mod record;

pub use data::{RecordData, RecordIpAddress, RecordNodeName, RecordPreference, RecordSoa, RecordSrv, RecordString};
pub use error::{DnspError, Result};
pub use name::{NodeName, NodeText};
pub use node::{Node, NodeList};
pub use record::{flags, record_type, Record};
