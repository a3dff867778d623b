//! DNS_RPC_RECORD_DATA arms
//!
//! Record data travels inside the opaque `buffer` of a [`Record`] as a
//! self-contained NDR stream; the arm is selected by the record's `wType`.
//!
//! [`Record`]: crate::Record

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use msrpc_ndr::{NdrContext, NdrDecode, NdrEncode, NdrReader, NdrUnion, NdrWriter, ResultExt, SwitchWidth, UniquePtr};

use crate::error::{DnspError, Result};
use crate::name::{NodeName, NodeText};
use crate::record_type;

/// DNS_RPC_RECORD_A / DNS_RPC_RECORD_AAAA
///
/// The address bytes fill the record data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordIpAddress {
    pub address: Vec<u8>,
}

impl RecordIpAddress {
    pub fn to_ip(&self) -> Result<IpAddr> {
        match self.address.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.address);
                Ok(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.address);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            other => Err(DnspError::InvalidAddress(other)),
        }
    }
}

impl From<IpAddr> for RecordIpAddress {
    fn from(ip: IpAddr) -> Self {
        let address = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4.octets().to_vec(),
                None => v6.octets().to_vec(),
            },
        };
        Self { address }
    }
}

impl NdrEncode for RecordIpAddress {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_bytes(&self.address);
        Ok(())
    }
}

impl NdrDecode for RecordIpAddress {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.address = r.read_bytes(r.remaining())?.to_vec();
        Ok(())
    }
}

/// DNS_RPC_RECORD_NODE_NAME (NS, CNAME, PTR, DNAME, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordNodeName {
    pub name: UniquePtr<NodeName>,
}

impl RecordNodeName {
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            name: UniquePtr::new(NodeName::new(name)?),
        })
    }
}

impl NdrEncode for RecordNodeName {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        self.name.ndr_prepare()
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        self.name.ndr_encode(w)
    }
}

impl NdrDecode for RecordNodeName {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.name.ndr_decode(r).field("name")
    }
}

/// DNS_RPC_RECORD_NAME_PREFERENCE (MX, AFSDB, RT)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPreference {
    pub preference: u16,
    pub exchange: UniquePtr<NodeName>,
}

impl NdrEncode for RecordPreference {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        self.exchange.ndr_prepare()
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_u16(self.preference);
        self.exchange.ndr_encode(w)
    }
}

impl NdrDecode for RecordPreference {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.preference = r.read_u16().field("preference")?;
        self.exchange.ndr_decode(r).field("exchange")
    }
}

/// DNS_RPC_RECORD_SRV
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSrv {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: UniquePtr<NodeName>,
}

impl NdrEncode for RecordSrv {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        self.target.ndr_prepare()
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_u16(self.priority);
        w.write_u16(self.weight);
        w.write_u16(self.port);
        self.target.ndr_encode(w)
    }
}

impl NdrDecode for RecordSrv {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.priority = r.read_u16().field("priority")?;
        self.weight = r.read_u16().field("weight")?;
        self.port = r.read_u16().field("port")?;
        self.target.ndr_decode(r).field("target")
    }
}

/// DNS_RPC_RECORD_SOA
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSoa {
    pub serial_no: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum_ttl: u32,
    pub primary_server: UniquePtr<NodeName>,
    pub zone_administrator_email: UniquePtr<NodeName>,
}

impl NdrEncode for RecordSoa {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        self.primary_server.ndr_prepare()?;
        self.zone_administrator_email.ndr_prepare()
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_u32(self.serial_no);
        w.write_u32(self.refresh);
        w.write_u32(self.retry);
        w.write_u32(self.expire);
        w.write_u32(self.minimum_ttl);
        self.primary_server.ndr_encode(w)?;
        self.zone_administrator_email.ndr_encode(w)
    }
}

impl NdrDecode for RecordSoa {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.serial_no = r.read_u32().field("serial_no")?;
        self.refresh = r.read_u32().field("refresh")?;
        self.retry = r.read_u32().field("retry")?;
        self.expire = r.read_u32().field("expire")?;
        self.minimum_ttl = r.read_u32().field("minimum_ttl")?;
        self.primary_server.ndr_decode(r).field("primary_server")?;
        self.zone_administrator_email
            .ndr_decode(r)
            .field("zone_administrator_email")
    }
}

/// DNS_RPC_RECORD_STRING (TXT, HINFO, X25, ISDN)
///
/// Each text is written with its own pointer body before the next one, and
/// the texts run to the end of the record data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordString {
    pub data: Vec<NodeText>,
}

impl RecordString {
    pub fn new<S: AsRef<str>>(texts: &[S]) -> Result<Self> {
        let data = texts
            .iter()
            .map(|t| NodeText::new(t.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { data })
    }

    pub fn strings(&self) -> Vec<String> {
        self.data.iter().map(|t| t.as_str().into_owned()).collect()
    }
}

impl NdrEncode for RecordString {
    fn ndr_prepare(&mut self) -> msrpc_ndr::Result<()> {
        self.data.iter_mut().try_for_each(|text| text.ndr_prepare())
    }

    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        w.write_sequence(&self.data)
    }
}

impl NdrDecode for RecordString {
    fn ndr_decode<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        self.data = r.read_sequence().field("data")?;
        Ok(())
    }
}

/// Record data, keyed by DNS record type
///
/// Types without a dedicated arm keep their raw bytes in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(RecordIpAddress),
    Ns(RecordNodeName),
    Cname(RecordNodeName),
    Soa(RecordSoa),
    Ptr(RecordNodeName),
    Hinfo(RecordString),
    Mx(RecordPreference),
    Txt(RecordString),
    Aaaa(RecordIpAddress),
    Srv(RecordSrv),
    Dname(RecordNodeName),
    Unknown { record_type: u16, data: Vec<u8> },
}

impl Default for RecordData {
    fn default() -> Self {
        RecordData::Unknown {
            record_type: record_type::ZERO,
            data: Vec::new(),
        }
    }
}

impl RecordData {
    /// DNS record type of this arm
    pub fn record_type(&self) -> u16 {
        match self {
            RecordData::A(_) => record_type::A,
            RecordData::Ns(_) => record_type::NS,
            RecordData::Cname(_) => record_type::CNAME,
            RecordData::Soa(_) => record_type::SOA,
            RecordData::Ptr(_) => record_type::PTR,
            RecordData::Hinfo(_) => record_type::HINFO,
            RecordData::Mx(_) => record_type::MX,
            RecordData::Txt(_) => record_type::TXT,
            RecordData::Aaaa(_) => record_type::AAAA,
            RecordData::Srv(_) => record_type::SRV,
            RecordData::Dname(_) => record_type::DNAME,
            RecordData::Unknown { record_type, .. } => *record_type,
        }
    }
}

impl NdrUnion for RecordData {
    const SWITCH: SwitchWidth = SwitchWidth::U16;

    fn union_align(ctx: &NdrContext) -> usize {
        ctx.pointer_align()
    }

    fn discriminant(&self) -> u32 {
        u32::from(self.record_type())
    }

    fn for_discriminant(discriminant: u32) -> Option<Self> {
        let record_type = u16::try_from(discriminant).ok()?;
        Some(match record_type {
            record_type::A => RecordData::A(RecordIpAddress::default()),
            record_type::NS => RecordData::Ns(RecordNodeName::default()),
            record_type::CNAME => RecordData::Cname(RecordNodeName::default()),
            record_type::SOA => RecordData::Soa(RecordSoa::default()),
            record_type::PTR => RecordData::Ptr(RecordNodeName::default()),
            record_type::HINFO => RecordData::Hinfo(RecordString::default()),
            record_type::MX => RecordData::Mx(RecordPreference::default()),
            record_type::TXT => RecordData::Txt(RecordString::default()),
            record_type::AAAA => RecordData::Aaaa(RecordIpAddress::default()),
            record_type::SRV => RecordData::Srv(RecordSrv::default()),
            record_type::DNAME => RecordData::Dname(RecordNodeName::default()),
            other => RecordData::Unknown {
                record_type: other,
                data: Vec::new(),
            },
        })
    }

    fn prepare_arm(&mut self) -> msrpc_ndr::Result<()> {
        match self {
            RecordData::A(_) | RecordData::Aaaa(_) | RecordData::Unknown { .. } => Ok(()),
            RecordData::Ns(n) | RecordData::Cname(n) | RecordData::Ptr(n) | RecordData::Dname(n) => n.ndr_prepare(),
            RecordData::Soa(soa) => soa.ndr_prepare(),
            RecordData::Hinfo(s) | RecordData::Txt(s) => s.ndr_prepare(),
            RecordData::Mx(mx) => mx.ndr_prepare(),
            RecordData::Srv(srv) => srv.ndr_prepare(),
        }
    }

    fn encode_arm<'a>(&'a self, w: &mut NdrWriter<'a>) -> msrpc_ndr::Result<()> {
        match self {
            RecordData::A(ip) | RecordData::Aaaa(ip) => ip.ndr_encode(w),
            RecordData::Ns(n) | RecordData::Cname(n) | RecordData::Ptr(n) | RecordData::Dname(n) => n.ndr_encode(w),
            RecordData::Soa(soa) => soa.ndr_encode(w),
            RecordData::Hinfo(s) | RecordData::Txt(s) => s.ndr_encode(w),
            RecordData::Mx(mx) => mx.ndr_encode(w),
            RecordData::Srv(srv) => srv.ndr_encode(w),
            RecordData::Unknown { data, .. } => {
                w.write_bytes(data);
                Ok(())
            }
        }
    }

    fn decode_arm<'a>(&'a mut self, r: &mut NdrReader<'a>) -> msrpc_ndr::Result<()> {
        match self {
            RecordData::A(ip) | RecordData::Aaaa(ip) => ip.ndr_decode(r),
            RecordData::Ns(n) | RecordData::Cname(n) | RecordData::Ptr(n) | RecordData::Dname(n) => n.ndr_decode(r),
            RecordData::Soa(soa) => soa.ndr_decode(r),
            RecordData::Hinfo(s) | RecordData::Txt(s) => s.ndr_decode(r),
            RecordData::Mx(mx) => mx.ndr_decode(r),
            RecordData::Srv(srv) => srv.ndr_decode(r),
            RecordData::Unknown { data, .. } => {
                *data = r.read_bytes(r.remaining())?.to_vec();
                Ok(())
            }
        }
    }
}
