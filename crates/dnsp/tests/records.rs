//! DNSP Record Tests - Nodes and Records as Returned by Enumeration
//!
//! These tests exercise the record types end to end:
//! - Nodes carrying several record types
//! - Text records with multiple strings
//! - Node lists spanning several nodes
//! - Record types without a dedicated arm
//! - Hostile lengths inside an enumeration buffer

use std::net::IpAddr;

use msrpc_dnsp::{
    flags, record_type, DnspError, Node, NodeList, NodeName, Record, RecordData, RecordIpAddress, RecordNodeName,
    RecordPreference, RecordSoa, RecordSrv, RecordString,
};
use msrpc_ndr::{NdrContext, NdrError, UniquePtr};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn name(s: &str) -> NodeName {
    NodeName::new(s).unwrap()
}

fn a_record(ip: &str, ttl: u32) -> Record {
    let ip: IpAddr = ip.parse().unwrap();
    Record::new(ttl, RecordData::A(RecordIpAddress::from(ip)))
}

fn srv_record() -> Record {
    Record::new(
        600,
        RecordData::Srv(RecordSrv {
            priority: 0,
            weight: 100,
            port: 389,
            target: UniquePtr::new(name("dc1.corp.example.com")),
        }),
    )
}

fn round_trip(node: &mut Node, ctx: NdrContext) -> Node {
    let bytes = msrpc_ndr::encode_with(node, ctx).unwrap();
    msrpc_ndr::decode_with(bytes, ctx).unwrap()
}

#[test]
fn test_node_with_mixed_records() {
    init_tracing();
    let mut node = Node::new(name("_ldap._tcp"), vec![a_record("10.1.2.3", 3600), srv_record()]);

    for ctx in [NdrContext::ndr20(), NdrContext::ndr64(), NdrContext::default()] {
        let decoded = round_trip(&mut node, ctx);
        assert_eq!(decoded.record_count, 2);
        assert_eq!(decoded.name.as_ref().map(|n| n.to_string()).as_deref(), Some("_ldap._tcp"));

        let records = decoded.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, record_type::A);
        assert_eq!(records[0].ttl_seconds, 3600);
        assert_eq!(records[0].flags, flags::RANK_ZONE);
        match records[0].data().unwrap() {
            Some(RecordData::A(ip)) => assert_eq!(ip.to_ip().unwrap(), "10.1.2.3".parse::<IpAddr>().unwrap()),
            other => panic!("unexpected data {:?}", other),
        }

        assert_eq!(records[1].record_type, record_type::SRV);
        match records[1].data().unwrap() {
            Some(RecordData::Srv(srv)) => {
                assert_eq!(srv.port, 389);
                assert_eq!(srv.weight, 100);
                assert_eq!(srv.target.as_ref().unwrap().to_string(), "dc1.corp.example.com");
            }
            other => panic!("unexpected data {:?}", other),
        }
    }
}

#[test]
fn test_text_record_strings() {
    let txt = RecordString::new(&["v=spf1 include:example.com", "-all"]).unwrap();
    let mut node = Node::new(name("@"), vec![Record::new(300, RecordData::Txt(txt))]);
    let decoded = round_trip(&mut node, NdrContext::ndr20());

    match decoded.records()[0].data().unwrap() {
        Some(RecordData::Txt(txt)) => {
            assert_eq!(txt.strings(), vec!["v=spf1 include:example.com", "-all"]);
        }
        other => panic!("unexpected data {:?}", other),
    }
}

#[test]
fn test_name_and_preference_records() {
    let soa = RecordSoa {
        serial_no: 2024010101,
        refresh: 900,
        retry: 600,
        expire: 86400,
        minimum_ttl: 3600,
        primary_server: UniquePtr::new(name("ns1.example.com")),
        zone_administrator_email: UniquePtr::new(name("hostmaster.example.com")),
    };
    let mx = RecordPreference {
        preference: 10,
        exchange: UniquePtr::new(name("mail.example.com")),
    };
    let mut node = Node::new(
        name("example.com"),
        vec![
            Record::new(3600, RecordData::Soa(soa.clone())),
            Record::new(3600, RecordData::Mx(mx.clone())),
            Record::new(3600, RecordData::Cname(RecordNodeName::new("www.example.com").unwrap())),
        ],
    );
    let decoded = round_trip(&mut node, NdrContext::ndr20());
    let records = decoded.records();

    assert_eq!(records[0].data().unwrap(), Some(&RecordData::Soa(soa)));
    assert_eq!(records[1].data().unwrap(), Some(&RecordData::Mx(mx)));
    assert_eq!(records[2].record_type, record_type::CNAME);
}

#[test]
fn test_node_list_spans_nodes() {
    init_tracing();
    let mut list = NodeList::new(vec![
        Node::new(name("alpha"), vec![a_record("192.0.2.1", 60), a_record("192.0.2.2", 60)]),
        Node::new(name("beta"), vec![srv_record()]),
    ]);
    let bytes = list.encode(NdrContext::ndr20()).unwrap();
    let decoded = NodeList::decode(bytes, NdrContext::ndr20()).unwrap();

    assert_eq!(decoded.nodes.len(), 2);
    let owners: Vec<String> = decoded.records().map(|(owner, _)| owner).collect();
    assert_eq!(owners, vec!["alpha", "alpha", "beta"]);
    let types: Vec<u16> = decoded.records().map(|(_, record)| record.record_type).collect();
    assert_eq!(types, vec![record_type::A, record_type::A, record_type::SRV]);
}

#[test]
fn test_node_without_name_or_records() {
    let mut list = NodeList::new(vec![Node {
        child_count: 3,
        ..Default::default()
    }]);
    let bytes = list.encode(NdrContext::ndr20()).unwrap();
    assert_eq!(bytes.len(), 20);

    let decoded = NodeList::decode(bytes, NdrContext::ndr20()).unwrap();
    assert_eq!(decoded.nodes[0].child_count, 3);
    assert!(decoded.nodes[0].name.as_ref().is_none());
    assert!(decoded.nodes[0].records().is_empty());
}

#[test]
fn test_unknown_type_keeps_raw_bytes() {
    let data = RecordData::Unknown {
        record_type: 0x0063,
        data: vec![0xDE, 0xAD, 0xBE],
    };
    let mut node = Node::new(name("odd"), vec![Record::new(60, data.clone())]);
    let decoded = round_trip(&mut node, NdrContext::ndr20());

    let record = &decoded.records()[0];
    assert_eq!(record.record_type, 0x0063);
    assert!(record.buffer.is_empty());
    assert_eq!(record.data().unwrap(), Some(&data));
    assert_eq!(decoded, node);
}

#[test]
fn test_hostile_data_length() {
    init_tracing();
    let bytes = vec![
        0, 0, // wLength
        1, 0, // wRecordCount
        0, 0, 0, 0, // dwFlags
        0, 0, 0, 0, // dwChildCount
        0, 0, 0, 0, // null name
        0x00, 0x00, 0x02, 0x00, // records referent
        1, 0, 0, 0, // record array count
        0xFF, 0xFF, 0, 0, // hoisted buffer size
        0xFF, 0xFF, // wDataLength
        1, 0, // wType
        0xF0, 0, 0, 0, // dwFlags
        0, 0, 0, 0, // dwSerial
        0, 0, 0, 0, // dwTtlSeconds
        0, 0, 0, 0, // dwTimeStamp
        0, 0, 0, 0, // dwReserved
        10, 0, 0, 1,
    ];
    let err = NodeList::decode(bytes, NdrContext::ndr20()).unwrap_err();
    let DnspError::Ndr(err) = err else {
        panic!("expected an NDR error, got {:?}", err);
    };
    assert!(matches!(
        err.root(),
        NdrError::BufferOverflow {
            count: 0xFFFF,
            remaining: 4,
            offset: 52,
        }
    ));
    assert_eq!(err.field_path().first(), Some(&"nodes"));
    assert_eq!(err.field_path().last(), Some(&"buffer"));
}

#[test]
fn test_name_too_long() {
    let long = "a".repeat(300);
    assert!(matches!(NodeName::new(&long), Err(DnspError::NameTooLong { len: 300 })));
    assert!(matches!(
        RecordString::new(&[long.as_str()]),
        Err(DnspError::NameTooLong { len: 300 })
    ));
}
