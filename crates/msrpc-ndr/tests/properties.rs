//! Property tests for the codec: round trips, alignment and bounds on
//! untrusted input

use msrpc_ndr::{
    decode_value, decode_with, encode_value, encode_with, ConformantArray, Field, Layout, NdrContext, NdrDecode,
    NdrEncode, NdrError, NdrReader, NdrString, NdrWString, NdrWriter, Result, Scalar, UniquePtr, Value, WireFormat,
};
use proptest::prelude::*;

/// Unaligned prefix followed by a hyper
#[derive(Debug, Default, PartialEq)]
struct Padded {
    prefix: Vec<u8>,
    value: u64,
}

impl NdrEncode for Padded {
    fn ndr_encode<'a>(&'a self, w: &mut NdrWriter<'a>) -> Result<()> {
        w.write_bytes(&self.prefix);
        w.write_u64(self.value);
        Ok(())
    }
}

fn arb_context() -> impl Strategy<Value = NdrContext> {
    let format = prop_oneof![
        Just(WireFormat::NDR20),
        Just(WireFormat::NDR64),
        Just(WireFormat::MIXED),
    ];
    (format, any::<bool>()).prop_map(|(format, little_endian)| NdrContext::with_byte_order(little_endian).with_format(format))
}

fn counted_bytes() -> Layout {
    Layout::structure(vec![
        Field::new("count", Layout::Scalar(Scalar::U16)),
        Field::new("data", Layout::unique(Layout::sized_array(Layout::Scalar(Scalar::U8), "count"))),
    ])
}

fn decode_any<T: NdrDecode + Default>(bytes: &[u8], ctx: NdrContext) {
    let _ = decode_with::<T>(bytes.to_vec(), ctx);
}

proptest! {
    #[test]
    fn prop_conformant_array_round_trip(values in prop::collection::vec(any::<u32>(), 0..64), ctx in arb_context()) {
        let mut array = ConformantArray::new(values.clone());
        let bytes = encode_with(&mut array, ctx).unwrap();
        let decoded: ConformantArray<u32> = decode_with(bytes, ctx).unwrap();
        prop_assert_eq!(decoded.elements, values);
    }

    #[test]
    fn prop_strings_round_trip(s in "[a-zA-Z0-9 .-]{0,40}", ctx in arb_context()) {
        let mut narrow = NdrString::new(s.clone());
        let bytes = encode_with(&mut narrow, ctx).unwrap();
        let decoded: NdrString = decode_with(bytes, ctx).unwrap();
        prop_assert_eq!(decoded.as_str(), s.as_str());

        let mut wide = NdrWString::new(s.clone());
        let bytes = encode_with(&mut wide, ctx).unwrap();
        let decoded: NdrWString = decode_with(bytes, ctx).unwrap();
        prop_assert_eq!(decoded.as_str(), s.as_str());
    }

    #[test]
    fn prop_unique_pointer_round_trip(value in proptest::option::of(any::<u32>()), ctx in arb_context()) {
        let mut ptr = UniquePtr::from(value);
        let bytes = encode_with(&mut ptr, ctx).unwrap();
        let decoded: UniquePtr<u32> = decode_with(bytes, ctx).unwrap();
        prop_assert_eq!(decoded.into_option(), value);
    }

    #[test]
    fn prop_hyper_aligned_to_eight(prefix in prop::collection::vec(any::<u8>(), 0..16), value in any::<u64>()) {
        let mut padded = Padded { prefix: prefix.clone(), value };
        let bytes = encode_with(&mut padded, NdrContext::ndr20()).unwrap();
        let offset = (prefix.len() + 7) & !7;
        prop_assert_eq!(bytes.len(), offset + 8);
        prop_assert_eq!(&bytes[..prefix.len()], &prefix[..]);
        prop_assert!(bytes[prefix.len()..offset].iter().all(|&b| b == 0));
        prop_assert_eq!(&bytes[offset..], &value.to_le_bytes()[..]);
    }

    #[test]
    fn prop_layout_round_trip(data in prop::collection::vec(any::<u8>(), 1..32), ctx in arb_context()) {
        let layout = counted_bytes();
        let mut value = Value::Struct(vec![
            Value::UInt(0),
            Value::Pointer(Some(Box::new(Value::Array(data.iter().map(|&b| Value::UInt(u64::from(b))).collect())))),
        ]);
        let bytes = encode_value(&layout, &mut value, ctx).unwrap();
        prop_assert_eq!(value.field(0), Some(&Value::UInt(data.len() as u64)));

        let decoded = decode_value(&layout, bytes, ctx).unwrap();
        prop_assert_eq!(decoded, value);
    }

    #[test]
    fn prop_decode_arbitrary_bytes_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..96), ctx in arb_context()) {
        decode_any::<ConformantArray<u32>>(&bytes, ctx);
        decode_any::<UniquePtr<ConformantArray<u16>>>(&bytes, ctx);
        decode_any::<NdrWString>(&bytes, ctx);
        decode_any::<NdrString>(&bytes, ctx);
        let _ = decode_value(&counted_bytes(), bytes, ctx);
    }

    #[test]
    fn prop_oversized_count_is_buffer_overflow(count in 2u32.., tail in prop::collection::vec(any::<u8>(), 0..8)) {
        prop_assume!(u64::from(count) * 4 > tail.len() as u64);
        let mut bytes = count.to_le_bytes().to_vec();
        bytes.extend_from_slice(&tail);
        let err = decode_with::<ConformantArray<u32>>(bytes, NdrContext::ndr20()).unwrap_err();
        let is_overflow = matches!(err.root(), NdrError::BufferOverflow { .. });
        prop_assert!(is_overflow, "unexpected error {}", err);
    }
}

#[test]
fn test_reader_never_reads_past_end() {
    let mut r = NdrReader::new(vec![1u8, 2, 3], NdrContext::ndr20());
    assert!(matches!(r.read_u32(), Err(NdrError::Truncated { needed: 4, have: 3, offset: 0 })));
    assert_eq!(r.read_u16().unwrap(), 0x0201);
    assert!(r.read_u16().is_err());
}
