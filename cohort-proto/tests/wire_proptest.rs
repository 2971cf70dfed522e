use cohort_proto::{
    FLAG_CASCADE, FLAG_RESERVED, FunctionTag, HEADER_BYTES, Header, NodeId, Opcode, SubgroupId,
    SubgroupTypeId, deserialize, serialize,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn test_header_roundtrip(
        payload_size in 0u64..,
        class_id in 0u32..,
        subgroup_id in 0u32..,
        function_id in 0u64..,
        is_reply in any::<bool>(),
        from in 0u32..,
        cascade in any::<bool>(),
        reserved in any::<bool>(),
    ) {
        let mut flags = 0u32;
        if cascade {
            flags |= FLAG_CASCADE;
        }
        if reserved {
            flags |= FLAG_RESERVED;
        }
        let header = Header {
            payload_size,
            opcode: Opcode {
                class_id: SubgroupTypeId(class_id),
                subgroup_id: SubgroupId(subgroup_id),
                function_id: FunctionTag(function_id),
                is_reply,
            },
            from: NodeId(from),
            flags,
        };

        let mut buf = [0u8; HEADER_BYTES];
        header.write_to(&mut buf).unwrap();
        prop_assert_eq!(Header::read_from(&buf).unwrap(), header);
    }

    #[test]
    fn test_value_roundtrip(
        a in any::<u64>(),
        b in proptest::collection::vec(any::<u32>(), 0..64),
        c in any::<Option<bool>>(),
        d in ".*",
    ) {
        let value = (a, b, c, d);
        let bytes = serialize(&value).unwrap();
        prop_assert_eq!(bytes.len(), cohort_proto::WireSize::wire_size(&value));
        let back: (u64, Vec<u32>, Option<bool>, String) = deserialize(&bytes).unwrap();
        prop_assert_eq!(back, value);
    }

    #[test]
    fn test_array_roundtrip(
        raw in prop::array::uniform32(0u8..),
        words in prop::array::uniform4(any::<u64>()),
    ) {
        let value = (raw, words);
        let bytes = serialize(&value).unwrap();
        prop_assert_eq!(bytes.len(), cohort_proto::WireSize::wire_size(&value));
        prop_assert_eq!(bytes.len(), 32 + 4 * 8);
        let back: ([u8; 32], [u64; 4]) = deserialize(&bytes).unwrap();
        prop_assert_eq!(back, value);
    }
}
