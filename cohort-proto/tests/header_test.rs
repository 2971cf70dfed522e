use cohort_proto::header::user_tag;
use cohort_proto::{
    FLAG_CASCADE, FLAG_MASK, FunctionTag, HEADER_BYTES, Header, NodeId, Opcode, SubgroupId,
    SubgroupTypeId,
};

fn sample_header() -> Header {
    Header {
        payload_size: 4096,
        opcode: Opcode {
            class_id: SubgroupTypeId(3),
            subgroup_id: SubgroupId(7),
            function_id: FunctionTag::ordered("change_state"),
            is_reply: false,
        },
        from: NodeId(1),
        flags: 0,
    }
}

#[test]
fn test_header_roundtrip() {
    let header = sample_header();
    let mut buf = [0u8; HEADER_BYTES];
    header.write_to(&mut buf).unwrap();
    let parsed = Header::read_from(&buf).unwrap();
    assert_eq!(parsed, header);
}

#[test]
fn test_header_roundtrip_reply_with_cascade() {
    let mut header = sample_header();
    header.opcode = header.opcode.reply();
    header.flags = FLAG_CASCADE;
    let mut buf = vec![0u8; HEADER_BYTES + 100];
    header.write_to(&mut buf).unwrap();
    let parsed = Header::read_from(&buf).unwrap();
    assert_eq!(parsed, header);
    assert!(parsed.opcode.is_reply);
    assert_eq!(parsed.opcode.request(), sample_header().opcode);
}

#[test]
fn test_header_rejects_short_buffer() {
    let header = sample_header();
    let mut buf = [0u8; HEADER_BYTES - 1];
    assert!(header.write_to(&mut buf).is_err());
    assert!(Header::read_from(&buf).is_err());
}

#[test]
fn test_header_rejects_reserved_flag_bits() {
    let mut header = sample_header();
    header.flags = FLAG_MASK + 1;
    let mut buf = [0u8; HEADER_BYTES];
    assert!(header.write_to(&mut buf).is_err());

    // Same check on the read side: corrupt the flags field directly.
    sample_header().write_to(&mut buf).unwrap();
    buf[HEADER_BYTES - 1] = 0x80;
    assert!(Header::read_from(&buf).is_err());
}

#[test]
fn test_header_rejects_bad_reply_byte() {
    let mut buf = [0u8; HEADER_BYTES];
    sample_header().write_to(&mut buf).unwrap();
    buf[24] = 2;
    assert!(Header::read_from(&buf).is_err());
}

#[test]
fn test_opcode_ordering_is_lexicographic() {
    let base = Opcode {
        class_id: SubgroupTypeId(1),
        subgroup_id: SubgroupId(1),
        function_id: FunctionTag(10),
        is_reply: false,
    };
    let higher_class = Opcode {
        class_id: SubgroupTypeId(2),
        subgroup_id: SubgroupId(0),
        function_id: FunctionTag(0),
        is_reply: false,
    };
    let higher_subgroup = Opcode {
        subgroup_id: SubgroupId(2),
        ..base
    };
    let reply = base.reply();

    assert!(base < higher_class);
    assert!(base < higher_subgroup);
    assert!(higher_subgroup < higher_class);
    assert!(base < reply);
}

#[test]
fn test_tag_parity_encodes_mode() {
    let ordered = FunctionTag::ordered("read_state");
    let p2p = FunctionTag::p2p("read_state");

    assert!(!ordered.is_p2p());
    assert!(p2p.is_p2p());
    assert_eq!(ordered.0, 2u64.wrapping_mul(user_tag("read_state")));
    assert_eq!(p2p.0, ordered.0 + 1);
    assert_eq!(ordered.user_half(), p2p.user_half());
}

#[test]
fn test_user_tag_polynomial_hash() {
    // hash("ab") = 'a' * 31 + 'b'
    assert_eq!(user_tag("ab"), 97 * 31 + 98);
    assert_eq!(user_tag(""), 0);
    assert_ne!(user_tag("read_state"), user_tag("change_state"));
}
