use cohort_proto::header::user_tag;
use cohort_proto::{FunctionTag, SubgroupTypeId};
use cohort_rpc::{MethodTables, RpcError};

struct Cell {
    value: u64,
}

#[test]
fn test_duplicate_registration_is_rejected() {
    let result = MethodTables::<Cell>::builder(SubgroupTypeId(1))
        .ordered("poke", |c: &mut Cell, (v,): (u64,)| {
            c.value = v;
            Ok(())
        })
        .ordered("poke", |c: &mut Cell, (v,): (u64,)| {
            c.value = v + 1;
            Ok(())
        })
        .build();

    assert!(matches!(
        result,
        Err(RpcError::TagCollision { first, second }) if first == "poke" && second == "poke"
    ));
}

#[test]
fn test_same_name_across_modes_is_not_a_collision() {
    let tables = MethodTables::<Cell>::builder(SubgroupTypeId(1))
        .ordered("value", |c: &mut Cell, _: ()| Ok(c.value))
        .p2p("value", |c: &mut Cell, _: ()| Ok(c.value))
        .build()
        .unwrap();

    let (ordered, _) = tables.tag_for("value", false).unwrap();
    let (p2p, _) = tables.tag_for("value", true).unwrap();
    assert_ne!(ordered, p2p);
    assert!(!ordered.is_p2p());
    assert!(p2p.is_p2p());
    assert_eq!(ordered.user_half(), p2p.user_half());
}

#[test]
fn test_internal_tag_derivation() {
    let tables = MethodTables::<Cell>::builder(SubgroupTypeId(1))
        .ordered("read_state", |c: &mut Cell, _: ()| Ok(c.value))
        .p2p("peek", |c: &mut Cell, _: ()| Ok(c.value))
        .build()
        .unwrap();

    let (tag, info) = tables.tag_for("read_state", false).unwrap();
    assert_eq!(tag, FunctionTag(user_tag("read_state").wrapping_mul(2)));
    assert!(!info.p2p);
    assert!(info.returns_value);

    let (tag, info) = tables.tag_for("peek", true).unwrap();
    assert_eq!(
        tag,
        FunctionTag(user_tag("peek").wrapping_mul(2).wrapping_add(1))
    );
    assert!(info.p2p);
}

#[test]
fn test_unknown_method_lookup_fails() {
    let tables = MethodTables::<Cell>::builder(SubgroupTypeId(1))
        .ordered("poke", |c: &mut Cell, (v,): (u64,)| {
            c.value = v;
            Ok(())
        })
        .build()
        .unwrap();

    assert!(matches!(
        tables.tag_for("missing", false),
        Err(RpcError::UnknownMethod(name)) if name == "missing"
    ));
    // Registered as ordered, looked up as p2p: the tag differs.
    assert!(tables.tag_for("poke", true).is_err());
    assert!(tables.tag_for("poke", false).is_ok());
}

#[test]
fn test_void_method_info() {
    let tables = MethodTables::<Cell>::builder(SubgroupTypeId(1))
        .ordered("poke", |c: &mut Cell, (v,): (u64,)| {
            c.value = v;
            Ok(())
        })
        .build()
        .unwrap();

    let (_, info) = tables.tag_for("poke", false).unwrap();
    assert!(!info.returns_value);
}
