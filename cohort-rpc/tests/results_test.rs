use cohort_proto::NodeId;
use cohort_rpc::{PendingResults, PendingSend, RpcError};
use std::collections::BTreeSet;
use std::time::Duration;

fn nodes(ids: &[u32]) -> Vec<NodeId> {
    ids.iter().map(|&i| NodeId(i)).collect()
}

#[test]
fn test_wait_zero_on_unfulfilled_returns_none() {
    let pending = PendingResults::<u64>::new();
    let results = pending.get_results();
    assert!(results.wait(Duration::ZERO).unwrap().is_none());
}

#[test]
fn test_fulfill_then_collect_replies() {
    let pending = PendingResults::<u64>::new();
    let results = pending.get_results();

    pending.fulfill_map(&nodes(&[0, 1, 2]));
    let map = results.get().unwrap();
    assert_eq!(map.nodes().to_vec(), nodes(&[0, 1, 2]));

    pending.set_value(NodeId(1), 42);
    assert_eq!(map.get(NodeId(1)).unwrap(), 42);
    assert!(!pending.all_responded());

    pending.set_value(NodeId(0), 40);
    pending.set_value(NodeId(2), 44);
    assert!(pending.all_responded());
    assert_eq!(map.get(NodeId(0)).unwrap(), 40);
    assert_eq!(map.get(NodeId(2)).unwrap(), 44);
}

#[test]
fn test_reply_outside_destination_set_is_ignored() {
    let pending = PendingResults::<u64>::new();
    let results = pending.get_results();
    pending.fulfill_map(&nodes(&[0, 1]));

    // A reply from a node that was never a destination must not widen the
    // responded set.
    pending.set_value(NodeId(9), 99);
    assert!(!pending.all_responded());

    let map = results.get().unwrap();
    assert!(!map.valid(NodeId(9)));
    assert!(matches!(
        map.try_get(NodeId(9)),
        Err(RpcError::NotADestination(NodeId(9)))
    ));
    assert_eq!(map.try_get(NodeId(0)).unwrap(), None);
}

#[test]
fn test_caller_removed_before_fulfill() {
    let pending = PendingResults::<u64>::new();
    let results = pending.get_results();
    pending.set_exception_for_caller_removed();
    assert_eq!(results.get().unwrap_err(), RpcError::SenderRemoved);
}

#[test]
fn test_caller_removed_after_fulfill_spares_responded_nodes() {
    let pending = PendingResults::<u64>::new();
    let results = pending.get_results();
    pending.fulfill_map(&nodes(&[0, 1]));
    pending.set_value(NodeId(0), 7);

    pending.set_exception_for_caller_removed();
    let map = results.get().unwrap();
    assert_eq!(map.get(NodeId(0)).unwrap(), 7);
    assert_eq!(map.get(NodeId(1)).unwrap_err(), RpcError::SenderRemoved);
    assert!(pending.all_responded());
}

#[test]
fn test_removed_node_before_fulfill_is_a_noop() {
    let pending = PendingResults::<u64>::new();
    pending.set_exception_for_removed_node(NodeId(5));

    pending.fulfill_map(&nodes(&[5]));
    pending.set_value(NodeId(5), 1);
    let map = pending.get_results().get().unwrap();
    assert_eq!(map.get(NodeId(5)).unwrap(), 1);
}

#[test]
fn test_removed_node_fails_unresponded_slot() {
    let pending = PendingResults::<u64>::new();
    let results = pending.get_results();
    pending.fulfill_map(&nodes(&[0, 1]));

    pending.set_exception_for_removed_node(NodeId(1));
    let map = results.get().unwrap();
    assert_eq!(map.get(NodeId(1)).unwrap_err(), RpcError::NodeRemoved(NodeId(1)));
    assert!(!pending.all_responded());

    pending.set_value(NodeId(0), 3);
    assert!(pending.all_responded());
}

#[test]
fn test_removed_node_leaves_responded_slot_untouched() {
    let pending = PendingResults::<u64>::new();
    let results = pending.get_results();
    pending.fulfill_map(&nodes(&[0]));
    pending.set_value(NodeId(0), 7);

    pending.set_exception_for_removed_node(NodeId(0));
    assert_eq!(results.get().unwrap().get(NodeId(0)).unwrap(), 7);
}

#[test]
fn test_reset_invalidates_outstanding_handles() {
    let pending = PendingResults::<u64>::new();
    let stale = pending.get_results();
    pending.fulfill_map(&nodes(&[0]));

    pending.reset();
    assert_eq!(stale.wait(Duration::ZERO).unwrap_err(), RpcError::StaleHandle);

    let fresh = pending.get_results();
    pending.fulfill_map(&nodes(&[1]));
    pending.set_value(NodeId(1), 9);
    assert_eq!(fresh.get().unwrap().get(NodeId(1)).unwrap(), 9);
}

#[test]
fn test_delivery_failure_surfaces_through_destination_stage() {
    let pending = PendingResults::<u64>::new();
    let results = pending.get_results();
    pending.set_delivery_failed("no route");
    assert!(matches!(
        results.get().unwrap_err(),
        RpcError::DeliveryFailed(_)
    ));
}

#[test]
fn test_set_value_blocks_until_destination_stage_resolves() {
    let pending = PendingResults::<u64>::new();
    let results = pending.get_results();

    // A reply that races ahead of the delivered callback must wait for the
    // destination set instead of losing the value.
    let racer = pending.clone();
    let handle = std::thread::spawn(move || racer.set_value(NodeId(0), 5));

    std::thread::sleep(Duration::from_millis(50));
    pending.fulfill_map(&nodes(&[0]));
    handle.join().unwrap();

    assert_eq!(results.get().unwrap().get(NodeId(0)).unwrap(), 5);
    assert!(pending.all_responded());
}

#[test]
fn test_send_results_resolve_to_destination_set() {
    let pending = PendingSend::new();
    let results = pending.get_results();
    assert!(results.wait(Duration::ZERO).unwrap().is_none());
    assert!(!pending.all_responded());

    pending.fulfill_map(&nodes(&[0, 1, 2]));
    let dest: BTreeSet<NodeId> = nodes(&[0, 1, 2]).into_iter().collect();
    assert_eq!(results.get().unwrap(), dest);
    assert!(pending.all_responded());
}

#[test]
fn test_send_caller_removed_before_fulfill() {
    let pending = PendingSend::new();
    let results = pending.get_results();
    pending.set_exception_for_caller_removed();
    assert_eq!(results.get().unwrap_err(), RpcError::SenderRemoved);
}

#[test]
fn test_send_reset_rearms_the_same_handle() {
    let pending = PendingSend::new();
    let results = pending.get_results();
    pending.fulfill_map(&nodes(&[0, 1]));

    pending.reset();
    assert!(results.wait(Duration::ZERO).unwrap().is_none());

    pending.fulfill_map(&nodes(&[1, 2]));
    let dest: BTreeSet<NodeId> = nodes(&[1, 2]).into_iter().collect();
    assert_eq!(results.get().unwrap(), dest);
}
