//! Reply collection for in-flight RPC calls.
//!
//! A call resolves in two stages. First the *destination set* resolves, once
//! the transport confirms the message entered the ordered layer and the set
//! of repliers is known. Then, for valued calls, each destination's reply
//! resolves independently — with a value, a remote exception, or a
//! membership fault injected by the view-change adaptor.
//!
//! The two halves of a call share a single resolution cell (mutex + condvar):
//! [`PendingResults`] is the write half, owned by the dispatcher's in-flight
//! table; [`QueryResults`] is the read half, held by the caller. Neither
//! half points into the other's object. Ordered sends, which expect no
//! replies, use the reduced [`PendingSend`]/[`SendResults`] pair where the
//! destination set is the entire future.

use crate::error::{RpcError, RpcResult};
use cohort_proto::NodeId;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Upper bound on any single blocking wait inside `get()`. Waits re-check
/// and loop, so this never turns into a spurious failure; it is a
/// deadlock-avoidance hedge against missed wake-ups and silent callee
/// failures outside a view change.
pub const REPLY_POLL_INTERVAL: Duration = Duration::from_secs(300);

enum ReplySlot<R> {
    Pending,
    Ready(Result<R, RpcError>),
}

struct CellState<R> {
    generation: u64,
    map_fulfilled: bool,
    map_error: Option<RpcError>,
    dest_nodes: BTreeSet<NodeId>,
    responded_nodes: BTreeSet<NodeId>,
    replies: BTreeMap<NodeId, ReplySlot<R>>,
}

struct ReplyCell<R> {
    state: Mutex<CellState<R>>,
    cond: Condvar,
}

/// Write half of a valued call; lives in the dispatcher's in-flight table.
pub struct PendingResults<R> {
    cell: Arc<ReplyCell<R>>,
}

impl<R> Clone for PendingResults<R> {
    fn clone(&self) -> Self {
        PendingResults {
            cell: self.cell.clone(),
        }
    }
}

impl<R> Default for PendingResults<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> PendingResults<R> {
    pub fn new() -> Self {
        PendingResults {
            cell: Arc::new(ReplyCell {
                state: Mutex::new(CellState {
                    generation: 0,
                    map_fulfilled: false,
                    map_error: None,
                    dest_nodes: BTreeSet::new(),
                    responded_nodes: BTreeSet::new(),
                    replies: BTreeMap::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Hands out the caller's half, bound to the current generation.
    pub fn get_results(&self) -> QueryResults<R> {
        QueryResults {
            cell: self.cell.clone(),
            generation: self.cell.state.lock().generation,
        }
    }

    /// Publishes the destination set and creates one reply slot per
    /// destination. Called exactly once per generation, after the transport
    /// confirms delivery; a second call is a programming bug and is ignored
    /// beyond a warning.
    pub fn fulfill_map(&self, who: &[NodeId]) {
        let mut state = self.cell.state.lock();
        if state.map_fulfilled {
            debug_assert!(false, "fulfill_map called twice");
            warn!("fulfill_map called twice on the same pending call");
            return;
        }
        for &nid in who {
            state.dest_nodes.insert(nid);
            state.replies.insert(nid, ReplySlot::Pending);
        }
        state.map_fulfilled = true;
        self.cell.cond.notify_all();
    }

    /// Records `nid`'s reply. Blocks until the destination set has resolved
    /// so the reply slot is guaranteed to exist.
    pub fn set_value(&self, nid: NodeId, value: R) {
        self.resolve(nid, Ok(value));
    }

    /// Records that `nid`'s execution raised, or that a membership fault
    /// resolved its slot.
    pub fn set_exception(&self, nid: NodeId, error: RpcError) {
        self.resolve(nid, Err(error));
    }

    fn resolve(&self, nid: NodeId, outcome: Result<R, RpcError>) {
        let mut state = self.cell.state.lock();
        let generation = state.generation;
        while !state.map_fulfilled && state.map_error.is_none() && state.generation == generation {
            self.cell.cond.wait(&mut state);
        }
        if state.generation != generation || state.map_error.is_some() {
            trace!(%nid, "dropping reply for an abandoned call");
            return;
        }
        if state.responded_nodes.contains(&nid) {
            trace!(%nid, "dropping duplicate reply");
            return;
        }
        match state.replies.get_mut(&nid) {
            Some(slot) => {
                *slot = ReplySlot::Ready(outcome);
                state.responded_nodes.insert(nid);
                self.cell.cond.notify_all();
            }
            None => warn!(%nid, "reply from a node outside the destination set"),
        }
    }

    /// Fails `nid`'s slot with [`RpcError::NodeRemoved`] if it was a
    /// destination that has not yet responded. No-op otherwise, and a no-op
    /// before the destination set resolves: the undelivered-call race is
    /// owned by the dispatcher's view-change policy.
    pub fn set_exception_for_removed_node(&self, nid: NodeId) {
        let need = {
            let state = self.cell.state.lock();
            state.map_fulfilled
                && state.dest_nodes.contains(&nid)
                && !state.responded_nodes.contains(&nid)
        };
        if need {
            self.resolve(nid, Err(RpcError::NodeRemoved(nid)));
        }
    }

    /// The sender was evicted from its subgroup. Before the destination set
    /// resolves this resolves the set itself with [`RpcError::SenderRemoved`];
    /// afterwards it fails every destination that has not yet responded,
    /// leaving already-responded nodes untouched.
    pub fn set_exception_for_caller_removed(&self) {
        let pending: Vec<NodeId> = {
            let mut state = self.cell.state.lock();
            if !state.map_fulfilled {
                state.map_error = Some(RpcError::SenderRemoved);
                self.cell.cond.notify_all();
                return;
            }
            state
                .dest_nodes
                .difference(&state.responded_nodes)
                .copied()
                .collect()
        };
        for nid in pending {
            self.resolve(nid, Err(RpcError::SenderRemoved));
        }
    }

    /// The transport reported the message cannot be delivered in any view.
    pub fn set_delivery_failed(&self, detail: &str) {
        let mut state = self.cell.state.lock();
        if !state.map_fulfilled && state.map_error.is_none() {
            state.map_error = Some(RpcError::DeliveryFailed(detail.to_string()));
            self.cell.cond.notify_all();
        }
    }

    /// True iff the destination set has resolved and every destination has
    /// responded (with a value or an exception). The dispatcher uses this to
    /// garbage-collect the in-flight entry.
    pub fn all_responded(&self) -> bool {
        let state = self.cell.state.lock();
        state.map_fulfilled && state.responded_nodes == state.dest_nodes
    }

    pub fn dest_nodes(&self) -> Vec<NodeId> {
        self.cell.state.lock().dest_nodes.iter().copied().collect()
    }

    /// Returns the cell to its just-constructed state for a retry under a
    /// new view. Handles from the previous generation observe
    /// [`RpcError::StaleHandle`].
    pub fn reset(&self) {
        let mut state = self.cell.state.lock();
        state.generation += 1;
        state.map_fulfilled = false;
        state.map_error = None;
        state.dest_nodes.clear();
        state.responded_nodes.clear();
        state.replies.clear();
        self.cell.cond.notify_all();
    }
}

/// Read half of a valued call.
pub struct QueryResults<R> {
    cell: Arc<ReplyCell<R>>,
    generation: u64,
}

impl<R> QueryResults<R> {
    /// Waits up to `timeout` for the destination set to resolve. Returns
    /// `Ok(None)` on timeout without cancelling the underlying call;
    /// `timeout` of zero polls without blocking.
    pub fn wait(&self, timeout: Duration) -> RpcResult<Option<ReplyMap<R>>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.cell.state.lock();
        loop {
            if state.generation != self.generation {
                return Err(RpcError::StaleHandle);
            }
            if let Some(error) = &state.map_error {
                return Err(error.clone());
            }
            if state.map_fulfilled {
                let nodes: Vec<NodeId> = state.dest_nodes.iter().copied().collect();
                return Ok(Some(ReplyMap {
                    cell: self.cell.clone(),
                    generation: self.generation,
                    nodes,
                }));
            }
            match deadline {
                Some(deadline) => {
                    if self.cell.cond.wait_until(&mut state, deadline).timed_out() {
                        // Re-check once; the state may have resolved between
                        // the timeout and reacquiring the lock.
                        if state.map_fulfilled || state.map_error.is_some() {
                            continue;
                        }
                        return Ok(None);
                    }
                }
                None => {
                    self.cell.cond.wait(&mut state);
                }
            }
        }
    }

    /// Blocks until the destination set resolves. Each internal wait is
    /// bounded by [`REPLY_POLL_INTERVAL`] and re-checked.
    pub fn get(&self) -> RpcResult<ReplyMap<R>> {
        loop {
            if let Some(map) = self.wait(REPLY_POLL_INTERVAL)? {
                return Ok(map);
            }
        }
    }
}

/// Per-destination view of a resolved destination set.
pub struct ReplyMap<R> {
    cell: Arc<ReplyCell<R>>,
    generation: u64,
    nodes: Vec<NodeId>,
}

impl<R> std::fmt::Debug for ReplyMap<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyMap")
            .field("generation", &self.generation)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl<R> ReplyMap<R> {
    /// The destinations the call was sent to, whether or not they replied.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// True iff the call was sent to `nid`.
    pub fn contains(&self, nid: NodeId) -> bool {
        self.nodes.contains(&nid)
    }

    /// True iff `nid` is a destination of this call. False, with no side
    /// effects, for nodes outside the destination set.
    pub fn valid(&self, nid: NodeId) -> bool {
        self.contains(nid)
    }
}

impl<R: Clone> ReplyMap<R> {
    /// Blocks until `nid`'s reply resolves and returns it, re-raising a
    /// remote exception or membership fault as an error. Each internal wait
    /// is bounded by [`REPLY_POLL_INTERVAL`] and re-checked, so a silently
    /// failed callee cannot hang the caller past a view change.
    pub fn get(&self, nid: NodeId) -> RpcResult<R> {
        let mut state = self.cell.state.lock();
        loop {
            if state.generation != self.generation {
                return Err(RpcError::StaleHandle);
            }
            if !state.dest_nodes.contains(&nid) {
                return Err(RpcError::NotADestination(nid));
            }
            if let Some(ReplySlot::Ready(outcome)) = state.replies.get(&nid) {
                return outcome.clone();
            }
            let deadline = Instant::now() + REPLY_POLL_INTERVAL;
            self.cell.cond.wait_until(&mut state, deadline);
        }
    }

    /// Non-blocking variant of [`get`](ReplyMap::get): `Ok(None)` while the
    /// reply is still outstanding.
    pub fn try_get(&self, nid: NodeId) -> RpcResult<Option<R>> {
        let state = self.cell.state.lock();
        if state.generation != self.generation {
            return Err(RpcError::StaleHandle);
        }
        if !state.dest_nodes.contains(&nid) {
            return Err(RpcError::NotADestination(nid));
        }
        match state.replies.get(&nid) {
            Some(ReplySlot::Ready(outcome)) => outcome.clone().map(Some),
            _ => Ok(None),
        }
    }
}

struct SendState {
    fulfilled: bool,
    error: Option<RpcError>,
    dest: BTreeSet<NodeId>,
}

struct SendCell {
    state: Mutex<SendState>,
    cond: Condvar,
}

/// Write half of an ordered send. There is no per-destination stage: the
/// destination set is the entire future.
#[derive(Clone)]
pub struct PendingSend {
    cell: Arc<SendCell>,
}

impl Default for PendingSend {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingSend {
    pub fn new() -> Self {
        PendingSend {
            cell: Arc::new(SendCell {
                state: Mutex::new(SendState {
                    fulfilled: false,
                    error: None,
                    dest: BTreeSet::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn get_results(&self) -> SendResults {
        SendResults {
            cell: self.cell.clone(),
        }
    }

    pub fn fulfill_map(&self, who: &[NodeId]) {
        let mut state = self.cell.state.lock();
        if state.fulfilled {
            debug_assert!(false, "fulfill_map called twice");
            warn!("fulfill_map called twice on the same pending send");
            return;
        }
        state.dest.extend(who.iter().copied());
        state.fulfilled = true;
        self.cell.cond.notify_all();
    }

    pub fn set_exception_for_caller_removed(&self) {
        let mut state = self.cell.state.lock();
        if !state.fulfilled {
            state.error = Some(RpcError::SenderRemoved);
            self.cell.cond.notify_all();
        }
    }

    pub fn set_delivery_failed(&self, detail: &str) {
        let mut state = self.cell.state.lock();
        if !state.fulfilled && state.error.is_none() {
            state.error = Some(RpcError::DeliveryFailed(detail.to_string()));
            self.cell.cond.notify_all();
        }
    }

    pub fn all_responded(&self) -> bool {
        self.cell.state.lock().fulfilled
    }

    pub fn dest_nodes(&self) -> Vec<NodeId> {
        self.cell.state.lock().dest.iter().copied().collect()
    }

    /// Re-arms the cell for a re-send under a new view. The caller's
    /// existing [`SendResults`] handle stays valid and observes the
    /// destination set of the retry.
    pub fn reset(&self) {
        let mut state = self.cell.state.lock();
        state.fulfilled = false;
        state.error = None;
        state.dest.clear();
        self.cell.cond.notify_all();
    }
}

/// Read half of an ordered send; resolves to the set of nodes the message
/// was delivered to.
pub struct SendResults {
    cell: Arc<SendCell>,
}

impl SendResults {
    /// Waits up to `timeout` for the delivered-to set. `Ok(None)` on
    /// timeout; zero polls without blocking.
    pub fn wait(&self, timeout: Duration) -> RpcResult<Option<BTreeSet<NodeId>>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.cell.state.lock();
        loop {
            if let Some(error) = &state.error {
                return Err(error.clone());
            }
            if state.fulfilled {
                return Ok(Some(state.dest.clone()));
            }
            match deadline {
                Some(deadline) => {
                    if self.cell.cond.wait_until(&mut state, deadline).timed_out() {
                        if state.fulfilled || state.error.is_some() {
                            continue;
                        }
                        return Ok(None);
                    }
                }
                None => self.cell.cond.wait(&mut state),
            }
        }
    }

    pub fn get(&self) -> RpcResult<BTreeSet<NodeId>> {
        loop {
            if let Some(dest) = self.wait(REPLY_POLL_INTERVAL)? {
                return Ok(dest);
            }
        }
    }
}

/// Type-erased view of a pending call, as stored in the in-flight table.
pub trait PendingCall: Send + Sync {
    fn fulfill_map(&self, who: &[NodeId]);
    fn set_exception_for_removed_node(&self, nid: NodeId);
    fn set_exception_for_caller_removed(&self);
    fn set_delivery_failed(&self, detail: &str);
    fn all_responded(&self) -> bool;
    fn dest_nodes(&self) -> Vec<NodeId>;
    fn reset(&self);
}

impl<R: Send> PendingCall for PendingResults<R> {
    fn fulfill_map(&self, who: &[NodeId]) {
        PendingResults::fulfill_map(self, who);
    }
    fn set_exception_for_removed_node(&self, nid: NodeId) {
        PendingResults::set_exception_for_removed_node(self, nid);
    }
    fn set_exception_for_caller_removed(&self) {
        PendingResults::set_exception_for_caller_removed(self);
    }
    fn set_delivery_failed(&self, detail: &str) {
        PendingResults::set_delivery_failed(self, detail);
    }
    fn all_responded(&self) -> bool {
        PendingResults::all_responded(self)
    }
    fn dest_nodes(&self) -> Vec<NodeId> {
        PendingResults::dest_nodes(self)
    }
    fn reset(&self) {
        PendingResults::reset(self);
    }
}

impl PendingCall for PendingSend {
    fn fulfill_map(&self, who: &[NodeId]) {
        PendingSend::fulfill_map(self, who);
    }
    fn set_exception_for_removed_node(&self, _nid: NodeId) {
        // Sends have no per-destination stage; nothing to fail.
    }
    fn set_exception_for_caller_removed(&self) {
        PendingSend::set_exception_for_caller_removed(self);
    }
    fn set_delivery_failed(&self, detail: &str) {
        PendingSend::set_delivery_failed(self, detail);
    }
    fn all_responded(&self) -> bool {
        PendingSend::all_responded(self)
    }
    fn dest_nodes(&self) -> Vec<NodeId> {
        PendingSend::dest_nodes(self)
    }
    fn reset(&self) {
        PendingSend::reset(self);
    }
}
