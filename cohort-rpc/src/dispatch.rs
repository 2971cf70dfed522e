//! Typed dispatch over the ordered transport.
//!
//! Outbound, a typed call is serialized behind a fixed header, registered in
//! the in-flight table, and handed to the transport; the transport's
//! delivered callback resolves the call's destination set. Inbound, the
//! header routes a buffer either to a replica's receive function (requests)
//! or to the originating pending call (replies).

use crate::error::{RpcError, RpcResult};
use crate::registry::{ErasedReplica, MethodTables, TypeRegistry};
use crate::results::{
    PendingCall, PendingResults, PendingSend, QueryResults, SendResults,
};
use crate::view::View;
use crate::{DeliveredCallback, MessageSink, OrderedTransport};
use cohort_proto::{
    FLAG_CASCADE, FunctionTag, HEADER_BYTES, Header, NodeId, Opcode, SubgroupId, WireDeserialize,
    WireSerialize,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What the view-change adaptor does with a call that was handed to the
/// transport but not yet delivered when the view changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Reset the pending call and re-send under the new view. Default for
    /// ordered sends, which carry no reply and are safe to re-issue until
    /// the transport confirms delivery.
    Resend,
    /// Fail the call with `SenderRemoved`. Default for queries, where a
    /// duplicate execution would duplicate side effects.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct InFlightKey {
    subgroup: SubgroupId,
    function: FunctionTag,
    seq: u64,
}

type ApplyReply = Arc<dyn Fn(NodeId, &[u8]) + Send + Sync>;

struct InFlightEntry {
    pending: Box<dyn PendingCall>,
    apply_reply: Option<ApplyReply>,
    policy: FailurePolicy,
    delivered: bool,
    resend_buf: Option<Vec<u8>>,
}

enum CallTarget {
    Subgroup,
    Node(NodeId),
}

/// Per-node RPC runtime: owns the replica table and the in-flight table,
/// and is the node's receiver for the ordered transport.
pub struct Dispatcher {
    node_id: NodeId,
    transport: Arc<dyn OrderedTransport>,
    registry: TypeRegistry,
    replicas: Mutex<BTreeMap<SubgroupId, Box<dyn ErasedReplica>>>,
    in_flight: Mutex<BTreeMap<InFlightKey, InFlightEntry>>,
    next_seq: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        node_id: NodeId,
        transport: Arc<dyn OrderedTransport>,
        registry: TypeRegistry,
    ) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            node_id,
            transport,
            registry,
            replicas: Mutex::new(BTreeMap::new()),
            in_flight: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Instantiates the replica for `subgroup` through the type registry's
    /// factory. Replaces any previous replica for the subgroup.
    pub fn provision(
        &self,
        subgroup: SubgroupId,
        type_id: cohort_proto::SubgroupTypeId,
    ) -> RpcResult<()> {
        let replica = self.registry.create(type_id)?;
        debug!(%subgroup, %type_id, "provisioned replica");
        self.replicas.lock().insert(subgroup, replica);
        Ok(())
    }

    /// Installs a concrete object as the replica for `subgroup`.
    pub fn provision_object<T: Send + 'static>(
        &self,
        subgroup: SubgroupId,
        tables: Arc<MethodTables<T>>,
        object: T,
    ) {
        self.replicas.lock().insert(
            subgroup,
            Box::new(crate::registry::Replica::new(object, tables)),
        );
    }

    /// A typed handle for invoking methods on the replicas of `subgroup`.
    pub fn replicated<T>(
        self: &Arc<Self>,
        subgroup: SubgroupId,
        tables: Arc<MethodTables<T>>,
    ) -> Replicated<T> {
        Replicated {
            dispatcher: self.clone(),
            subgroup,
            tables,
        }
    }

    fn launch(
        self: &Arc<Self>,
        subgroup: SubgroupId,
        tag: FunctionTag,
        buf: Vec<u8>,
        target: CallTarget,
        pending: Box<dyn PendingCall>,
        apply_reply: Option<ApplyReply>,
        policy: FailurePolicy,
    ) -> RpcResult<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let key = InFlightKey {
            subgroup,
            function: tag,
            seq,
        };
        let resend_buf = if policy == FailurePolicy::Resend {
            Some(buf.clone())
        } else {
            None
        };
        self.in_flight.lock().insert(
            key,
            InFlightEntry {
                pending,
                apply_reply,
                policy,
                delivered: false,
                resend_buf,
            },
        );
        let sent = match target {
            CallTarget::Subgroup => {
                self.transport
                    .ordered_multicast(subgroup, buf, self.delivered_callback(key))
            }
            CallTarget::Node(dest) => {
                self.transport
                    .p2p_send(dest, buf, self.delivered_callback(key))
            }
        };
        if let Err(e) = sent {
            self.in_flight.lock().remove(&key);
            return Err(RpcError::DeliveryFailed(e.to_string()));
        }
        Ok(())
    }

    fn delivered_callback(self: &Arc<Self>, key: InFlightKey) -> DeliveredCallback {
        let weak = Arc::downgrade(self);
        Box::new(move |dests: &[NodeId]| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.mark_delivered(key, dests);
            }
        })
    }

    fn mark_delivered(&self, key: InFlightKey, dests: &[NodeId]) {
        let mut table = self.in_flight.lock();
        if let Some(entry) = table.get_mut(&key) {
            entry.delivered = true;
            entry.pending.fulfill_map(dests);
            if entry.pending.all_responded() {
                table.remove(&key);
            }
        } else {
            trace!(?key, "delivery confirmation for a completed call");
        }
    }

    /// Entry point for buffers the transport delivers to this node.
    pub fn receive_message(&self, buf: &[u8]) -> RpcResult<()> {
        let header = Header::read_from(buf)?;
        let total = HEADER_BYTES + header.payload_size as usize;
        if buf.len() < total {
            return Err(RpcError::Codec(format!(
                "buffer shorter than its declared payload: {} < {}",
                buf.len(),
                total
            )));
        }
        let payload = &buf[HEADER_BYTES..total];
        if header.opcode.is_reply {
            self.apply_reply(&header, payload);
            Ok(())
        } else {
            self.execute_request(&header, payload)
        }
    }

    /// Routes a reply to the oldest live in-flight call with its opcode.
    /// Replies with no matching call (a cascaded reply seen by a non-sender,
    /// or a straggler after garbage collection) are dropped.
    fn apply_reply(&self, header: &Header, payload: &[u8]) {
        let matched = {
            let table = self.in_flight.lock();
            let lo = InFlightKey {
                subgroup: header.opcode.subgroup_id,
                function: header.opcode.function_id,
                seq: 0,
            };
            let hi = InFlightKey {
                seq: u64::MAX,
                ..lo
            };
            table
                .range(lo..=hi)
                .find_map(|(key, entry)| entry.apply_reply.clone().map(|f| (*key, f)))
        };
        match matched {
            Some((key, apply)) => {
                apply(header.from, payload);
                let mut table = self.in_flight.lock();
                if let Some(entry) = table.get(&key) {
                    if entry.pending.all_responded() {
                        table.remove(&key);
                    }
                }
            }
            None => trace!(from = %header.from, "reply with no matching in-flight call"),
        }
    }

    fn execute_request(&self, header: &Header, payload: &[u8]) -> RpcResult<()> {
        let subgroup = header.opcode.subgroup_id;
        let result = {
            let mut replicas = self.replicas.lock();
            let replica = replicas
                .get_mut(&subgroup)
                .ok_or(RpcError::UnknownSubgroup(subgroup))?;
            if replica.type_id() != header.opcode.class_id {
                return Err(RpcError::DeliveryFailed(format!(
                    "opcode class {} does not match subgroup type {}",
                    header.opcode.class_id,
                    replica.type_id()
                )));
            }
            let mut out_alloc = |size: usize| vec![0u8; size];
            replica.receive(header.from, header.opcode, payload, &mut out_alloc)?
        };
        if let Some(detail) = &result.exception {
            debug!(
                from = %header.from,
                tag = %header.opcode.function_id,
                "remote method raised: {}", detail
            );
        }
        if result.payload_size == 0 {
            return Ok(());
        }
        let mut reply = result.buffer;
        Header {
            payload_size: result.payload_size as u64,
            opcode: result.opcode,
            from: self.node_id,
            flags: 0,
        }
        .write_to(&mut reply)?;
        let noop: DeliveredCallback = Box::new(|_| {});
        if header.flags & FLAG_CASCADE != 0 {
            self.transport.ordered_multicast(subgroup, reply, noop)
        } else {
            self.transport.p2p_send(header.from, reply, noop)
        }
    }

    /// Drives every in-flight call through the failure semantics of a view
    /// transition: evicted callers fail their calls, departed destinations
    /// fail their slots, and undelivered calls follow their
    /// [`FailurePolicy`].
    pub fn on_view_change(self: &Arc<Self>, prev: &View, next: &View) {
        trace!(prev = %prev.vid, next = %next.vid, "applying view change to in-flight calls");
        let mut resend: Vec<(InFlightKey, Vec<u8>)> = Vec::new();
        {
            let mut table = self.in_flight.lock();
            table.retain(|key, entry| {
                if !next.subgroup_contains(key.subgroup, self.node_id) {
                    entry.pending.set_exception_for_caller_removed();
                    return false;
                }
                if !entry.delivered {
                    return match entry.policy {
                        FailurePolicy::Resend => {
                            entry.pending.reset();
                            if let Some(buf) = &entry.resend_buf {
                                resend.push((*key, buf.clone()));
                            }
                            true
                        }
                        FailurePolicy::Abort => {
                            entry.pending.set_exception_for_caller_removed();
                            false
                        }
                    };
                }
                let members = next.members_of(key.subgroup);
                for nid in entry.pending.dest_nodes() {
                    if !members.contains(&nid) {
                        entry.pending.set_exception_for_removed_node(nid);
                    }
                }
                !entry.pending.all_responded()
            });
        }
        for (key, buf) in resend {
            debug!(
                subgroup = %key.subgroup,
                tag = %key.function,
                "re-sending undelivered call under new view"
            );
            let callback = self.delivered_callback(key);
            if let Err(e) = self
                .transport
                .ordered_multicast(key.subgroup, buf, callback)
            {
                warn!(subgroup = %key.subgroup, "re-send failed: {}", e);
                let mut table = self.in_flight.lock();
                if let Some(entry) = table.remove(&key) {
                    entry.pending.set_delivery_failed(&e.to_string());
                }
            }
        }
    }
}

impl MessageSink for Dispatcher {
    fn on_message(&self, buf: &[u8]) {
        if let Err(e) = self.receive_message(buf) {
            warn!(node = %self.node_id, "dropping inbound message: {}", e);
        }
    }
}

/// Typed handle for invoking methods on the replicas of one subgroup.
///
/// Methods are named by their literal registration name; the handle derives
/// and validates the function tag, serializes the argument tuple, and hands
/// the call to the dispatcher.
pub struct Replicated<T> {
    dispatcher: Arc<Dispatcher>,
    subgroup: SubgroupId,
    tables: Arc<MethodTables<T>>,
}

impl<T> Clone for Replicated<T> {
    fn clone(&self) -> Self {
        Replicated {
            dispatcher: self.dispatcher.clone(),
            subgroup: self.subgroup,
            tables: self.tables.clone(),
        }
    }
}

impl<T: 'static> Replicated<T> {
    pub fn subgroup(&self) -> SubgroupId {
        self.subgroup
    }

    /// Ordered multicast with no reply. Resolves to the set of nodes the
    /// message was delivered to.
    pub fn ordered_send<A: WireSerialize>(&self, method: &str, args: &A) -> RpcResult<SendResults> {
        let (tag, info) = self.tables.tag_for(method, false)?;
        if info.returns_value {
            trace!(method, "ordered send to a valued method; replies will be dropped");
        }
        let buf = self.encode(tag, 0, args)?;
        let pending = PendingSend::new();
        let results = pending.get_results();
        self.dispatcher.launch(
            self.subgroup,
            tag,
            buf,
            CallTarget::Subgroup,
            Box::new(pending),
            None,
            FailurePolicy::Resend,
        )?;
        Ok(results)
    }

    /// Ordered multicast collecting one reply per replica.
    pub fn ordered_query<A, R>(&self, method: &str, args: &A) -> RpcResult<QueryResults<R>>
    where
        A: WireSerialize,
        R: WireDeserialize + Clone + Send + 'static,
    {
        self.query_inner(method, args, 0, CallTarget::Subgroup)
    }

    /// Ordered query whose replies cascade back through the ordered channel
    /// instead of unicasts to the caller.
    pub fn ordered_query_cascading<A, R>(
        &self,
        method: &str,
        args: &A,
    ) -> RpcResult<QueryResults<R>>
    where
        A: WireSerialize,
        R: WireDeserialize + Clone + Send + 'static,
    {
        self.query_inner(method, args, FLAG_CASCADE, CallTarget::Subgroup)
    }

    /// Point-to-point call to a single replica, collecting its reply.
    pub fn p2p_query<A, R>(&self, dest: NodeId, method: &str, args: &A) -> RpcResult<QueryResults<R>>
    where
        A: WireSerialize,
        R: WireDeserialize + Clone + Send + 'static,
    {
        let (tag, info) = self.tables.tag_for(method, true)?;
        if !info.returns_value {
            return Err(RpcError::UnknownMethod(method.to_string()));
        }
        let buf = self.encode(tag, 0, args)?;
        let pending = PendingResults::<R>::new();
        let results = pending.get_results();
        let apply = make_apply(&pending);
        self.dispatcher.launch(
            self.subgroup,
            tag,
            buf,
            CallTarget::Node(dest),
            Box::new(pending),
            Some(apply),
            FailurePolicy::Abort,
        )?;
        Ok(results)
    }

    /// Point-to-point send with no reply.
    pub fn p2p_send<A: WireSerialize>(
        &self,
        dest: NodeId,
        method: &str,
        args: &A,
    ) -> RpcResult<SendResults> {
        let (tag, _info) = self.tables.tag_for(method, true)?;
        let buf = self.encode(tag, 0, args)?;
        let pending = PendingSend::new();
        let results = pending.get_results();
        self.dispatcher.launch(
            self.subgroup,
            tag,
            buf,
            CallTarget::Node(dest),
            Box::new(pending),
            None,
            FailurePolicy::Abort,
        )?;
        Ok(results)
    }

    fn query_inner<A, R>(
        &self,
        method: &str,
        args: &A,
        flags: u32,
        target: CallTarget,
    ) -> RpcResult<QueryResults<R>>
    where
        A: WireSerialize,
        R: WireDeserialize + Clone + Send + 'static,
    {
        let (tag, info) = self.tables.tag_for(method, false)?;
        if !info.returns_value {
            return Err(RpcError::UnknownMethod(method.to_string()));
        }
        let buf = self.encode(tag, flags, args)?;
        let pending = PendingResults::<R>::new();
        let results = pending.get_results();
        let apply = make_apply(&pending);
        self.dispatcher.launch(
            self.subgroup,
            tag,
            buf,
            target,
            Box::new(pending),
            Some(apply),
            FailurePolicy::Abort,
        )?;
        Ok(results)
    }

    /// Builds header + payload in one exact-size buffer.
    fn encode<A: WireSerialize>(&self, tag: FunctionTag, flags: u32, args: &A) -> RpcResult<Vec<u8>> {
        let opcode = Opcode {
            class_id: self.tables.type_id(),
            subgroup_id: self.subgroup,
            function_id: tag,
            is_reply: false,
        };
        let payload_size = args.wire_size();
        let mut buf = vec![0u8; HEADER_BYTES + payload_size];
        Header {
            payload_size: payload_size as u64,
            opcode,
            from: self.dispatcher.node_id(),
            flags,
        }
        .write_to(&mut buf)?;
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.set_position(HEADER_BYTES as u64);
        args.write_to(&mut cursor)?;
        Ok(buf)
    }
}

fn make_apply<R>(pending: &PendingResults<R>) -> ApplyReply
where
    R: WireDeserialize + Send + 'static,
{
    let pending = pending.clone();
    Arc::new(move |from: NodeId, payload: &[u8]| {
        match cohort_proto::deserialize::<Result<R, String>>(payload) {
            Ok(Ok(value)) => pending.set_value(from, value),
            Ok(Err(detail)) => {
                pending.set_exception(from, RpcError::RemoteException { who: from, detail });
            }
            Err(e) => pending.set_exception(
                from,
                RpcError::DeliveryFailed(format!("reply decode failed: {}", e)),
            ),
        }
    })
}
