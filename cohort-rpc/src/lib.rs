//! # Cohort RPC
//!
//! Typed RPC invocation and reply collection over a totally-ordered
//! multicast.
//!
//! Methods on replicated objects become either ordered calls (every replica
//! executes the same call in the same globally agreed order) or
//! point-to-point calls to a single replica. The runtime's job is the glue
//! between a caller and the transport: wire framing, method registration and
//! tag routing, the two-stage futures that collect replies, and the failure
//! semantics when membership changes mid-flight.
//!
//! ## Architecture
//!
//! - **Registry**: each replicated type registers its methods once; names
//!   hash to function tags whose parity encodes ordered vs point-to-point.
//! - **Dispatch**: [`Dispatcher`] serializes outbound calls, tracks them in
//!   an in-flight table, and routes inbound buffers to replicas (requests)
//!   or pending calls (replies).
//! - **Reply collection**: [`QueryResults`] resolves first to the set of
//!   destinations, then per-destination to each reply.
//! - **View changes**: the adaptor walks in-flight calls on every membership
//!   transition, failing out departed callees and evicted callers.
//!
//! The ordered transport (TOM) and the membership service (GMS) are external
//! collaborators, consumed through the [`OrderedTransport`] and
//! [`MembershipService`] traits; the [`testing`] module provides in-process
//! stand-ins.

pub mod dispatch;
pub mod error;
pub mod registry;
pub mod results;
pub mod testing;
pub mod view;

use cohort_proto::{NodeId, SubgroupId};

pub use dispatch::{Dispatcher, FailurePolicy, Replicated};
pub use error::{RpcError, RpcResult};
pub use registry::{MethodTableBuilder, MethodTables, ReceiveResult, TypeRegistry};
pub use results::{
    PendingCall, PendingResults, PendingSend, QueryResults, REPLY_POLL_INTERVAL, ReplyMap,
    SendResults,
};
pub use view::{Mode, Shard, SubgroupLayout, View};

/// Invoked by the transport once a message has entered the ordered layer,
/// with the destinations it was delivered to.
pub type DeliveredCallback = Box<dyn FnOnce(&[NodeId]) + Send>;

/// The totally-ordered multicast collaborator.
///
/// Buffer ownership transfers to the transport on send. Within one
/// subgroup, delivery order is identical at every member; point-to-point
/// sends carry no ordering promise.
pub trait OrderedTransport: Send + Sync {
    fn ordered_multicast(
        &self,
        subgroup: SubgroupId,
        buf: Vec<u8>,
        on_delivered: DeliveredCallback,
    ) -> RpcResult<()>;

    fn p2p_send(
        &self,
        dest: NodeId,
        buf: Vec<u8>,
        on_delivered: DeliveredCallback,
    ) -> RpcResult<()>;
}

/// Receiver registration seam: the transport delivers every inbound buffer
/// of a node through its sink, serially per subgroup.
pub trait MessageSink: Send + Sync {
    fn on_message(&self, buf: &[u8]);
}

/// The group-membership collaborator, delivering monotonically numbered
/// view transitions.
pub trait MembershipService: Send + Sync {
    fn subscribe_view_changes(&self, handler: Box<dyn Fn(&View, &View) + Send + Sync>);
}
