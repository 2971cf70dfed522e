use cohort_proto::{NodeId, SubgroupId};
use thiserror::Error;

pub type RpcResult<T> = Result<T, RpcError>;

/// Errors surfaced to RPC callers.
///
/// The enum is `Clone + Eq` so that one failure can be fanned out to every
/// per-destination future; wrapped causes are stored as strings because the
/// underlying errors are not `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The remote node's method raised; the payload is carried through
    /// opaquely and re-raised at the caller.
    #[error("node {who} raised a remote exception: {detail}")]
    RemoteException { who: NodeId, detail: String },
    /// The callee left the subgroup before replying.
    #[error("node {0} was removed from the subgroup before replying")]
    NodeRemoved(NodeId),
    /// This node was evicted from the subgroup before the call could
    /// complete; no replies will arrive.
    #[error("the sender was removed from its subgroup before the call completed")]
    SenderRemoved,
    /// The message could not be delivered in any view, or the dispatch
    /// plumbing failed for this call. Terminal.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
    /// The handle observed a `reset()` of its call; a fresh handle governs
    /// the retried call.
    #[error("this query handle was invalidated when its call was reissued")]
    StaleHandle,
    #[error("node {0} is not a destination of this call")]
    NotADestination(NodeId),
    #[error("no replica is registered for subgroup {0}")]
    UnknownSubgroup(SubgroupId),
    #[error("no factory is registered for subgroup type {0}")]
    UnknownType(cohort_proto::SubgroupTypeId),
    #[error("method {0:?} is not registered with this mode on the type")]
    UnknownMethod(String),
    #[error("methods {first:?} and {second:?} hash to the same function tag")]
    TagCollision { first: String, second: String },
    /// Serialization failed. Stored as a string because the codec error is
    /// not Clone/Eq.
    #[error("wire codec error: {0}")]
    Codec(String),
}

impl From<cohort_proto::Error> for RpcError {
    fn from(e: cohort_proto::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}
