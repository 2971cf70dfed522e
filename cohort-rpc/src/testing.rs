//! In-process stand-ins for the transport and membership collaborators.
//!
//! [`LocalGroup`] wires any number of dispatchers into one process: ordered
//! multicasts are delivered to every subgroup member through a single global
//! queue, which trivially gives every member the same delivery order. Views
//! are installed explicitly, driving each dispatcher's view-change adaptor
//! the way a membership service would.
//!
//! Delivery is synchronous by default (a send returns after every receive
//! function ran). [`LocalGroup::with_delivery_thread`] moves delivery onto a
//! dedicated thread instead, which exercises the blocking paths of reply
//! collection from a realistic second thread.

use crate::dispatch::Dispatcher;
use crate::error::{RpcError, RpcResult};
use crate::view::View;
use crate::{DeliveredCallback, MembershipService, MessageSink, OrderedTransport};
use cohort_proto::{NodeId, SubgroupId};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::trace;

enum Envelope {
    Multicast { subgroup: SubgroupId, buf: Vec<u8> },
    Direct { dest: NodeId, buf: Vec<u8> },
}

enum Held {
    Multicast {
        subgroup: SubgroupId,
        buf: Vec<u8>,
        on_delivered: DeliveredCallback,
    },
    Direct {
        dest: NodeId,
        buf: Vec<u8>,
        on_delivered: DeliveredCallback,
    },
}

struct GroupState {
    view: View,
    nodes: BTreeMap<NodeId, Arc<Dispatcher>>,
    queue: VecDeque<Envelope>,
    pumping: bool,
    hold_multicasts: bool,
    hold_p2p: bool,
    held: Vec<Held>,
}

struct GroupInner {
    state: Mutex<GroupState>,
    handlers: Mutex<Vec<Box<dyn Fn(&View, &View) + Send + Sync>>>,
    thread_tx: Option<Sender<Envelope>>,
}

/// An in-process group of dispatchers sharing one ordered channel.
pub struct LocalGroup {
    inner: Arc<GroupInner>,
}

impl LocalGroup {
    /// A group with synchronous inline delivery.
    pub fn new(view: View) -> LocalGroup {
        LocalGroup {
            inner: Arc::new(GroupInner {
                state: Mutex::new(GroupState {
                    view,
                    nodes: BTreeMap::new(),
                    queue: VecDeque::new(),
                    pumping: false,
                    hold_multicasts: false,
                    hold_p2p: false,
                    held: Vec::new(),
                }),
                handlers: Mutex::new(Vec::new()),
                thread_tx: None,
            }),
        }
    }

    /// A group whose deliveries run on a dedicated thread. The thread exits
    /// when the group is dropped.
    pub fn with_delivery_thread(view: View) -> LocalGroup {
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(GroupInner {
            state: Mutex::new(GroupState {
                view,
                nodes: BTreeMap::new(),
                queue: VecDeque::new(),
                pumping: false,
                hold_multicasts: false,
                hold_p2p: false,
                held: Vec::new(),
            }),
            handlers: Mutex::new(Vec::new()),
            thread_tx: Some(tx),
        });
        spawn_delivery_thread(Arc::downgrade(&inner), rx);
        LocalGroup { inner }
    }

    /// The transport endpoint for one node.
    pub fn transport(&self, node: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node,
            group: self.inner.clone(),
        })
    }

    /// Registers a dispatcher as the receiver for its node id.
    pub fn register_node(&self, dispatcher: &Arc<Dispatcher>) {
        self.inner
            .state
            .lock()
            .nodes
            .insert(dispatcher.node_id(), dispatcher.clone());
    }

    pub fn current_view(&self) -> View {
        self.inner.state.lock().view.clone()
    }

    /// Installs the next view: undelivered old-view multicasts are dropped,
    /// subscribed handlers fire, and every dispatcher's view-change adaptor
    /// runs.
    pub fn install_view(&self, next: View) {
        let (prev, dispatchers) = {
            let mut state = self.inner.state.lock();
            // Multicasts the old view never delivered die with it.
            state.held.retain(|h| matches!(h, Held::Direct { .. }));
            let prev = std::mem::replace(&mut state.view, next.clone());
            (prev, state.nodes.values().cloned().collect::<Vec<_>>())
        };
        for handler in self.inner.handlers.lock().iter() {
            handler(&prev, &next);
        }
        for dispatcher in dispatchers {
            dispatcher.on_view_change(&prev, &next);
        }
        pump(&self.inner);
    }

    /// While on, ordered multicasts are parked before entering the ordered
    /// layer: no delivery and no delivered callback. Turning it off releases
    /// anything still parked.
    pub fn hold_multicasts(&self, on: bool) {
        self.inner.state.lock().hold_multicasts = on;
        if !on {
            self.release_held(true, false);
        }
    }

    /// While on, point-to-point buffers (including unicast replies) are
    /// parked. Turning it off releases them.
    pub fn hold_p2p(&self, on: bool) {
        self.inner.state.lock().hold_p2p = on;
        if !on {
            self.release_held(false, true);
        }
    }

    fn release_held(&self, multicasts: bool, p2p: bool) {
        let released: Vec<Held> = {
            let mut state = self.inner.state.lock();
            let mut kept = Vec::new();
            let mut released = Vec::new();
            for item in state.held.drain(..) {
                let is_multicast = matches!(item, Held::Multicast { .. });
                if (is_multicast && multicasts) || (!is_multicast && p2p) {
                    released.push(item);
                } else {
                    kept.push(item);
                }
            }
            state.held = kept;
            released
        };
        for item in released {
            match item {
                Held::Multicast {
                    subgroup,
                    buf,
                    on_delivered,
                } => {
                    let members = self.inner.state.lock().view.members_of(subgroup);
                    enqueue(&self.inner, Envelope::Multicast { subgroup, buf });
                    on_delivered(&members);
                }
                Held::Direct {
                    dest,
                    buf,
                    on_delivered,
                } => {
                    enqueue(&self.inner, Envelope::Direct { dest, buf });
                    on_delivered(&[dest]);
                }
            }
        }
        pump(&self.inner);
    }
}

impl MembershipService for LocalGroup {
    fn subscribe_view_changes(&self, handler: Box<dyn Fn(&View, &View) + Send + Sync>) {
        self.inner.handlers.lock().push(handler);
    }
}

/// One node's endpoint of the shared ordered channel.
pub struct LocalTransport {
    node: NodeId,
    group: Arc<GroupInner>,
}

impl OrderedTransport for LocalTransport {
    fn ordered_multicast(
        &self,
        subgroup: SubgroupId,
        buf: Vec<u8>,
        on_delivered: DeliveredCallback,
    ) -> RpcResult<()> {
        let members = {
            let mut state = self.group.state.lock();
            if !state.view.subgroup_contains(subgroup, self.node) {
                return Err(RpcError::DeliveryFailed(format!(
                    "node {} is not a member of subgroup {}",
                    self.node, subgroup
                )));
            }
            if state.hold_multicasts {
                state.held.push(Held::Multicast {
                    subgroup,
                    buf,
                    on_delivered,
                });
                return Ok(());
            }
            state.view.members_of(subgroup)
        };
        enqueue(&self.group, Envelope::Multicast { subgroup, buf });
        on_delivered(&members);
        pump(&self.group);
        Ok(())
    }

    fn p2p_send(
        &self,
        dest: NodeId,
        buf: Vec<u8>,
        on_delivered: DeliveredCallback,
    ) -> RpcResult<()> {
        {
            let mut state = self.group.state.lock();
            if !state.view.contains(dest) {
                return Err(RpcError::DeliveryFailed(format!(
                    "node {} is not in the current view",
                    dest
                )));
            }
            if state.hold_p2p {
                state.held.push(Held::Direct {
                    dest,
                    buf,
                    on_delivered,
                });
                return Ok(());
            }
        }
        enqueue(&self.group, Envelope::Direct { dest, buf });
        on_delivered(&[dest]);
        pump(&self.group);
        Ok(())
    }
}

fn enqueue(group: &Arc<GroupInner>, envelope: Envelope) {
    match &group.thread_tx {
        Some(tx) => {
            // The delivery thread is gone only when the group is being torn
            // down; dropping the envelope then is fine.
            let _ = tx.send(envelope);
        }
        None => group.state.lock().queue.push_back(envelope),
    }
}

/// Drains the inline queue. Re-entrant sends from inside a receive function
/// only enqueue; the outermost pump delivers them, preserving one global
/// delivery order.
fn pump(group: &Arc<GroupInner>) {
    if group.thread_tx.is_some() {
        return;
    }
    {
        let mut state = group.state.lock();
        if state.pumping {
            return;
        }
        state.pumping = true;
    }
    loop {
        let envelope = {
            let mut state = group.state.lock();
            match state.queue.pop_front() {
                Some(envelope) => envelope,
                None => {
                    state.pumping = false;
                    return;
                }
            }
        };
        deliver(group, envelope);
    }
}

fn deliver(group: &Arc<GroupInner>, envelope: Envelope) {
    match envelope {
        Envelope::Multicast { subgroup, buf } => {
            let sinks: Vec<Arc<Dispatcher>> = {
                let state = group.state.lock();
                state
                    .view
                    .members_of(subgroup)
                    .iter()
                    .filter_map(|nid| state.nodes.get(nid).cloned())
                    .collect()
            };
            for sink in sinks {
                sink.on_message(&buf);
            }
        }
        Envelope::Direct { dest, buf } => {
            let sink = group.state.lock().nodes.get(&dest).cloned();
            match sink {
                Some(sink) => sink.on_message(&buf),
                None => trace!(%dest, "dropping buffer for an unregistered node"),
            }
        }
    }
}

fn spawn_delivery_thread(weak: Weak<GroupInner>, rx: Receiver<Envelope>) {
    std::thread::spawn(move || {
        while let Ok(envelope) = rx.recv() {
            let Some(group) = weak.upgrade() else { break };
            deliver(&group, envelope);
        }
    });
}
