//! Method registration for replicated types.
//!
//! A replicated type declares its callable methods once, before the first
//! send. Each method gets an internal [`FunctionTag`] derived from its
//! literal name, with the tag's parity encoding ordered vs point-to-point.
//! Registration produces the receive functions the dispatcher routes inbound
//! requests through; two distinct methods hashing to the same tag are
//! refused at build time.

use crate::error::{RpcError, RpcResult};
use cohort_proto::{
    FunctionTag, HEADER_BYTES, NodeId, Opcode, SubgroupTypeId, WireDeserialize, WireSerialize,
    WireSize,
};
use std::any::TypeId;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

/// Result of executing a receive function.
///
/// For queries, `buffer` holds header space followed by the serialized
/// reply body of `payload_size` bytes; the dispatcher fills in the header
/// and hands the buffer to the transport. `payload_size == 0` means no
/// reply is sent. A raised method lands in `exception` (and, for queries,
/// travels inside the reply body as well).
pub struct ReceiveResult {
    pub opcode: Opcode,
    pub payload_size: usize,
    pub buffer: Vec<u8>,
    pub exception: Option<String>,
}

/// Allocator for reply buffers, provided by the transport. Returns a zeroed
/// buffer of the requested size whose ownership passes back through the
/// returned [`ReceiveResult`].
pub type OutAlloc<'a> = &'a mut dyn FnMut(usize) -> Vec<u8>;

type ReceiveFn<T> =
    Box<dyn Fn(&mut T, NodeId, Opcode, &[u8], OutAlloc) -> RpcResult<ReceiveResult> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name: String,
    pub p2p: bool,
    pub returns_value: bool,
}

/// Frozen method tables of one replicated type.
pub struct MethodTables<T> {
    type_id: SubgroupTypeId,
    recv: BTreeMap<FunctionTag, ReceiveFn<T>>,
    info: BTreeMap<FunctionTag, MethodInfo>,
}

impl<T> MethodTables<T> {
    pub fn builder(type_id: SubgroupTypeId) -> MethodTableBuilder<T> {
        MethodTableBuilder {
            type_id,
            recv: BTreeMap::new(),
            info: BTreeMap::new(),
            collision: None,
        }
    }

    pub fn type_id(&self) -> SubgroupTypeId {
        self.type_id
    }

    /// The internal tag of `name` in the given mode, failing when no such
    /// method was registered.
    pub fn tag_for(&self, name: &str, p2p: bool) -> RpcResult<(FunctionTag, &MethodInfo)> {
        let tag = FunctionTag::from_name(name, p2p);
        match self.info.get(&tag) {
            Some(info) => Ok((tag, info)),
            None => Err(RpcError::UnknownMethod(name.to_string())),
        }
    }

    pub fn method_info(&self, tag: FunctionTag) -> Option<&MethodInfo> {
        self.info.get(&tag)
    }

    pub(crate) fn receive(
        &self,
        obj: &mut T,
        sender: NodeId,
        opcode: Opcode,
        payload: &[u8],
        out_alloc: OutAlloc,
    ) -> RpcResult<ReceiveResult> {
        let f = self
            .recv
            .get(&opcode.function_id)
            .ok_or_else(|| RpcError::UnknownMethod(opcode.function_id.to_string()))?;
        f(obj, sender, opcode, payload, out_alloc)
    }
}

/// Builder collecting a type's methods; [`build`](MethodTableBuilder::build)
/// freezes them and rejects tag collisions.
pub struct MethodTableBuilder<T> {
    type_id: SubgroupTypeId,
    recv: BTreeMap<FunctionTag, ReceiveFn<T>>,
    info: BTreeMap<FunctionTag, MethodInfo>,
    collision: Option<(String, String)>,
}

impl<T> MethodTableBuilder<T> {
    /// Registers an ordered method: delivered to every replica of the
    /// subgroup in the globally agreed order.
    pub fn ordered<Args, Ret, F>(self, name: &str, f: F) -> Self
    where
        Args: WireDeserialize + 'static,
        Ret: WireSerialize + 'static,
        F: Fn(&mut T, Args) -> Result<Ret, String> + Send + Sync + 'static,
    {
        self.register(name, false, f)
    }

    /// Registers a point-to-point method: invoked on a single replica with
    /// no cross-call ordering promise.
    pub fn p2p<Args, Ret, F>(self, name: &str, f: F) -> Self
    where
        Args: WireDeserialize + 'static,
        Ret: WireSerialize + 'static,
        F: Fn(&mut T, Args) -> Result<Ret, String> + Send + Sync + 'static,
    {
        self.register(name, true, f)
    }

    fn register<Args, Ret, F>(mut self, name: &str, p2p: bool, f: F) -> Self
    where
        Args: WireDeserialize + 'static,
        Ret: WireSerialize + 'static,
        F: Fn(&mut T, Args) -> Result<Ret, String> + Send + Sync + 'static,
    {
        let tag = FunctionTag::from_name(name, p2p);
        if let Some(existing) = self.info.get(&tag) {
            if self.collision.is_none() {
                self.collision = Some((existing.name.clone(), name.to_string()));
            }
            return self;
        }
        let returns_value = TypeId::of::<Ret>() != TypeId::of::<()>();
        let recv: ReceiveFn<T> = Box::new(
            move |obj: &mut T,
                  _sender: NodeId,
                  opcode: Opcode,
                  payload: &[u8],
                  out_alloc: OutAlloc| {
                let args = Args::read_from(&mut Cursor::new(payload)).map_err(|e| {
                    RpcError::DeliveryFailed(format!("argument decode failed: {}", e))
                })?;
                let outcome = f(obj, args);
                let exception = outcome.as_ref().err().cloned();
                if !returns_value {
                    return Ok(ReceiveResult {
                        opcode: opcode.reply(),
                        payload_size: 0,
                        buffer: Vec::new(),
                        exception,
                    });
                }
                let body_size = outcome.wire_size();
                let mut buffer = out_alloc(HEADER_BYTES + body_size);
                let mut cursor = Cursor::new(&mut buffer[..]);
                cursor.set_position(HEADER_BYTES as u64);
                outcome
                    .write_to(&mut cursor)
                    .map_err(|e| RpcError::Codec(e.to_string()))?;
                Ok(ReceiveResult {
                    opcode: opcode.reply(),
                    payload_size: body_size,
                    buffer,
                    exception,
                })
            },
        );
        self.recv.insert(tag, recv);
        self.info.insert(
            tag,
            MethodInfo {
                name: name.to_string(),
                p2p,
                returns_value,
            },
        );
        self
    }

    pub fn build(self) -> RpcResult<Arc<MethodTables<T>>> {
        if let Some((first, second)) = self.collision {
            return Err(RpcError::TagCollision { first, second });
        }
        Ok(Arc::new(MethodTables {
            type_id: self.type_id,
            recv: self.recv,
            info: self.info,
        }))
    }
}

/// A type-erased replica entry: the object together with its receive table.
pub trait ErasedReplica: Send {
    fn type_id(&self) -> SubgroupTypeId;
    fn receive(
        &mut self,
        sender: NodeId,
        opcode: Opcode,
        payload: &[u8],
        out_alloc: OutAlloc,
    ) -> RpcResult<ReceiveResult>;
}

pub struct Replica<T> {
    object: T,
    tables: Arc<MethodTables<T>>,
}

impl<T> Replica<T> {
    pub fn new(object: T, tables: Arc<MethodTables<T>>) -> Self {
        Replica { object, tables }
    }
}

impl<T: Send> ErasedReplica for Replica<T> {
    fn type_id(&self) -> SubgroupTypeId {
        self.tables.type_id()
    }

    fn receive(
        &mut self,
        sender: NodeId,
        opcode: Opcode,
        payload: &[u8],
        out_alloc: OutAlloc,
    ) -> RpcResult<ReceiveResult> {
        self.tables
            .receive(&mut self.object, sender, opcode, payload, out_alloc)
    }
}

type ReplicaFactory = Box<dyn Fn() -> Box<dyn ErasedReplica> + Send + Sync>;

/// Factory table keyed by subgroup type. The dispatcher instantiates a
/// replica through it when a subgroup is provisioned, without ever
/// reflecting on the concrete type.
#[derive(Default)]
pub struct TypeRegistry {
    factories: BTreeMap<SubgroupTypeId, ReplicaFactory>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, F>(&mut self, tables: Arc<MethodTables<T>>, factory: F)
    where
        T: Send + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let type_id = tables.type_id();
        self.factories.insert(
            type_id,
            Box::new(move || Box::new(Replica::new(factory(), tables.clone()))),
        );
    }

    pub fn create(&self, type_id: SubgroupTypeId) -> RpcResult<Box<dyn ErasedReplica>> {
        match self.factories.get(&type_id) {
            Some(factory) => Ok(factory()),
            None => Err(RpcError::UnknownType(type_id)),
        }
    }
}
