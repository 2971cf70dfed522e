//! Opcode and header codec.
//!
//! Every RPC buffer starts with a [`Header`] at offset 0. Both sender and
//! receiver read and write each field at its fixed offset, so the layout is
//! byte-identical across all nodes.

use crate::{Error, NodeId, Result, SubgroupId, SubgroupTypeId};

/// 64-bit identifier of a method within a replicated type.
///
/// The least-significant bit encodes the invocation mode: even tags are
/// ordered (delivered to every replica in a globally agreed order), odd tags
/// are point-to-point. The upper 63 bits are a hash of the method's literal
/// name, so no tag can be reused across modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FunctionTag(pub u64);

/// Polynomial rolling hash (multiplier 31) over the bytes of a method name.
///
/// Accumulation stops at a NUL byte, matching hashing over a C-style
/// null-terminated string; Rust method names never contain one.
pub fn user_tag(name: &str) -> u64 {
    let mut hash: u64 = 0;
    for &b in name.as_bytes() {
        if b == 0 {
            break;
        }
        hash = hash.wrapping_mul(31).wrapping_add(u64::from(b));
    }
    hash
}

impl FunctionTag {
    /// Internal tag of an ordered method: `2 * user_tag`.
    pub fn ordered(name: &str) -> Self {
        FunctionTag(user_tag(name).wrapping_mul(2))
    }

    /// Internal tag of a point-to-point method: `2 * user_tag + 1`.
    pub fn p2p(name: &str) -> Self {
        FunctionTag(user_tag(name).wrapping_mul(2).wrapping_add(1))
    }

    pub fn from_name(name: &str, p2p: bool) -> Self {
        if p2p {
            Self::p2p(name)
        } else {
            Self::ordered(name)
        }
    }

    #[inline]
    pub fn is_p2p(self) -> bool {
        self.0 & 1 == 1
    }

    /// The name-hash half of the tag, with the mode bit stripped.
    #[inline]
    pub fn user_half(self) -> u64 {
        self.0 >> 1
    }
}

impl std::fmt::Display for FunctionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The four-tuple uniquely identifying an RPC call.
///
/// The derived ordering is lexicographic over the fields in declared order
/// `(class_id, subgroup_id, function_id, is_reply)`, which is the map key
/// used throughout dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Opcode {
    pub class_id: SubgroupTypeId,
    pub subgroup_id: SubgroupId,
    pub function_id: FunctionTag,
    pub is_reply: bool,
}

impl Opcode {
    /// The same opcode with `is_reply` set, routing a reply back to its call.
    pub fn reply(self) -> Self {
        Opcode {
            is_reply: true,
            ..self
        }
    }

    /// The request opcode a reply corresponds to.
    pub fn request(self) -> Self {
        Opcode {
            is_reply: false,
            ..self
        }
    }
}

/// Reply should be emitted as a further ordered multicast instead of
/// point-to-point back to the sender.
pub const FLAG_CASCADE: u32 = 1 << 0;
pub const FLAG_RESERVED: u32 = 1 << 1;
/// All bits outside this mask must be zero on the wire.
pub const FLAG_MASK: u32 = FLAG_CASCADE | FLAG_RESERVED;

/// Size of the packed header: payload_size (8) + opcode (20, of which
/// is_reply is one byte padded to the alignment of `from`) + from (4) +
/// flags (4).
pub const HEADER_BYTES: usize = 36;

const OFF_PAYLOAD_SIZE: usize = 0;
const OFF_CLASS_ID: usize = 8;
const OFF_SUBGROUP_ID: usize = 12;
const OFF_FUNCTION_ID: usize = 16;
const OFF_IS_REPLY: usize = 24;
const OFF_FROM: usize = 28;
const OFF_FLAGS: usize = 32;

/// Fixed-layout header at offset 0 of every RPC buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub payload_size: u64,
    pub opcode: Opcode,
    pub from: NodeId,
    pub flags: u32,
}

impl Header {
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < HEADER_BYTES {
            return Err(Error::Serialize(format!(
                "header buffer too small: {} < {}",
                buf.len(),
                HEADER_BYTES
            )));
        }
        if self.flags & !FLAG_MASK != 0 {
            return Err(Error::Serialize(format!(
                "reserved header flag bits set: {:#x}",
                self.flags
            )));
        }
        buf[OFF_PAYLOAD_SIZE..OFF_CLASS_ID].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[OFF_CLASS_ID..OFF_SUBGROUP_ID].copy_from_slice(&self.opcode.class_id.0.to_le_bytes());
        buf[OFF_SUBGROUP_ID..OFF_FUNCTION_ID]
            .copy_from_slice(&self.opcode.subgroup_id.0.to_le_bytes());
        buf[OFF_FUNCTION_ID..OFF_IS_REPLY]
            .copy_from_slice(&self.opcode.function_id.0.to_le_bytes());
        buf[OFF_IS_REPLY] = u8::from(self.opcode.is_reply);
        buf[OFF_IS_REPLY + 1..OFF_FROM].fill(0);
        buf[OFF_FROM..OFF_FLAGS].copy_from_slice(&self.from.0.to_le_bytes());
        buf[OFF_FLAGS..HEADER_BYTES].copy_from_slice(&self.flags.to_le_bytes());
        Ok(())
    }

    pub fn read_from(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_BYTES {
            return Err(Error::Deserialize(format!(
                "buffer shorter than a header: {} < {}",
                buf.len(),
                HEADER_BYTES
            )));
        }
        let payload_size = u64::from_le_bytes(
            buf[OFF_PAYLOAD_SIZE..OFF_CLASS_ID]
                .try_into()
                .expect("fixed slice"),
        );
        let class_id = u32::from_le_bytes(
            buf[OFF_CLASS_ID..OFF_SUBGROUP_ID]
                .try_into()
                .expect("fixed slice"),
        );
        let subgroup_id = u32::from_le_bytes(
            buf[OFF_SUBGROUP_ID..OFF_FUNCTION_ID]
                .try_into()
                .expect("fixed slice"),
        );
        let function_id = u64::from_le_bytes(
            buf[OFF_FUNCTION_ID..OFF_IS_REPLY]
                .try_into()
                .expect("fixed slice"),
        );
        let is_reply = match buf[OFF_IS_REPLY] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::Deserialize(format!(
                    "invalid is_reply byte: {}",
                    other
                )));
            }
        };
        let from = u32::from_le_bytes(buf[OFF_FROM..OFF_FLAGS].try_into().expect("fixed slice"));
        let flags = u32::from_le_bytes(
            buf[OFF_FLAGS..HEADER_BYTES]
                .try_into()
                .expect("fixed slice"),
        );
        if flags & !FLAG_MASK != 0 {
            return Err(Error::Deserialize(format!(
                "reserved header flag bits set on the wire: {:#x}",
                flags
            )));
        }
        Ok(Header {
            payload_size,
            opcode: Opcode {
                class_id: SubgroupTypeId(class_id),
                subgroup_id: SubgroupId(subgroup_id),
                function_id: FunctionTag(function_id),
                is_reply,
            },
            from: NodeId(from),
            flags,
        })
    }
}
