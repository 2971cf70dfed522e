use crate::hlc::Hlc;

/// Size of a packed log entry record on storage.
pub const ENTRY_BYTES: usize = 64;

/// A single log entry record.
///
/// On storage the fields occupy exactly [`ENTRY_BYTES`] bytes, little-endian
/// in declared order (version, data_len, data_offset, hlc real, hlc logic),
/// followed by 16 reserved bytes. The payload itself lives in the data half
/// of the owning log's virtual space at `data_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub version: i64,
    pub data_len: u64,
    pub data_offset: u64,
    pub hlc: Hlc,
}

impl LogEntry {
    pub fn to_bytes(&self, buf: &mut [u8; ENTRY_BYTES]) {
        buf[0..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.data_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.hlc.real.to_le_bytes());
        buf[32..40].copy_from_slice(&self.hlc.logic.to_le_bytes());
        buf[40..].fill(0);
    }

    pub fn from_bytes(buf: &[u8; ENTRY_BYTES]) -> Self {
        LogEntry {
            version: i64::from_le_bytes(buf[0..8].try_into().expect("fixed slice")),
            data_len: u64::from_le_bytes(buf[8..16].try_into().expect("fixed slice")),
            data_offset: u64::from_le_bytes(buf[16..24].try_into().expect("fixed slice")),
            hlc: Hlc {
                real: u64::from_le_bytes(buf[24..32].try_into().expect("fixed slice")),
                logic: u64::from_le_bytes(buf[32..40].try_into().expect("fixed slice")),
            },
        }
    }
}
