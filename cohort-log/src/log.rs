//! The per-object persistent log.

use crate::entry::{ENTRY_BYTES, LogEntry};
use crate::hlc::Hlc;
use crate::store::{LogSlot, SegmentStore};
use crate::{INVALID_VERSION, LogError, LogResult};
use parking_lot::RwLock;
use tracing::debug;

/// An append-only sequence of versioned, HLC-stamped entries backed by a
/// [`SegmentStore`].
///
/// Versions grow strictly monotonically across appends and
/// [`advance_version`] calls; HLC timestamps grow monotonically
/// non-decreasing. Entry indexes are absolute: `head` advances on trim,
/// `tail` on append, and an index is readable iff `head <= i < tail`.
///
/// Writers (`append`, `advance_version`, `trim_*`, `truncate`, `persist`)
/// take the log's lock exclusively; readers share it and observe a
/// consistent tail snapshot for the duration of a single call.
///
/// [`advance_version`]: PersistLog::advance_version
pub struct PersistLog {
    name: String,
    store: SegmentStore,
    inner: RwLock<LogInner>,
}

struct LogInner {
    slot: LogSlot,
    last_persisted: i64,
}

impl PersistLog {
    pub(crate) fn from_parts(name: String, store: SegmentStore, slot: LogSlot) -> Self {
        // Everything loaded from the store was durable when written, so the
        // recovered version is the persisted watermark.
        let last_persisted = slot.ver;
        PersistLog {
            name,
            store,
            inner: RwLock::new(LogInner {
                slot,
                last_persisted,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends an entry. `version` must exceed the current latest version and
    /// `hlc` must not be earlier than the latest hlc. The entry becomes
    /// durable only after a subsequent [`persist`](PersistLog::persist).
    pub fn append(&self, data: &[u8], version: i64, hlc: Hlc) -> LogResult<()> {
        let mut inner = self.inner.write();
        self.append_locked(&mut inner, data, version, hlc)
    }

    /// Increases the latest version without writing an entry, creating an
    /// intentional gap in the version sequence.
    pub fn advance_version(&self, version: i64) -> LogResult<()> {
        let mut inner = self.inner.write();
        if version <= inner.slot.ver {
            return Err(LogError::VersionOrder {
                given: version,
                latest: inner.slot.ver,
            });
        }
        inner.slot.ver = version;
        Ok(())
    }

    /// Forces all appended entries to durable storage and returns the largest
    /// version known to be durable.
    pub fn persist(&self) -> LogResult<i64> {
        let mut inner = self.inner.write();
        self.store.persist_slot(&inner.slot)?;
        self.store.sync()?;
        inner.last_persisted = inner.slot.ver;
        Ok(inner.slot.ver)
    }

    pub fn length(&self) -> i64 {
        let inner = self.inner.read();
        inner.slot.tail - inner.slot.head
    }

    pub fn earliest_index(&self) -> i64 {
        self.inner.read().slot.head
    }

    /// Index of the newest entry; one less than `earliest_index` when empty.
    pub fn latest_index(&self) -> i64 {
        self.inner.read().slot.tail - 1
    }

    pub fn earliest_version(&self) -> LogResult<i64> {
        let inner = self.inner.read();
        if inner.slot.head == inner.slot.tail {
            return Ok(INVALID_VERSION);
        }
        Ok(self.read_entry(&inner.slot, inner.slot.head)?.version)
    }

    pub fn latest_version(&self) -> i64 {
        self.inner.read().slot.ver
    }

    pub fn last_persisted(&self) -> i64 {
        self.inner.read().last_persisted
    }

    /// Index of the entry carrying exactly `version`.
    pub fn index_for_version(&self, version: i64) -> LogResult<i64> {
        let inner = self.inner.read();
        let ub = self.upper_bound_version(&inner.slot, version)?;
        if ub > inner.slot.head {
            let candidate = ub - 1;
            if self.read_entry(&inner.slot, candidate)?.version == version {
                return Ok(candidate);
            }
        }
        Err(LogError::EntryNotFound)
    }

    pub fn entry_by_index(&self, index: i64) -> LogResult<LogEntry> {
        let inner = self.inner.read();
        self.check_range(&inner.slot, index)?;
        self.read_entry(&inner.slot, index)
    }

    /// Payload bytes of the entry at `index`.
    pub fn data_by_index(&self, index: i64) -> LogResult<Vec<u8>> {
        let inner = self.inner.read();
        self.check_range(&inner.slot, index)?;
        let entry = self.read_entry(&inner.slot, index)?;
        let mut data = vec![0u8; entry.data_len as usize];
        let base = self.store.config().data_half_base();
        self.store
            .vread(&inner.slot, base + entry.data_offset, &mut data)?;
        Ok(data)
    }

    /// The entry with the greatest version `<= version`.
    pub fn entry_at_or_before_version(&self, version: i64) -> LogResult<LogEntry> {
        let inner = self.inner.read();
        let ub = self.upper_bound_version(&inner.slot, version)?;
        if ub == inner.slot.head {
            return Err(LogError::EntryNotFound);
        }
        self.read_entry(&inner.slot, ub - 1)
    }

    /// The entry with the greatest hlc `<= hlc`.
    pub fn entry_at_or_before_hlc(&self, hlc: Hlc) -> LogResult<LogEntry> {
        let inner = self.inner.read();
        let ub = self.upper_bound_hlc(&inner.slot, hlc)?;
        if ub == inner.slot.head {
            return Err(LogError::EntryNotFound);
        }
        self.read_entry(&inner.slot, ub - 1)
    }

    /// Drops all entries with index `<= index`. The latest version is
    /// preserved even when the log becomes empty.
    pub fn trim_by_index(&self, index: i64) -> LogResult<()> {
        let mut inner = self.inner.write();
        self.trim_locked(&mut inner, index)
    }

    /// Drops all entries with version `<= version`.
    pub fn trim_by_version(&self, version: i64) -> LogResult<()> {
        let mut inner = self.inner.write();
        let ub = self.upper_bound_version(&inner.slot, version)?;
        self.trim_locked(&mut inner, ub - 1)
    }

    /// Drops all entries with hlc `<= hlc`.
    pub fn trim_by_hlc(&self, hlc: Hlc) -> LogResult<()> {
        let mut inner = self.inner.write();
        let ub = self.upper_bound_hlc(&inner.slot, hlc)?;
        self.trim_locked(&mut inner, ub - 1)
    }

    /// Drops all entries with version strictly greater than `version` and
    /// rolls the latest version back to at most `version`. Used to discard an
    /// uncommitted tail.
    pub fn truncate(&self, version: i64) -> LogResult<()> {
        let mut inner = self.inner.write();
        let new_tail = self.upper_bound_version(&inner.slot, version)?;
        if new_tail < inner.slot.tail {
            debug!(
                log = %self.name,
                dropped = inner.slot.tail - new_tail,
                version,
                "truncating log tail"
            );
            let boundary = self.read_entry(&inner.slot, new_tail)?;
            inner.slot.data_tail = boundary.data_offset;
            inner.slot.tail = new_tail;
            inner.slot.last_hlc = if new_tail > inner.slot.head {
                self.read_entry(&inner.slot, new_tail - 1)?.hlc
            } else {
                Hlc::ZERO
            };
        }
        inner.slot.ver = inner.slot.ver.min(version);
        self.store.persist_slot(&inner.slot)
    }

    /// Byte size of the serialized tail from `since + 1` onward
    /// (`since == INVALID_VERSION` selects the entire log).
    pub fn bytes_size(&self, since: i64) -> LogResult<u64> {
        let inner = self.inner.read();
        let start = self.upper_bound_version(&inner.slot, since)?;
        let mut size = 8u64;
        for idx in start..inner.slot.tail {
            size += ENTRY_BYTES as u64 + self.read_entry(&inner.slot, idx)?.data_len;
        }
        Ok(size)
    }

    /// Serializes the tail from `since + 1` onward into `buf`, returning the
    /// number of bytes written.
    pub fn to_bytes(&self, buf: &mut [u8], since: i64) -> LogResult<usize> {
        let mut written = 0usize;
        self.post_object(
            &mut |chunk: &[u8]| {
                if written + chunk.len() > buf.len() {
                    return Err(LogError::BufferTooSmall {
                        needed: written + chunk.len(),
                        available: buf.len(),
                    });
                }
                buf[written..written + chunk.len()].copy_from_slice(chunk);
                written += chunk.len();
                Ok(())
            },
            since,
        )?;
        Ok(written)
    }

    /// Streams the serialized tail from `since + 1` onward into `sink`.
    pub fn post_object(
        &self,
        sink: &mut dyn FnMut(&[u8]) -> LogResult<()>,
        since: i64,
    ) -> LogResult<()> {
        let inner = self.inner.read();
        let start = self.upper_bound_version(&inner.slot, since)?;
        let count = (inner.slot.tail - start) as u64;
        sink(&count.to_le_bytes())?;
        let base = self.store.config().data_half_base();
        for idx in start..inner.slot.tail {
            let entry = self.read_entry(&inner.slot, idx)?;
            let mut rec = [0u8; ENTRY_BYTES];
            entry.to_bytes(&mut rec);
            sink(&rec)?;
            let mut data = vec![0u8; entry.data_len as usize];
            self.store
                .vread(&inner.slot, base + entry.data_offset, &mut data)?;
            sink(&data)?;
        }
        Ok(())
    }

    /// Merges a serialized tail produced by [`to_bytes`] into this log.
    /// Every received entry must be strictly newer than the local latest
    /// version; any overlap is refused before anything is applied.
    ///
    /// [`to_bytes`]: PersistLog::to_bytes
    pub fn apply_log_tail(&self, bytes: &[u8]) -> LogResult<()> {
        let mut inner = self.inner.write();
        if bytes.len() < 8 {
            return Err(LogError::Corrupt("log tail shorter than its count".into()));
        }
        let count = u64::from_le_bytes(bytes[0..8].try_into().expect("fixed slice"));
        let mut off = 8usize;
        let mut parsed = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            if bytes.len() < off + ENTRY_BYTES {
                return Err(LogError::Corrupt("truncated log tail record".into()));
            }
            let rec: [u8; ENTRY_BYTES] = bytes[off..off + ENTRY_BYTES]
                .try_into()
                .expect("fixed slice");
            let entry = LogEntry::from_bytes(&rec);
            off += ENTRY_BYTES;
            if bytes.len() < off + entry.data_len as usize {
                return Err(LogError::Corrupt("truncated log tail payload".into()));
            }
            let data = &bytes[off..off + entry.data_len as usize];
            off += entry.data_len as usize;
            if entry.version <= inner.slot.ver {
                return Err(LogError::TailOverlap {
                    version: entry.version,
                });
            }
            parsed.push((entry, data));
        }
        for (entry, data) in parsed {
            self.append_locked(&mut inner, data, entry.version, entry.hlc)?;
        }
        Ok(())
    }

    fn append_locked(
        &self,
        inner: &mut LogInner,
        data: &[u8],
        version: i64,
        hlc: Hlc,
    ) -> LogResult<()> {
        if version <= inner.slot.ver {
            return Err(LogError::VersionOrder {
                given: version,
                latest: inner.slot.ver,
            });
        }
        if hlc < inner.slot.last_hlc {
            return Err(LogError::HlcOrder {
                given: hlc,
                latest: inner.slot.last_hlc,
            });
        }
        let half = self.store.config().data_half_base();
        let entry_addr = inner.slot.tail as u64 * ENTRY_BYTES as u64;
        if entry_addr + ENTRY_BYTES as u64 > half
            || inner.slot.data_tail + data.len() as u64 > half
        {
            return Err(LogError::StoreFull);
        }
        let entry = LogEntry {
            version,
            data_len: data.len() as u64,
            data_offset: inner.slot.data_tail,
            hlc,
        };
        self.store
            .vwrite(&mut inner.slot, half + entry.data_offset, data)?;
        let mut rec = [0u8; ENTRY_BYTES];
        entry.to_bytes(&mut rec);
        self.store.vwrite(&mut inner.slot, entry_addr, &rec)?;
        inner.slot.tail += 1;
        inner.slot.data_tail += data.len() as u64;
        inner.slot.ver = version;
        inner.slot.last_hlc = hlc;
        Ok(())
    }

    fn trim_locked(&self, inner: &mut LogInner, index: i64) -> LogResult<()> {
        if inner.slot.head == inner.slot.tail || index < inner.slot.head {
            return Ok(());
        }
        let new_head = index.min(inner.slot.tail - 1) + 1;
        let data_base = if new_head < inner.slot.tail {
            self.read_entry(&inner.slot, new_head)?.data_offset
        } else {
            inner.slot.data_tail
        };
        self.store.release_below(
            &mut inner.slot,
            new_head as u64 * ENTRY_BYTES as u64,
            data_base,
        )?;
        inner.slot.head = new_head;
        self.store.persist_slot(&inner.slot)
    }

    fn check_range(&self, slot: &LogSlot, index: i64) -> LogResult<()> {
        if index < slot.head || index >= slot.tail {
            return Err(LogError::IndexOutOfRange {
                index,
                head: slot.head,
                tail: slot.tail,
            });
        }
        Ok(())
    }

    fn read_entry(&self, slot: &LogSlot, index: i64) -> LogResult<LogEntry> {
        let mut rec = [0u8; ENTRY_BYTES];
        self.store
            .vread(slot, index as u64 * ENTRY_BYTES as u64, &mut rec)?;
        Ok(LogEntry::from_bytes(&rec))
    }

    /// First index in `[head, tail)` whose entry version exceeds `version`,
    /// or `tail` when none does.
    fn upper_bound_version(&self, slot: &LogSlot, version: i64) -> LogResult<i64> {
        let (mut lo, mut hi) = (slot.head, slot.tail);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.read_entry(slot, mid)?.version > version {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// First index in `[head, tail)` whose entry hlc exceeds `hlc`, or
    /// `tail` when none does.
    fn upper_bound_hlc(&self, slot: &LogSlot, hlc: Hlc) -> LogResult<i64> {
        let (mut lo, mut hi) = (slot.head, slot.tail);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.read_entry(slot, mid)?.hlc > hlc {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }
}
