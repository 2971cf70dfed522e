//! Segment-backed storage shared by all logs in one directory.
//!
//! The store exposes a large per-log virtual address space divided into
//! fixed-size segments. Only the pages a log actually writes are mapped, via
//! the log's segment table, onto physical segments of a single data file;
//! physical segments are handed out first-fit over an occupancy bitmap.
//!
//! On-disk layout of `global.meta`:
//!
//! - header block (magic, format version, configuration echo)
//! - name table: `max_logs` fixed-size records mapping names to log ids
//! - segment occupancy bitmap
//! - `max_logs` per-log metadata slots (id, segment table, head, tail,
//!   latest version, data cursor, latest hlc)
//!
//! Payload bytes live in `segments.dat`. Neither file is fsynced outside
//! [`SegmentStore::sync`]; durability is driven by `PersistLog::persist`.

use crate::entry::ENTRY_BYTES;
use crate::hlc::Hlc;
use crate::log::PersistLog;
use crate::{INVALID_VERSION, LogError, LogResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const STORE_MAGIC: u32 = 0x434c_4f47;
const STORE_FORMAT: u32 = 1;
const HEADER_BLOCK_BYTES: u64 = 64;
const NAME_RECORD_BYTES: u64 = 64;

/// Longest log name the fixed-size name records can hold.
pub const MAX_NAME_BYTES: usize = 56;

/// Segment-table entry for a page that has no physical segment yet.
pub const NO_SEGMENT: u32 = u32::MAX;

/// Storage geometry. The defaults match the fixed maxima of the original
/// hardware-backed layout; tests shrink them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// Maximum number of named logs in one store.
    pub max_logs: u32,
    /// Size of one segment in bytes.
    pub segment_bytes: u64,
    /// Size of each log's virtual address space in bytes. The low half holds
    /// entry records, the high half holds entry payloads.
    pub address_space_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            max_logs: 16384,
            segment_bytes: 8 << 20,
            address_space_bytes: 1 << 40,
        }
    }
}

impl LogConfig {
    pub fn num_segments(&self) -> u64 {
        self.address_space_bytes / self.segment_bytes
    }

    pub(crate) fn data_half_base(&self) -> u64 {
        self.address_space_bytes / 2
    }

    fn validate(&self) -> LogResult<()> {
        if self.max_logs == 0
            || self.segment_bytes < ENTRY_BYTES as u64
            || self.address_space_bytes < 2 * self.segment_bytes
            || self.address_space_bytes % self.segment_bytes != 0
            || self.segment_bytes % ENTRY_BYTES as u64 != 0
        {
            return Err(LogError::Corrupt(format!(
                "invalid store configuration: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Per-log metadata, the in-memory image of one slot record.
#[derive(Debug, Clone)]
pub(crate) struct LogSlot {
    pub id: u32,
    pub head: i64,
    pub tail: i64,
    pub ver: i64,
    pub data_tail: u64,
    pub last_hlc: Hlc,
    pub segment_table: Vec<u32>,
}

impl LogSlot {
    fn fresh(id: u32, num_segments: u64) -> Self {
        LogSlot {
            id,
            head: 0,
            tail: 0,
            ver: INVALID_VERSION,
            data_tail: 0,
            last_hlc: Hlc::ZERO,
            segment_table: vec![NO_SEGMENT; num_segments as usize],
        }
    }
}

struct StoreState {
    meta: File,
    data: File,
    data_len: u64,
    names: BTreeMap<String, u32>,
    bitmap: Vec<u64>,
    bitmap_dirty: bool,
}

struct StoreInner {
    config: LogConfig,
    state: Mutex<StoreState>,
}

/// Handle to one store directory. Cloning is cheap; all clones share the
/// same files and allocation state.
#[derive(Clone)]
pub struct SegmentStore {
    inner: Arc<StoreInner>,
}

impl SegmentStore {
    /// Opens (or creates) a store in `dir`. A store remembers the
    /// configuration it was created with; reopening with a different one is
    /// refused.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> LogResult<SegmentStore> {
        config.validate()?;
        std::fs::create_dir_all(dir.as_ref())?;
        let meta_path = dir.as_ref().join("global.meta");
        let data_path = dir.as_ref().join("segments.dat");
        let create = !meta_path.exists();

        let mut meta = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&meta_path)?;
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;
        data.try_lock_exclusive()?;

        let bitmap_words = config.num_segments().div_ceil(64);
        let layout = Layout::new(&config);

        let (names, bitmap) = if create {
            debug!(dir = %dir.as_ref().display(), "creating segment store");
            let mut header = [0u8; HEADER_BLOCK_BYTES as usize];
            header[0..4].copy_from_slice(&STORE_MAGIC.to_le_bytes());
            header[4..8].copy_from_slice(&STORE_FORMAT.to_le_bytes());
            header[8..12].copy_from_slice(&config.max_logs.to_le_bytes());
            header[16..24].copy_from_slice(&config.segment_bytes.to_le_bytes());
            header[24..32].copy_from_slice(&config.address_space_bytes.to_le_bytes());
            meta.seek(SeekFrom::Start(0))?;
            meta.write_all(&header)?;
            // The name, bitmap and slot regions stay sparse until written.
            meta.set_len(layout.total_bytes)?;
            (BTreeMap::new(), vec![0u64; bitmap_words as usize])
        } else {
            let mut header = [0u8; HEADER_BLOCK_BYTES as usize];
            meta.seek(SeekFrom::Start(0))?;
            meta.read_exact(&mut header)?;
            let magic = u32::from_le_bytes(header[0..4].try_into().expect("fixed slice"));
            let format = u32::from_le_bytes(header[4..8].try_into().expect("fixed slice"));
            if magic != STORE_MAGIC || format != STORE_FORMAT {
                return Err(LogError::Corrupt("bad store header".to_string()));
            }
            let stored = LogConfig {
                max_logs: u32::from_le_bytes(header[8..12].try_into().expect("fixed slice")),
                segment_bytes: u64::from_le_bytes(header[16..24].try_into().expect("fixed slice")),
                address_space_bytes: u64::from_le_bytes(
                    header[24..32].try_into().expect("fixed slice"),
                ),
            };
            if stored != config {
                return Err(LogError::ConfigMismatch);
            }

            let mut name_region = vec![0u8; (config.max_logs as u64 * NAME_RECORD_BYTES) as usize];
            meta.seek(SeekFrom::Start(layout.names_off))?;
            meta.read_exact(&mut name_region)?;
            let mut names = BTreeMap::new();
            for i in 0..config.max_logs as usize {
                let rec = &name_region[i * NAME_RECORD_BYTES as usize..];
                if rec[0] != 1 {
                    continue;
                }
                let len = rec[1] as usize;
                if len > MAX_NAME_BYTES {
                    return Err(LogError::Corrupt(format!("bad name record {}", i)));
                }
                let name = String::from_utf8(rec[2..2 + len].to_vec())
                    .map_err(|e| LogError::Corrupt(e.to_string()))?;
                let id = u32::from_le_bytes(rec[58..62].try_into().expect("fixed slice"));
                names.insert(name, id);
            }

            let mut bitmap_bytes = vec![0u8; (bitmap_words * 8) as usize];
            meta.seek(SeekFrom::Start(layout.bitmap_off))?;
            meta.read_exact(&mut bitmap_bytes)?;
            let bitmap = bitmap_bytes
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().expect("fixed slice")))
                .collect();
            debug!(
                logs = names.len(),
                dir = %dir.as_ref().display(),
                "recovered segment store"
            );
            (names, bitmap)
        };

        let data_len = data.metadata()?.len();
        Ok(SegmentStore {
            inner: Arc::new(StoreInner {
                config,
                state: Mutex::new(StoreState {
                    meta,
                    data,
                    data_len,
                    names,
                    bitmap,
                    bitmap_dirty: create,
                }),
            }),
        })
    }

    pub fn config(&self) -> LogConfig {
        self.inner.config
    }

    pub fn log_names(&self) -> Vec<String> {
        self.inner.state.lock().names.keys().cloned().collect()
    }

    pub fn contains_log(&self, name: &str) -> bool {
        self.inner.state.lock().names.contains_key(name)
    }

    /// Opens the named log, loading its metadata if it already exists and
    /// creating it otherwise.
    pub fn open_log(&self, name: &str) -> LogResult<PersistLog> {
        if name.len() > MAX_NAME_BYTES {
            return Err(LogError::NameTooLong);
        }
        let config = self.inner.config;
        let layout = Layout::new(&config);
        let mut state = self.inner.state.lock();

        if let Some(&id) = state.names.get(name) {
            let slot = read_slot(&mut state, &layout, &config, id)?;
            debug!(name, id, tail = slot.tail, ver = slot.ver, "reopened log");
            return Ok(PersistLog::from_parts(name.to_string(), self.clone(), slot));
        }

        if state.names.len() as u32 >= config.max_logs {
            return Err(LogError::TooManyLogs);
        }
        let used: std::collections::BTreeSet<u32> = state.names.values().copied().collect();
        let id = (0..config.max_logs)
            .find(|i| !used.contains(i))
            .ok_or(LogError::TooManyLogs)?;

        let mut rec = [0u8; NAME_RECORD_BYTES as usize];
        rec[0] = 1;
        rec[1] = name.len() as u8;
        rec[2..2 + name.len()].copy_from_slice(name.as_bytes());
        rec[58..62].copy_from_slice(&id.to_le_bytes());
        state
            .meta
            .seek(SeekFrom::Start(layout.names_off + id as u64 * NAME_RECORD_BYTES))?;
        state.meta.write_all(&rec)?;
        state.names.insert(name.to_string(), id);

        let slot = LogSlot::fresh(id, config.num_segments());
        write_slot(&mut state, &layout, &slot)?;
        debug!(name, id, "created log");
        Ok(PersistLog::from_parts(name.to_string(), self.clone(), slot))
    }

    /// Writes `data` at virtual address `vaddr` of the given log, mapping
    /// pages to physical segments as needed.
    pub(crate) fn vwrite(&self, slot: &mut LogSlot, vaddr: u64, data: &[u8]) -> LogResult<()> {
        let seg = self.inner.config.segment_bytes;
        if vaddr + data.len() as u64 > self.inner.config.address_space_bytes {
            return Err(LogError::StoreFull);
        }
        let mut state = self.inner.state.lock();
        let mut off = 0usize;
        let mut addr = vaddr;
        while off < data.len() {
            let page = (addr / seg) as usize;
            let in_page = addr % seg;
            let chunk = ((seg - in_page) as usize).min(data.len() - off);
            let phys = match slot.segment_table[page] {
                NO_SEGMENT => {
                    let phys = alloc_segment(&mut state, &self.inner.config)?;
                    slot.segment_table[page] = phys;
                    phys
                }
                phys => phys,
            };
            let pos = phys as u64 * seg + in_page;
            state.data.seek(SeekFrom::Start(pos))?;
            state.data.write_all(&data[off..off + chunk])?;
            off += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at virtual address `vaddr` of the given log.
    pub(crate) fn vread(&self, slot: &LogSlot, vaddr: u64, buf: &mut [u8]) -> LogResult<()> {
        let seg = self.inner.config.segment_bytes;
        let mut state = self.inner.state.lock();
        let mut off = 0usize;
        let mut addr = vaddr;
        while off < buf.len() {
            let page = (addr / seg) as usize;
            let in_page = addr % seg;
            let chunk = ((seg - in_page) as usize).min(buf.len() - off);
            let phys = slot.segment_table[page];
            if phys == NO_SEGMENT {
                return Err(LogError::Corrupt(format!(
                    "read from unmapped page {}",
                    page
                )));
            }
            let pos = phys as u64 * seg + in_page;
            state.data.seek(SeekFrom::Start(pos))?;
            state.data.read_exact(&mut buf[off..off + chunk])?;
            off += chunk;
            addr += chunk as u64;
        }
        Ok(())
    }

    /// Releases physical segments of pages that lie entirely below the given
    /// virtual-address limits (entry half and data half respectively).
    pub(crate) fn release_below(
        &self,
        slot: &mut LogSlot,
        entry_limit: u64,
        data_limit: u64,
    ) -> LogResult<()> {
        let seg = self.inner.config.segment_bytes;
        let half_page = (self.inner.config.data_half_base() / seg) as usize;
        let mut state = self.inner.state.lock();
        for page in 0..slot.segment_table.len() {
            if slot.segment_table[page] == NO_SEGMENT {
                continue;
            }
            let page_end = (page as u64 + 1) * seg;
            let limit = if page < half_page {
                entry_limit
            } else {
                self.inner.config.data_half_base() + data_limit
            };
            if page_end <= limit {
                free_segment(&mut state, slot.segment_table[page]);
                slot.segment_table[page] = NO_SEGMENT;
            }
        }
        Ok(())
    }

    /// Writes the slot record for this log. Not durable until [`sync`].
    ///
    /// [`sync`]: SegmentStore::sync
    pub(crate) fn persist_slot(&self, slot: &LogSlot) -> LogResult<()> {
        let layout = Layout::new(&self.inner.config);
        let mut state = self.inner.state.lock();
        write_slot(&mut state, &layout, slot)
    }

    /// Forces everything written so far to durable storage: data first, then
    /// metadata (including the occupancy bitmap).
    pub(crate) fn sync(&self) -> LogResult<()> {
        let layout = Layout::new(&self.inner.config);
        let mut state = self.inner.state.lock();
        if state.bitmap_dirty {
            let bytes: Vec<u8> = state
                .bitmap
                .iter()
                .flat_map(|w| w.to_le_bytes())
                .collect();
            state.meta.seek(SeekFrom::Start(layout.bitmap_off))?;
            state.meta.write_all(&bytes)?;
            state.bitmap_dirty = false;
        }
        state.data.flush()?;
        state.data.sync_data()?;
        state.meta.flush()?;
        state.meta.sync_data()?;
        Ok(())
    }
}

struct Layout {
    names_off: u64,
    bitmap_off: u64,
    slots_off: u64,
    slot_bytes: u64,
    total_bytes: u64,
}

impl Layout {
    fn new(config: &LogConfig) -> Layout {
        let names_off = HEADER_BLOCK_BYTES;
        let bitmap_off = names_off + config.max_logs as u64 * NAME_RECORD_BYTES;
        let bitmap_bytes = config.num_segments().div_ceil(64) * 8;
        let slots_off = bitmap_off + bitmap_bytes;
        // id + segment table + head + tail + ver + data_tail + hlc
        let slot_bytes = 4 + config.num_segments() * 4 + 8 * 6;
        let total_bytes = slots_off + config.max_logs as u64 * slot_bytes;
        Layout {
            names_off,
            bitmap_off,
            slots_off,
            slot_bytes,
            total_bytes,
        }
    }

    fn slot_off(&self, id: u32) -> u64 {
        self.slots_off + id as u64 * self.slot_bytes
    }
}

fn alloc_segment(state: &mut StoreState, config: &LogConfig) -> LogResult<u32> {
    let num_segments = config.num_segments();
    for (word_idx, word) in state.bitmap.iter_mut().enumerate() {
        if *word == !0u64 {
            continue;
        }
        let bit = word.trailing_ones() as u64;
        let idx = word_idx as u64 * 64 + bit;
        if idx >= num_segments {
            break;
        }
        *word |= 1u64 << bit;
        state.bitmap_dirty = true;
        let needed = (idx + 1) * config.segment_bytes;
        if state.data_len < needed {
            state.data.set_len(needed)?;
            state.data_len = needed;
        }
        return Ok(idx as u32);
    }
    Err(LogError::StoreFull)
}

fn free_segment(state: &mut StoreState, phys: u32) {
    let word = phys as usize / 64;
    let bit = phys % 64;
    state.bitmap[word] &= !(1u64 << bit);
    state.bitmap_dirty = true;
}

fn write_slot(state: &mut StoreState, layout: &Layout, slot: &LogSlot) -> LogResult<()> {
    let mut buf = Vec::with_capacity(layout.slot_bytes as usize);
    buf.extend_from_slice(&slot.id.to_le_bytes());
    for &entry in &slot.segment_table {
        buf.extend_from_slice(&entry.to_le_bytes());
    }
    buf.extend_from_slice(&slot.head.to_le_bytes());
    buf.extend_from_slice(&slot.tail.to_le_bytes());
    buf.extend_from_slice(&slot.ver.to_le_bytes());
    buf.extend_from_slice(&slot.data_tail.to_le_bytes());
    buf.extend_from_slice(&slot.last_hlc.real.to_le_bytes());
    buf.extend_from_slice(&slot.last_hlc.logic.to_le_bytes());
    debug_assert_eq!(buf.len() as u64, layout.slot_bytes);
    state.meta.seek(SeekFrom::Start(layout.slot_off(slot.id)))?;
    state.meta.write_all(&buf)?;
    Ok(())
}

fn read_slot(
    state: &mut StoreState,
    layout: &Layout,
    config: &LogConfig,
    id: u32,
) -> LogResult<LogSlot> {
    let mut buf = vec![0u8; layout.slot_bytes as usize];
    state.meta.seek(SeekFrom::Start(layout.slot_off(id)))?;
    state.meta.read_exact(&mut buf)?;
    let stored_id = u32::from_le_bytes(buf[0..4].try_into().expect("fixed slice"));
    if stored_id != id {
        return Err(LogError::Corrupt(format!(
            "slot {} holds id {}",
            id, stored_id
        )));
    }
    let table_end = 4 + config.num_segments() as usize * 4;
    let segment_table = buf[4..table_end]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().expect("fixed slice")))
        .collect();
    let tail_fields = &buf[table_end..];
    Ok(LogSlot {
        id,
        segment_table,
        head: i64::from_le_bytes(tail_fields[0..8].try_into().expect("fixed slice")),
        tail: i64::from_le_bytes(tail_fields[8..16].try_into().expect("fixed slice")),
        ver: i64::from_le_bytes(tail_fields[16..24].try_into().expect("fixed slice")),
        data_tail: u64::from_le_bytes(tail_fields[24..32].try_into().expect("fixed slice")),
        last_hlc: Hlc {
            real: u64::from_le_bytes(tail_fields[32..40].try_into().expect("fixed slice")),
            logic: u64::from_le_bytes(tail_fields[40..48].try_into().expect("fixed slice")),
        },
    })
}
