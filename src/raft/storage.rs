//! Durable raft state: the entry log, the stable (term/vote) store and the
//! rolling snapshot store. Three separate stores on disk, one concern each.
//!
//! The log is a sequence of length-prefixed protobuf `Entry` records in
//! `raft-log.bin`; appends extend the file, while conflict truncation and
//! compaction rewrite it. `raft-stable.bin` holds the hard state and the
//! cluster membership, rewritten atomically through a temp file. Snapshots
//! live as individual `<term>-<index>.snap` files, newest three retained.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use prost::Message as ProstMessage;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};

const LOG_FILE: &str = "raft-log.bin";
const STABLE_FILE: &str = "raft-stable.bin";
const SNAPSHOT_SUFFIX: &str = ".snap";
const RETAINED_SNAPSHOTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("log gap: next expected index {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
}

/// Raft log + stable metadata, memory-resident with write-through to disk.
#[derive(Clone)]
pub struct DiskStorage {
    core: Arc<RwLock<StorageCore>>,
}

struct StorageCore {
    entries: Vec<Entry>,
    hard_state: HardState,
    conf_state: ConfState,
    /// Latest durable snapshot; default (index 0) until one is taken.
    snapshot: Snapshot,
    log_path: PathBuf,
    stable_path: PathBuf,
}

impl DiskStorage {
    /// Opens (or initializes) the log and stable stores under `dir`.
    ///
    /// `initial_conf` seeds the membership on a pristine store; a restored
    /// snapshot, when present, wins over both it and any log prefix it
    /// covers.
    pub fn open(
        dir: &Path,
        initial_conf: ConfState,
        restored: Option<&Snapshot>,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let log_path = dir.join(LOG_FILE);
        let stable_path = dir.join(STABLE_FILE);

        let (hard_state, conf_state) = match read_stable(&stable_path)? {
            Some(state) => state,
            None => (HardState::default(), initial_conf),
        };

        let mut core = StorageCore {
            entries: Vec::new(),
            hard_state,
            conf_state,
            snapshot: Snapshot::default(),
            log_path,
            stable_path,
        };

        if let Some(snap) = restored {
            core.adopt_snapshot(snap.clone());
        }

        let snap_index = core.snapshot.get_metadata().index;
        let mut entries = read_log(&core.log_path)?;
        entries.retain(|e| e.index > snap_index);
        if let Some(first) = entries.first() {
            if first.index != snap_index + 1 {
                // The surviving suffix does not connect to the snapshot;
                // drop it and let replication refill the log.
                tracing::warn!(
                    snapshot_index = snap_index,
                    first_log_index = first.index,
                    "discarding disconnected log suffix"
                );
                entries.clear();
            }
        }
        core.entries = entries;
        core.rewrite_log()?;
        core.write_stable()?;

        Ok(Self {
            core: Arc::new(RwLock::new(core)),
        })
    }

    pub fn hard_state(&self) -> HardState {
        self.core.read().hard_state.clone()
    }

    pub fn set_hard_state(&self, hs: HardState) -> Result<(), StoreError> {
        let mut core = self.core.write();
        core.hard_state = hs;
        core.write_stable()
    }

    pub fn set_commit(&self, commit: u64) -> Result<(), StoreError> {
        let mut core = self.core.write();
        core.hard_state.commit = commit;
        core.write_stable()
    }

    pub fn conf_state(&self) -> ConfState {
        self.core.read().conf_state.clone()
    }

    pub fn set_conf_state(&self, cs: ConfState) -> Result<(), StoreError> {
        let mut core = self.core.write();
        core.conf_state = cs;
        core.write_stable()
    }

    pub fn first_log_index(&self) -> u64 {
        self.core.read().first_index()
    }

    /// Index covered by the latest durable snapshot (0 when none exists).
    pub fn snapshot_index(&self) -> u64 {
        self.core.read().snapshot.get_metadata().index
    }

    pub fn last_log_index(&self) -> u64 {
        self.core.read().last_index()
    }

    pub fn term_of(&self, index: u64) -> Option<u64> {
        self.core.read().term_at(index)
    }

    /// Appends entries from a Ready, truncating any conflicting suffix.
    pub fn append(&self, entries: &[Entry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut core = self.core.write();

        let first_new = entries[0].index;
        if first_new > core.last_index() + 1 {
            return Err(StoreError::Gap {
                expected: core.last_index() + 1,
                got: first_new,
            });
        }

        if first_new <= core.last_index() && !core.entries.is_empty() {
            // A new leader is overwriting uncommitted entries.
            core.entries.retain(|e| e.index < first_new);
            core.entries.extend_from_slice(entries);
            core.rewrite_log()
        } else {
            core.entries.extend_from_slice(entries);
            core.append_log(entries)
        }
    }

    /// Installs a snapshot received from the leader: membership and commit
    /// point come from its metadata, and the local log is superseded.
    pub fn apply_snapshot(&self, snap: Snapshot) -> Result<(), StoreError> {
        let mut core = self.core.write();
        core.adopt_snapshot(snap);
        core.entries.clear();
        core.rewrite_log()?;
        core.write_stable()
    }

    /// Records a locally-captured snapshot so lagging peers can be served
    /// from it. The log itself is trimmed separately via [`Self::compact`].
    pub fn install_snapshot(&self, snap: Snapshot) {
        self.core.write().snapshot = snap;
    }

    /// Drops all entries below `to_index`.
    pub fn compact(&self, to_index: u64) -> Result<(), StoreError> {
        let mut core = self.core.write();
        core.entries.retain(|e| e.index >= to_index);
        core.rewrite_log()
    }
}

impl Storage for DiskStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.core.read();
        Ok(RaftState {
            hard_state: core.hard_state.clone(),
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.core.read();
        if low < core.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let offset = match core.entries.first() {
            Some(first) => first.index,
            None => return Ok(Vec::new()),
        };
        let lo = (low - offset) as usize;
        let hi = (high - offset) as usize;
        let mut out: Vec<Entry> = core.entries[lo..hi].to_vec();

        if let Some(max_size) = max_size.into() {
            limit_entry_bytes(&mut out, max_size);
        }
        Ok(out)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.core.read();
        match core.term_at(idx) {
            Some(term) => Ok(term),
            None if idx < core.first_index() => Err(raft::Error::Store(StorageError::Compacted)),
            None => Err(raft::Error::Store(StorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.core.read().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.core.read().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.core.read();
        let meta = core.snapshot.get_metadata();
        if meta.index == 0 || meta.index < request_index {
            // Nothing durable that covers the request yet; the caller
            // retries once the snapshot policy has produced one.
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(core.snapshot.clone())
    }
}

impl StorageCore {
    fn first_index(&self) -> u64 {
        match self.entries.first() {
            Some(e) => e.index,
            None => self.snapshot.get_metadata().index + 1,
        }
    }

    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(e) => e.index,
            None => self.snapshot.get_metadata().index,
        }
    }

    fn term_at(&self, idx: u64) -> Option<u64> {
        let meta = self.snapshot.get_metadata();
        if idx == meta.index {
            return Some(meta.term);
        }
        let first = self.entries.first()?.index;
        if idx < first || idx > self.last_index() {
            return None;
        }
        Some(self.entries[(idx - first) as usize].term)
    }

    fn adopt_snapshot(&mut self, snap: Snapshot) {
        let meta = snap.get_metadata();
        self.conf_state = meta.get_conf_state().clone();
        if self.hard_state.term < meta.term {
            self.hard_state.term = meta.term;
        }
        if self.hard_state.commit < meta.index {
            self.hard_state.commit = meta.index;
        }
        self.snapshot = snap;
    }

    fn append_log(&self, entries: &[Entry]) -> Result<(), StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            write_record(&mut writer, &entry.encode_to_vec())?;
        }
        writer.flush()?;
        Ok(())
    }

    fn rewrite_log(&self) -> Result<(), StoreError> {
        let tmp = self.log_path.with_extension("bin.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in &self.entries {
                write_record(&mut writer, &entry.encode_to_vec())?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.log_path)?;
        Ok(())
    }

    fn write_stable(&self) -> Result<(), StoreError> {
        let tmp = self.stable_path.with_extension("bin.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            write_record(&mut writer, &self.hard_state.encode_to_vec())?;
            write_record(&mut writer, &self.conf_state.encode_to_vec())?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.stable_path)?;
        Ok(())
    }
}

/// Rolling store of full-state snapshots, newest three kept.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn save(&self, snap: &Snapshot) -> Result<(), StoreError> {
        let meta = snap.get_metadata();
        let name = format!("{:020}-{:020}{}", meta.term, meta.index, SNAPSHOT_SUFFIX);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        fs::write(&tmp, snap.encode_to_vec())?;
        fs::rename(&tmp, &path)?;
        self.prune()?;
        Ok(())
    }

    pub fn load_latest(&self) -> Result<Option<Snapshot>, StoreError> {
        let Some(path) = self.sorted_snapshots()?.pop() else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        let snap = Snapshot::decode(bytes.as_slice())
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
        Ok(Some(snap))
    }

    fn prune(&self) -> Result<(), StoreError> {
        let mut paths = self.sorted_snapshots()?;
        while paths.len() > RETAINED_SNAPSHOTS {
            let stale = paths.remove(0);
            if let Err(e) = fs::remove_file(&stale) {
                tracing::warn!(path = %stale.display(), error = %e, "failed to prune snapshot");
            }
        }
        Ok(())
    }

    /// Snapshot paths sorted oldest-first; the zero-padded `<term>-<index>`
    /// names make lexicographic order the log order.
    fn sorted_snapshots(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext == "snap")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn write_record<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), StoreError> {
    writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_records(path: &Path) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => file.read_to_end(&mut bytes)?,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut rest = bytes.as_slice();
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(StoreError::Corrupt(format!(
                "{}: truncated record header",
                path.display()
            )));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(StoreError::Corrupt(format!(
                "{}: truncated record body",
                path.display()
            )));
        }
        records.push(rest[..len].to_vec());
        rest = &rest[len..];
    }
    Ok(Some(records))
}

fn read_log(path: &Path) -> Result<Vec<Entry>, StoreError> {
    let Some(records) = read_records(path)? else {
        return Ok(Vec::new());
    };
    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        let entry = Entry::decode(record.as_slice())
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn read_stable(path: &Path) -> Result<Option<(HardState, ConfState)>, StoreError> {
    let Some(records) = read_records(path)? else {
        return Ok(None);
    };
    if records.len() != 2 {
        return Err(StoreError::Corrupt(format!(
            "{}: expected 2 records, found {}",
            path.display(),
            records.len()
        )));
    }
    let hs = HardState::decode(records[0].as_slice())
        .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
    let cs = ConfState::decode(records[1].as_slice())
        .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
    Ok(Some((hs, cs)))
}

/// Truncates `entries` to the byte budget, always keeping the first entry.
fn limit_entry_bytes(entries: &mut Vec<Entry>, max_size: u64) {
    if entries.len() <= 1 {
        return;
    }
    let mut size = 0u64;
    let mut keep = 0;
    for (i, entry) in entries.iter().enumerate() {
        size += entry.encoded_len() as u64;
        if i > 0 && size > max_size {
            break;
        }
        keep = i + 1;
    }
    entries.truncate(keep);
}
