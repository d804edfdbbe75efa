//! Core consensus node: a `RawNode` over durable storage, wired to the
//! replicated state machine.

use prost::Message as ProstMessage;
use raft::eraftpb::{ConfChange, ConfChangeType, Entry, EntryType, Message, Snapshot};
use raft::{Config as RaftConfig, RawNode, StateRole};
use slog::{o, Logger};

use crate::config::RaftSettings;
use crate::raft::fsm::{ApplyOutcome, StateMachine};
use crate::raft::storage::{DiskStorage, SnapshotStore};
use crate::raft::RaftError;

/// Heartbeats fire every 3 logical ticks, elections after 6, so with the
/// tick interval at a third of the configured heartbeat timeout the
/// election timeout lands at twice the heartbeat timeout.
pub const HEARTBEAT_TICKS: usize = 3;
pub const ELECTION_TICKS: usize = 2 * HEARTBEAT_TICKS;

/// Cap on bytes of entries per AppendEntries message (64 entries at a
/// generous command size).
const MAX_APPEND_BYTES: u64 = 64 * 1024;

/// Once this many applied entries pile up past the last snapshot, capture
/// a new one and drop the covered log prefix.
const SNAPSHOT_THRESHOLD: u64 = 8192;

/// One committed entry surfaced out of ready processing.
pub enum Applied {
    Command {
        index: u64,
        term: u64,
        result: Result<ApplyOutcome, String>,
    },
    Membership {
        index: u64,
        kind: ConfChangeType,
        node_id: u64,
        context: Vec<u8>,
    },
}

/// Everything a single ready round produced: messages to ship to peers and
/// entries applied locally.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<Applied>,
}

pub struct RaftNode {
    id: u64,
    raw: RawNode<DiskStorage>,
    storage: DiskStorage,
    snapshots: SnapshotStore,
    fsm: Box<dyn StateMachine>,
    applied_index: u64,
}

impl RaftNode {
    pub fn new(
        settings: &RaftSettings,
        storage: DiskStorage,
        snapshots: SnapshotStore,
        fsm: Box<dyn StateMachine>,
    ) -> Result<Self, RaftError> {
        let applied_index = storage.snapshot_index();
        let cfg = RaftConfig {
            id: settings.node_id,
            election_tick: ELECTION_TICKS,
            heartbeat_tick: HEARTBEAT_TICKS,
            max_size_per_msg: MAX_APPEND_BYTES,
            max_inflight_msgs: 256,
            applied: applied_index,
            ..Default::default()
        };
        // Consensus internals log through tracing at the application level;
        // the library's own logger is discarded.
        let logger = Logger::root(slog::Discard, o!());
        let raw = RawNode::new(&cfg, storage.clone(), &logger)?;
        Ok(Self {
            id: settings.node_id,
            raw,
            storage,
            snapshots,
            fsm,
            applied_index,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn last_index(&self) -> u64 {
        self.raw.raft.raft_log.last_index()
    }

    /// Advances the logical clock; election and heartbeat timers count in
    /// these ticks.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election immediately instead of waiting out the timeout.
    pub fn campaign(&mut self) -> Result<(), RaftError> {
        self.raw.campaign().map_err(RaftError::from)
    }

    /// Appends a command to the local log for replication. Success means
    /// appended, not committed; commit is observed via [`Self::poll_ready`].
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(), RaftError> {
        self.raw.propose(vec![], data).map_err(RaftError::from)
    }

    pub fn propose_conf_change(&mut self, cc: ConfChange) -> Result<(), RaftError> {
        self.raw.propose_conf_change(vec![], cc).map_err(RaftError::from)
    }

    /// Feeds a message from a peer into the state machine.
    pub fn step(&mut self, msg: Message) -> Result<(), RaftError> {
        self.raw.step(msg).map_err(RaftError::from)
    }

    /// Processes pending ready state, if any: persists what must be
    /// durable, applies committed entries in order, and hands back the
    /// outbound messages.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>, RaftError> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        // Durability first: a received snapshot supersedes the log, then
        // new entries extend it, then the hard state seals the round.
        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
        }
        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }
        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state.clone())?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_messages());
        outbound.extend(ready.take_persisted_messages());

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.set_commit(commit)?;
        }
        applied.extend(self.apply_entries(light.take_committed_entries())?);
        outbound.extend(light.take_messages());
        self.raw.advance_apply();

        self.maybe_snapshot()?;

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
        }))
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<Applied>, RaftError> {
        let mut out = Vec::new();
        for entry in entries {
            self.applied_index = entry.index;
            if entry.data.is_empty() {
                // Leader no-op sealing a new term.
                continue;
            }
            match entry.entry_type() {
                EntryType::EntryNormal => {
                    let result = self.fsm.apply(&entry.data).map_err(|e| e.to_string());
                    out.push(Applied::Command {
                        index: entry.index,
                        term: entry.term,
                        result,
                    });
                }
                EntryType::EntryConfChange => {
                    let cc = ConfChange::decode(&entry.data[..])
                        .map_err(|e| RaftError::Decode(e.to_string()))?;
                    let conf_state = self.raw.apply_conf_change(&cc)?;
                    self.storage.set_conf_state(conf_state)?;
                    out.push(Applied::Membership {
                        index: entry.index,
                        kind: cc.change_type(),
                        node_id: cc.node_id,
                        context: cc.context.to_vec(),
                    });
                }
                EntryType::EntryConfChangeV2 => {
                    // Single-change membership only; V2 joint entries are
                    // never proposed by this node.
                    tracing::warn!(index = entry.index, "ignoring conf-change-v2 entry");
                }
            }
        }
        Ok(out)
    }

    /// Installs a snapshot streamed from the leader: the state machine is
    /// overwritten wholesale and the local log gives way to it.
    fn install_snapshot(&mut self, snap: Snapshot) -> Result<(), RaftError> {
        let index = snap.get_metadata().index;
        tracing::info!(index, "restoring state machine from leader snapshot");
        self.fsm
            .restore(&snap.data)
            .map_err(|e| RaftError::Fsm(e.to_string()))?;
        self.storage.apply_snapshot(snap.clone())?;
        self.snapshots.save(&snap)?;
        self.applied_index = index;
        Ok(())
    }

    /// Captures a snapshot and compacts the log once enough entries have
    /// been applied since the last one.
    fn maybe_snapshot(&mut self) -> Result<(), RaftError> {
        let first = self.storage.first_log_index();
        if self.applied_index < first || self.applied_index - first + 1 < SNAPSHOT_THRESHOLD {
            return Ok(());
        }

        let data = self
            .fsm
            .snapshot()
            .map_err(|e| RaftError::Fsm(e.to_string()))?;
        let term = self
            .storage
            .term_of(self.applied_index)
            .ok_or_else(|| RaftError::Fsm("applied entry already compacted".to_string()))?;

        let mut snap = Snapshot::default();
        snap.mut_metadata().index = self.applied_index;
        snap.mut_metadata().term = term;
        *snap.mut_metadata().mut_conf_state() = self.storage.conf_state();
        snap.data = data.into();

        self.snapshots.save(&snap)?;
        self.storage.install_snapshot(snap);
        self.storage.compact(self.applied_index + 1)?;
        tracing::info!(index = self.applied_index, "snapshot taken, log compacted");
        Ok(())
    }
}
