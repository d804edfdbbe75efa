//! The raft worker: a dedicated thread owning the consensus node.
//!
//! Keeping the node on one thread removes every lock from the consensus
//! path; the HTTP handlers talk to it through a channel and get answers
//! back over oneshot channels once their entry commits. Peer messages
//! arrive through the transport listener on a second channel.

use std::collections::HashMap;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use raft::eraftpb::{ConfChange, ConfChangeType, ConfState, Message};
use raft::StateRole;
use tokio::sync::oneshot;

use crate::config::{PeerAddress, RaftSettings};
use crate::raft::command::RaftCommand;
use crate::raft::fsm::{ApplyOutcome, StateMachine};
use crate::raft::node::{Applied, RaftNode, HEARTBEAT_TICKS};
use crate::raft::storage::{DiskStorage, SnapshotStore, StoreError};
use crate::raft::{transport, RaftError};

/// Callers give a committed entry this long to come back before reporting
/// a timeout; the entry may still commit and apply afterwards.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for talking to a running raft worker. Cheap to clone; all
/// clones feed the same worker.
#[derive(Clone)]
pub struct NodeHandle {
    request_tx: Sender<ClientRequest>,
    apply_timeout: Duration,
}

/// A point-in-time view of the node, served by the worker between rounds.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub node_id: u64,
    pub term: u64,
    pub is_leader: bool,
    pub leader_id: u64,
    pub leader_http_addr: Option<String>,
}

enum ClientRequest {
    Propose {
        command: RaftCommand,
        respond_to: oneshot::Sender<Result<ApplyOutcome, RaftError>>,
    },
    AddPeer {
        peer: PeerAddress,
        respond_to: oneshot::Sender<Result<(), RaftError>>,
    },
    RemovePeer {
        node_id: u64,
        respond_to: oneshot::Sender<Result<(), RaftError>>,
    },
    Status {
        respond_to: oneshot::Sender<RaftStatus>,
    },
    Campaign,
    Shutdown,
}

impl NodeHandle {
    /// Replicates a command and waits for it to commit and apply locally.
    pub async fn propose(&self, command: RaftCommand) -> Result<ApplyOutcome, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Propose {
                command,
                respond_to: tx,
            })
            .map_err(|_| RaftError::Shutdown)?;
        match tokio::time::timeout(self.apply_timeout, rx).await {
            Err(_) => Err(RaftError::ApplyTimeout),
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Ok(Ok(result)) => result,
        }
    }

    /// Adds a voter; committed through the log like any other entry.
    pub async fn add_peer(&self, peer: PeerAddress) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::AddPeer {
                peer,
                respond_to: tx,
            })
            .map_err(|_| RaftError::Shutdown)?;
        match tokio::time::timeout(self.apply_timeout, rx).await {
            Err(_) => Err(RaftError::ApplyTimeout),
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn remove_peer(&self, node_id: u64) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::RemovePeer {
                node_id,
                respond_to: tx,
            })
            .map_err(|_| RaftError::Shutdown)?;
        match tokio::time::timeout(self.apply_timeout, rx).await {
            Err(_) => Err(RaftError::ApplyTimeout),
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn status(&self) -> Result<RaftStatus, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Status { respond_to: tx })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Kicks off an election now; only tests need this, elections fire on
    /// their own timeout in normal operation.
    pub fn campaign(&self) {
        let _ = self.request_tx.send(ClientRequest::Campaign);
    }

    pub fn shutdown(&self) {
        let _ = self.request_tx.send(ClientRequest::Shutdown);
    }
}

/// Boots the consensus plane: restores the newest snapshot into the state
/// machine, opens the durable stores, binds the peer transport and spawns
/// the worker thread.
pub fn spawn(settings: &RaftSettings, mut fsm: Box<dyn StateMachine>) -> Result<NodeHandle, RaftError> {
    let snapshots = SnapshotStore::open(Path::new(&settings.snapshot_dir))?;
    let restored = snapshots.load_latest()?;
    if let Some(snap) = &restored {
        fsm.restore(&snap.data)
            .map_err(|e| RaftError::Fsm(e.to_string()))?;
        tracing::info!(
            index = snap.get_metadata().index,
            "state machine restored from snapshot"
        );
    }

    let mut voters: Vec<u64> = settings.peer_addresses.iter().map(|p| p.id).collect();
    if voters.is_empty() {
        voters.push(settings.node_id);
    }
    voters.sort_unstable();
    voters.dedup();
    let mut conf = ConfState::default();
    conf.voters = voters;

    let storage = DiskStorage::open(Path::new(&settings.log_dir), conf, restored.as_ref())?;
    let node = RaftNode::new(settings, storage, snapshots, fsm)?;

    let peers: HashMap<u64, PeerAddress> = settings
        .peer_addresses
        .iter()
        .map(|p| (p.id, p.clone()))
        .collect();

    let (client_tx, client_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    transport::spawn_listener(&settings.tcp_address, network_tx)
        .map_err(|e| RaftError::Store(StoreError::Io(e)))?;

    let tick_interval = Duration::from_millis(
        (settings.timeout_ms / HEARTBEAT_TICKS as u64).max(10),
    );

    let node_id = settings.node_id;
    thread::Builder::new()
        .name(format!("raft-worker-{node_id}"))
        .spawn(move || {
            let mut worker = Worker {
                node,
                peers,
                client_rx,
                network_rx,
                tick_interval,
                pending: HashMap::new(),
                pending_conf: HashMap::new(),
                last_role: StateRole::Follower,
            };
            if let Err(e) = worker.run() {
                tracing::error!(node_id, error = %e, "raft worker stopped on error");
            }
        })
        .map_err(|e| RaftError::Store(StoreError::Io(e)))?;

    Ok(NodeHandle {
        request_tx: client_tx,
        apply_timeout: APPLY_TIMEOUT,
    })
}

struct PendingPropose {
    term: u64,
    respond_to: oneshot::Sender<Result<ApplyOutcome, RaftError>>,
}

struct Worker {
    node: RaftNode,
    peers: HashMap<u64, PeerAddress>,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<Message>,
    tick_interval: Duration,
    /// Proposed entries awaiting commit, keyed by log index.
    pending: HashMap<u64, PendingPropose>,
    pending_conf: HashMap<u64, oneshot::Sender<Result<(), RaftError>>>,
    last_role: StateRole,
}

impl Worker {
    fn run(&mut self) -> Result<(), RaftError> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = self
                .tick_interval
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.client_rx) -> request => {
                    match request {
                        Ok(request) => {
                            if !self.handle_client_request(request) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> msg => {
                    match msg {
                        Ok(msg) => {
                            if let Err(e) = self.node.step(msg) {
                                tracing::warn!(error = %e, "failed to step peer message");
                            }
                        }
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= self.tick_interval {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.observe_role();
        }
        Ok(())
    }

    /// Returns false when a shutdown was requested.
    fn handle_client_request(&mut self, request: ClientRequest) -> bool {
        match request {
            ClientRequest::Propose {
                command,
                respond_to,
            } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(self.not_leader()));
                    return true;
                }
                let data = match command.encode() {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = respond_to.send(Err(RaftError::Proposal(e.to_string())));
                        return true;
                    }
                };
                let term = self.node.term();
                match self.node.propose(data) {
                    Ok(()) => {
                        let index = self.node.last_index();
                        self.pending
                            .insert(index, PendingPropose { term, respond_to });
                    }
                    Err(e) => {
                        let _ = respond_to.send(Err(RaftError::Proposal(e.to_string())));
                    }
                }
            }
            ClientRequest::AddPeer { peer, respond_to } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(self.not_leader()));
                    return true;
                }
                let context = match serde_json::to_vec(&peer) {
                    Ok(context) => context,
                    Err(e) => {
                        let _ = respond_to.send(Err(RaftError::Proposal(e.to_string())));
                        return true;
                    }
                };
                let mut cc = ConfChange::default();
                cc.set_change_type(ConfChangeType::AddNode);
                cc.node_id = peer.id;
                cc.context = context.into();
                self.propose_membership(cc, respond_to);
            }
            ClientRequest::RemovePeer {
                node_id,
                respond_to,
            } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(self.not_leader()));
                    return true;
                }
                let mut cc = ConfChange::default();
                cc.set_change_type(ConfChangeType::RemoveNode);
                cc.node_id = node_id;
                self.propose_membership(cc, respond_to);
            }
            ClientRequest::Status { respond_to } => {
                let leader_id = self.node.leader_id();
                let _ = respond_to.send(RaftStatus {
                    node_id: self.node.id(),
                    term: self.node.term(),
                    is_leader: self.node.role() == StateRole::Leader,
                    leader_id,
                    leader_http_addr: self
                        .peers
                        .get(&leader_id)
                        .map(|p| p.http_addr.clone()),
                });
            }
            ClientRequest::Campaign => {
                if let Err(e) = self.node.campaign() {
                    tracing::warn!(error = %e, "campaign failed");
                }
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    fn propose_membership(
        &mut self,
        cc: ConfChange,
        respond_to: oneshot::Sender<Result<(), RaftError>>,
    ) {
        match self.node.propose_conf_change(cc) {
            Ok(()) => {
                let index = self.node.last_index();
                self.pending_conf.insert(index, respond_to);
            }
            Err(e) => {
                let _ = respond_to.send(Err(RaftError::Proposal(e.to_string())));
            }
        }
    }

    fn not_leader(&self) -> RaftError {
        let leader_id = self.node.leader_id();
        if leader_id == 0 {
            RaftError::NoLeader
        } else {
            RaftError::NotLeader {
                leader_http: self.peers.get(&leader_id).map(|p| p.http_addr.clone()),
            }
        }
    }

    fn process_ready(&mut self) -> Result<(), RaftError> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch(msg)?;
            }
            for applied in bundle.applied {
                self.finish(applied);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: Message) -> Result<(), RaftError> {
        if msg.to == self.node.id() {
            return self.node.step(msg);
        }
        match self.peers.get(&msg.to) {
            Some(peer) => transport::send_message(&peer.raft_addr, &msg),
            None => tracing::debug!(peer = msg.to, "no route for peer, dropping message"),
        }
        Ok(())
    }

    fn finish(&mut self, applied: Applied) {
        match applied {
            Applied::Command {
                index,
                term,
                result,
            } => {
                if let Some(pending) = self.pending.remove(&index) {
                    let response = if pending.term != term {
                        // A different leader filled this slot; the original
                        // proposal was lost.
                        Err(RaftError::Proposal(
                            "leadership changed before commit".to_string(),
                        ))
                    } else {
                        result.map_err(RaftError::Apply)
                    };
                    let _ = pending.respond_to.send(response);
                } else if let Err(e) = result {
                    // Follower-side apply failure; nobody is waiting here.
                    tracing::warn!(index, error = %e, "apply failed");
                }
            }
            Applied::Membership {
                index,
                kind,
                node_id,
                context,
            } => {
                match kind {
                    ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                        match serde_json::from_slice::<PeerAddress>(&context) {
                            Ok(peer) => {
                                tracing::info!(peer = peer.id, addr = %peer.raft_addr, "peer added");
                                self.peers.insert(peer.id, peer);
                            }
                            Err(e) => {
                                tracing::warn!(node_id, error = %e, "peer added without routable address")
                            }
                        }
                    }
                    ConfChangeType::RemoveNode => {
                        tracing::info!(peer = node_id, "peer removed");
                        self.peers.remove(&node_id);
                    }
                }
                if let Some(respond_to) = self.pending_conf.remove(&index) {
                    let _ = respond_to.send(Ok(()));
                }
            }
        }
    }

    fn observe_role(&mut self) {
        let role = self.node.role();
        if role != self.last_role {
            tracing::info!(
                node_id = self.node.id(),
                ?role,
                leader_id = self.node.leader_id(),
                term = self.node.term(),
                "role changed"
            );
            self.last_role = role;
        }
    }
}
