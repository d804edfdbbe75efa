//! Replication plane: a raft log whose committed entries drive every
//! replica's quotient filter through the same deterministic state machine.

pub mod command;
pub mod fsm;
pub mod node;
pub mod storage;
pub mod transport;
pub mod worker;

pub use command::{Operation, RaftCommand};
pub use fsm::{ApplyOutcome, FilterFsm, StateMachine};
pub use worker::{spawn, NodeHandle, RaftStatus, APPLY_TIMEOUT};

use storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("not the leader")]
    NotLeader { leader_http: Option<String> },

    #[error("no leader elected")]
    NoLeader,

    #[error("apply timed out")]
    ApplyTimeout,

    #[error("apply failed: {0}")]
    Apply(String),

    #[error("proposal failed: {0}")]
    Proposal(String),

    #[error("raft node is shut down")]
    Shutdown,

    #[error("state machine error: {0}")]
    Fsm(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Raft(#[from] raft::Error),
}
