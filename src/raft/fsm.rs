//! The replicated state machine: committed log entries applied to the
//! local quotient filter.

use std::sync::Arc;

use crate::filter::{FilterError, InsertOutcome, QuotientFilter};
use crate::raft::command::{Operation, RaftCommand};

#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("bad command: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Result of applying one committed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    AlreadyPresent,
    Removed,
    NotPresent,
}

/// What the consensus node needs from the application: deterministic apply
/// plus full-state capture and restore.
pub trait StateMachine: Send {
    fn apply(&mut self, command: &[u8]) -> Result<ApplyOutcome, FsmError>;
    fn snapshot(&self) -> Result<Vec<u8>, FsmError>;
    fn restore(&mut self, stream: &[u8]) -> Result<(), FsmError>;
}

/// State machine over the shared quotient filter. Apply runs strictly in
/// commit order from the raft worker; local readers hit the same filter
/// concurrently through its own lock.
pub struct FilterFsm {
    filter: Arc<QuotientFilter>,
}

impl FilterFsm {
    pub fn new(filter: Arc<QuotientFilter>) -> Self {
        Self { filter }
    }
}

impl StateMachine for FilterFsm {
    fn apply(&mut self, command: &[u8]) -> Result<ApplyOutcome, FsmError> {
        let cmd = RaftCommand::decode(command)?;
        match cmd.operation {
            Operation::Insert => match self.filter.insert(cmd.key.as_bytes())? {
                InsertOutcome::Inserted => Ok(ApplyOutcome::Inserted),
                InsertOutcome::AlreadyPresent => Ok(ApplyOutcome::AlreadyPresent),
            },
            Operation::Remove => {
                if self.filter.remove(cmd.key.as_bytes()) {
                    Ok(ApplyOutcome::Removed)
                } else {
                    Ok(ApplyOutcome::NotPresent)
                }
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, FsmError> {
        Ok(self.filter.snapshot()?)
    }

    fn restore(&mut self, stream: &[u8]) -> Result<(), FsmError> {
        Ok(self.filter.restore(stream)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsm_pair() -> (FilterFsm, Arc<QuotientFilter>) {
        let filter = Arc::new(QuotientFilter::new(10).unwrap());
        (FilterFsm::new(Arc::clone(&filter)), filter)
    }

    #[test]
    fn applies_inserts_and_removes() {
        let (mut fsm, filter) = fsm_pair();

        let outcome = fsm
            .apply(&RaftCommand::insert("a").encode().unwrap())
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Inserted);
        assert!(filter.exists(b"a").0);

        let outcome = fsm
            .apply(&RaftCommand::insert("a").encode().unwrap())
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyPresent);
        assert_eq!(filter.count(), 1);

        let outcome = fsm
            .apply(&RaftCommand::remove("a").encode().unwrap())
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Removed);
        assert_eq!(filter.count(), 0);

        let outcome = fsm
            .apply(&RaftCommand::remove("a").encode().unwrap())
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::NotPresent);
    }

    #[test]
    fn rejects_malformed_commands() {
        let (mut fsm, _filter) = fsm_pair();
        assert!(matches!(fsm.apply(b"{nope"), Err(FsmError::Decode(_))));
    }

    #[test]
    fn identical_command_sequences_converge() {
        let (mut a, filter_a) = fsm_pair();
        let (mut b, filter_b) = fsm_pair();

        let commands: Vec<Vec<u8>> = (0..200)
            .map(|i| RaftCommand::insert(format!("key-{i}")).encode().unwrap())
            .chain((0..50).map(|i| RaftCommand::remove(format!("key-{i}")).encode().unwrap()))
            .collect();

        for cmd in &commands {
            a.apply(cmd).unwrap();
            b.apply(cmd).unwrap();
        }

        // Replicas that applied the same log must hold identical state.
        assert_eq!(filter_a.count(), filter_b.count());
        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }

    #[test]
    fn snapshot_restore_transfers_state() {
        let (mut a, _filter_a) = fsm_pair();
        for i in 0..100 {
            a.apply(&RaftCommand::insert(format!("k{i}")).encode().unwrap())
                .unwrap();
        }

        let stream = a.snapshot().unwrap();
        let (mut b, filter_b) = fsm_pair();
        b.restore(&stream).unwrap();

        assert_eq!(filter_b.count(), 100);
        assert!(filter_b.exists(b"k42").0);
    }
}
