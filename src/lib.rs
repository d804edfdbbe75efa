//! Quotient: a replicated approximate set-membership service.
//!
//! A quotient filter answers "have I seen this key?" in constant space with
//! a tunable false-positive rate, and unlike a bloom filter it also supports
//! deletion and counting. This crate replicates one across a small cluster:
//! every mutation is committed through a raft log and applied deterministically
//! to each replica's filter, so a lookup on any node reflects the same
//! approximate set.
//!
//! # Architecture
//!
//! - [`hash`]: MurmurHash3 fingerprinting, identical on every replica
//! - [`filter`]: the packed-slot quotient filter engine
//! - [`raft`]: consensus node, durable log/snapshot stores, state machine
//! - [`api`]: HTTP surface with follower-to-leader forwarding
//! - [`config`]: YAML configuration
//!
//! # Example
//!
//! ```no_run
//! use quotient::filter::QuotientFilter;
//!
//! let filter = QuotientFilter::new(10).unwrap();
//! filter.insert(b"page-view:42").unwrap();
//! let (found, elapsed) = filter.exists(b"page-view:42");
//! assert!(found);
//! println!("lookup took {elapsed:?}");
//! ```

pub mod api;
pub mod config;
pub mod filter;
pub mod hash;
pub mod raft;

// Re-export commonly used types
pub use config::Config;
pub use filter::{FilterError, QuotientFilter};
pub use crate::raft::{NodeHandle, RaftCommand};
