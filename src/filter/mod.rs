pub mod qf;

pub use qf::{FilterError, InsertOutcome, QuotientFilter};
