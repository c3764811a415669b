//! Command dispatch for the lattice reconciliation engine
//!
//! Turns required actions into outbound commands and tracks each one by its
//! idempotency key until it is acknowledged, retried to exhaustion, or
//! expires.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod dispatcher;
pub mod error;
pub mod policy;
pub mod sink;

pub use dispatcher::{AckOutcome, CommandDispatcher, DispatchOutcome, ReapReport};
pub use error::{DispatchError, Result, SinkError};
pub use policy::RetryPolicy;
pub use sink::{CommandSink, RecordingSink};
