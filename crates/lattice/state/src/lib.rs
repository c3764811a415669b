//! # Lattice State
//!
//! Folds the lifecycle event stream of every lattice into an observed-state
//! snapshot.
//!
//! ## Overview
//!
//! [`ObservedState`] is a pure left fold: it only ever changes through
//! [`ObservedState::apply`], so any snapshot can be rebuilt by replaying the
//! event log. The fold tolerates:
//!
//! - Redelivery: events at or below a host's sequence high-water mark are skipped
//! - Reordering across hosts: each host is tracked independently
//! - Late duplicates: starting a known instance or stopping an unknown one is a no-op
//!
//! [`LatticeProjector`] owns one log and snapshot per lattice, hands out
//! cheap shared snapshots, and publishes a [`StateChange`] whenever an event
//! changes something the scaler cares about. The [`reaper`] module expires
//! hosts that stopped heartbeating by appending synthetic stop events.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod observed;
pub mod projector;
pub mod reaper;

pub use observed::{Applied, ChangeScope, HostState, InstanceRecord, ObservedState};
pub use projector::{LatticeProjector, StateChange};
pub use reaper::HostReaper;
