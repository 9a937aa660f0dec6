//! The replicated state machine: a datatype-typed key/value service layered
//! over an ordered storage engine. Every user key is described by a key
//! descriptor recording its type and size; collection values (hashes, sets,
//! deques, locality hashes) store their fields as separate engine keys under
//! a per-key prefix. See the [`keys`] module for the exact layout.
//!
//! Writes are grouped into staging areas (write batch + overlay index) and
//! committed atomically together with the last-applied journal index,
//! delivering at-most-once application of journal entries.

pub mod descriptor;
pub mod keys;
mod machine;
pub(crate) mod pattern;
mod staging;
mod timekeeper;

pub use descriptor::{Direction, KeyDescriptor, KeyType};
pub use machine::{LeaseAcquisition, LeaseInfo, StateMachine};
pub use staging::{ReadStaging, StagingRead, WriteStaging};
pub use timekeeper::{ClockValue, Timekeeper};
