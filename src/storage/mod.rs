//! Ordered key/value storage engines backing the state machine and the Raft
//! journal. For details, see the [`engine`], [`bitcask`] module documentation.

pub mod bitcask;
pub mod engine;
pub mod memory;

pub use bitcask::BitCask;
pub use engine::{Engine, ReadView, ScanIterator, Status, WriteBatch};
pub use memory::Memory;
