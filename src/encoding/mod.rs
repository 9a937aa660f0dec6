//! Binary data encodings.
//!
//! - binary: fixed-width big-endian integers, used in engine keys and the
//!   journal entry format.
//! - bincode: used for values stored in the key/value engines.
pub mod bincode;
pub mod binary;
