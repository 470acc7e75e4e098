//! Safe-ish access to netmap ports and their shared-memory rings.

pub mod errors;
pub mod port;
pub mod ring;

pub use port::{Port, Readiness};
pub use ring::{RawRing, SlotRef};
