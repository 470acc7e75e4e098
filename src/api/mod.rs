//! Ring and transport abstractions shared by every backend.

mod hint;
mod ring;
mod transport;

pub use crate::errors::{Error, Result};
pub use hint::{likely, unlikely};
pub use ring::{Direction, Ring, RingSet, Slot, SlotFlags};
pub use transport::{Backend, Readiness, Transport};
