//! Distributed consistency primitives

pub mod crdt;
pub mod vector_clock;

pub use crdt::{CrdtOpType, CrdtOperation, CrdtState, MAX_OP_LOG};
pub use vector_clock::{ClockOrdering, VectorClock};
