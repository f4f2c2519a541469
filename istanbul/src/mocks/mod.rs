//! In-memory chain, backend, and network used to test the state machines.

pub mod backend;
pub mod block;
pub mod network;
