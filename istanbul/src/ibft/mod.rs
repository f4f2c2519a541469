//! IBFT: the original Istanbul BFT protocol.
//!
//! A validator that observes a quorum of PREPAREs locks on the prepared proposal. While
//! locked it only prepares that proposal and, as the proposer of a later round, proposes
//! it again. ROUND-CHANGE messages only name the target view.

pub mod core;
pub mod round;
pub mod round_change;
pub mod types;

pub use self::core::Core;
