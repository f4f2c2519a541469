//! QBFT: Istanbul BFT with justified round changes.
//!
//! ROUND-CHANGE messages carry the round and digest the sender last prepared, the
//! prepared block, and the PREPAREs proving it. The proposer of a round greater than
//! zero attaches a quorum of ROUND-CHANGE messages (and the PREPAREs of the highest
//! prepared round) to its PRE-PREPARE, and validators only accept the proposal if
//! that evidence [justifies](justification::is_justified) it.

pub mod core;
pub mod justification;
pub mod round;
pub mod round_change;
pub mod types;

pub use self::core::Core;
