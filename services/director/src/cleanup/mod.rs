//! Background cleanup of cluster leftovers.
//!
//! Volume removers are one-shot services pinned to a node. When their node
//! goes away they never finish, so the janitor reaps them once they have run
//! far longer than they declared.

mod worker;

pub use worker::VolumeRemovalJanitor;
