//! # dynsched-id
//!
//! Typed identifiers used by the dynamic sidecar scheduler.
//!
//! ## Two families of IDs
//!
//! - **Platform IDs** are handed to the scheduler by the outer platform
//!   (service instances, projects). They are plain UUIDs because they end up
//!   in swarm service names, labels and volume names verbatim.
//! - **Scheduler IDs** are minted here (runs, lock tokens). They use the
//!   prefixed format `{prefix}_{ulid}` so they are sortable and self-describing.
//!
//! Examples:
//! - `2b4d6c4e-5a8f-4d1c-9a55-0c3f1e7d2b10` (instance)
//! - `run_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `lock_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-exported for the ID macros and for callers that need raw values.
pub use ulid::Ulid;
pub use uuid::Uuid;
