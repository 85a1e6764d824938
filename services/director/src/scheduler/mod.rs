//! Dynamic sidecar scheduler.
//!
//! The scheduler is responsible for:
//! - Tracking every instance it owns in an in-memory registry
//! - Reconciling each instance through the rule pipeline, one task at a time
//! - Handling operator requests: removal, observation toggles, status resets
//! - Re-adopting running sidecars after a restart
//!
//! An instance moves through the pipeline in `events`: stack creation, sidecar
//! readiness, environment preparation, user services, project networks and,
//! once marked, teardown.

mod context;
mod events;
mod observer;
mod registry;
mod teardown;
mod worker;

pub use self::context::SchedulerContext;
pub use self::events::{Rule, PIPELINE};
pub use self::registry::Scheduler;
