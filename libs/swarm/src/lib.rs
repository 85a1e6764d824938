//! Docker Engine swarm API.
//!
//! The scheduler only needs a small slice of the Engine API: networks,
//! services and tasks. [`SwarmApi`] is that slice. [`DockerClient`] talks to a
//! real engine over its Unix socket; [`InMemorySwarm`] is a single-node fake
//! cluster used by tests.

mod api;
mod docker;
mod error;
mod filters;
mod memory;
pub mod models;

pub use api::SwarmApi;
pub use docker::DockerClient;
pub use error::{SwarmError, SwarmResult};
pub use filters::Filters;
pub use memory::InMemorySwarm;
