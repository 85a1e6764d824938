//! Director: the dynamic sidecar scheduler.
//!
//! Drives interactive user services on a Docker Swarm cluster. Each instance
//! gets a sidecar that manages the user's containers, a reverse proxy in front
//! of them and a dedicated network. The scheduler reconciles every tracked
//! instance towards running, and tears it down on request, saving its state
//! and outputs first.

pub mod api;
pub mod cleanup;
pub mod config;
pub mod docker_api;
pub mod error;
pub mod instrumentation;
pub mod models;
pub mod node_rights;
pub mod projects;
pub mod scheduler;
pub mod sidecar;
pub mod specs;
pub mod state;
pub mod volumes;
