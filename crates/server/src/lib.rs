//! HTTP surface of the reservation assistant.
//!
//! - **Bootstrap** (`bootstrap`) - configuration, storage and intake wiring
//! - **Routes** (`routes`) - provider webhook, stats and operator endpoints
//! - **Health** (`health`) - readiness probe against the store
//! - **Purge** (`purge`) - background reclamation of expired reservations

pub mod bootstrap;
pub mod health;
pub mod purge;
pub mod routes;

pub use bootstrap::{bootstrap, bootstrap_with_config, Application, BootstrapError};
pub use routes::{router, AppState};
