//! Configuration translation runtime.
//!
//! Northbound clients issue CRUD, action and subscribe requests against hierarchical
//! configuration paths. [`Translib`] routes each request to the [`handler::AppHandler`]
//! registered for the path, runs writes as one optimistic transaction against the shared
//! key-value store and streams deduplicated JSON snapshots of subscribed paths.

pub mod api;
pub mod auth;
pub mod config;
mod coordinator;
mod errors;
pub mod handler;
pub mod metrics;
mod notification;
pub mod registry;
mod runtime;
pub mod store;
pub mod utils;

pub use errors::*;
pub use runtime::*;


//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;

//-----------------------------------------------------------
// Autometrics
/// autometrics: https://docs.autometrics.dev/rust/adding-alerts-and-slos
use autometrics::objectives::Objective;
use autometrics::objectives::ObjectiveLatency;
use autometrics::objectives::ObjectivePercentile;
const API_SLO: Objective = Objective::new("api")
    .success_rate(ObjectivePercentile::P99_9)
    .latency(ObjectiveLatency::Ms10, ObjectivePercentile::P99);
