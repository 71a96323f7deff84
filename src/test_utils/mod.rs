//! Shared fixtures for unit tests: logger setup, a runtime wired to the in-memory store and
//! scripted handlers with failure and blocking modes.
mod common;

pub use common::*;
pub use scripted_app::*;
