//! Caller-facing runtime: the [`Translib`] request API and its [`TranslibBuilder`].

mod builder;
mod translib;


pub use builder::*;
pub use translib::*;
