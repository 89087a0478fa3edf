//! Correlation and dispatch core for pluggable instant-messaging backends.
//!
//! The [`Dispatcher`] binds outgoing requests to result callbacks through
//! generated [`CorrelationId`]s, fans normalized inbound messages out to
//! registered observers on a single coordination context, and lets callers
//! reclaim abandoned callbacks by tag or by age. Transport work lives behind
//! the [`Backend`] trait.
pub mod backend;
pub mod callbacks;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod dispatcher;
pub mod error;
pub mod normalizer;
pub mod observers;
pub mod sweeper;
pub mod testkit;
pub mod types;

pub use backend::*;
pub use callbacks::*;
pub use clock::*;
pub use config::*;
pub use coordination::*;
pub use dispatcher::*;
pub use error::*;
pub use normalizer::*;
pub use observers::*;
pub use sweeper::*;
pub use types::*;

/// Returns the semantic version advertised by this crate.
///
/// ```
/// assert_eq!(imb_core::version(), env!("CARGO_PKG_VERSION"));
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
