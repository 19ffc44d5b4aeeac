//! Decision core of an external-authorization sidecar.
//!
//! A reverse proxy asks, for every incoming request, whether it may be
//! forwarded upstream. [`Authorizer::check`] answers by decoding the session
//! token, unwrapping forward-auth requests, synchronizing the session's
//! identity records from the identity store, and evaluating the route's
//! custom policies.

pub mod authorizer;
pub mod authz;
pub mod config;
pub mod identity;
#[cfg(feature = "server")]
pub mod observability;
pub mod request;
pub mod routes;
pub mod session;

pub use authorizer::{AuthorizeOptions, Authorizer, CheckResponse};
pub use routes::{AppState, StartupError, build_app};
