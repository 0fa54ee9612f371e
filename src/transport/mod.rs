//! HTTP surface of the tenant router.
//!
//! - `http`: routes, admin endpoints and the server loop
//! - `middleware`: wraps tenant-scoped requests in a unit of work

pub mod http;
pub mod middleware;

pub use http::{AppState, HttpTransport, router};
pub use middleware::{CurrentUnit, unit_of_work};
