//! Remote API surface
//!
//! `transport` is the HTTP seam, `client` adds auth and error mapping, and
//! the remaining modules are typed wrappers over individual endpoints.

mod accounts;
pub mod client;
mod requisitions;
pub mod tokens;
pub mod transport;

pub use client::{Endpoint, RemoteClient};
pub use requisitions::{Institution, Requisition};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, RateLimitHeaders, Transport};
