//! HTTP adapter: caller identity extraction, the rate limiting middleware
//! and the server that hosts them.

mod middleware;
mod server;

pub use middleware::{
    caller_identity, health, rate_limit, router, CallerIdentity, API_KEY_HEADER,
    FORWARDED_FOR_HEADER, REJECTION_BODY,
};
pub use server::{serve_listener, HttpServer};
