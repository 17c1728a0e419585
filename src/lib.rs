//! Turnstile - Per-Caller HTTP Rate Limiting
//!
//! This crate throttles inbound HTTP traffic per caller. Unauthenticated
//! callers are counted by network address, authenticated callers by their
//! access token. Counters and block markers live behind a storage gateway
//! so that several service replicas can share them through Redis.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod storage;
