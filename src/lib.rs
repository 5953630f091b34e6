//! Bulwark - Rate Limiting and Brute-Force Protection
//!
//! This crate implements the request-admission core of a multi-tenant API:
//! windowed request counting per client and endpoint, an append-only ledger
//! of login attempts, automatic banning of clients that keep failing to
//! authenticate, an operator release workflow, and periodic retention
//! sweeps. It is exposed to the HTTP layer over gRPC.

pub mod ban;
pub mod bruteforce;
pub mod config;
pub mod error;
pub mod grpc;
pub mod guard;
pub mod ratelimit;
pub mod report;
pub mod retention;

pub use guard::Guard;
