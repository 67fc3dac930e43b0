//! Ratekeeper - Rate-Limited Reverse Proxy
//!
//! This crate implements an HTTP reverse proxy that admits each client at a
//! bounded rate before forwarding its requests to a single upstream. Admission
//! state lives either in-process (token bucket or fixed window per client) or
//! in a shared Redis counter so that several gateway replicas enforce one
//! quota.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
