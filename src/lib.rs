//! Antigravity Gateway - translating API gateway for the Cloud Code
//! upstream.
//!
//! Clients speak either the OpenAI Chat Completions dialect or the
//! Anthropic Messages dialect; the upstream speaks the Google
//! generative-content dialect. This crate exposes compatible HTTP surfaces
//! for all three and translates between them, preserving streaming, tool
//! use, thinking/reasoning blocks, and prompt caching.
//!
//! Design goals:
//! - Normalise every public dialect to one internal representation (the
//!   Anthropic message format) before the Google leg.
//! - Keep a pool of upstream credentials with sticky, cache-friendly
//!   selection and per-model rate-limit cooldowns.
//! - Never let a reasoning signature minted by one model family reach the
//!   other family's validator.
//! - Validate the first chunk of every upstream stream before committing
//!   it to the caller, so silent upstream failures retry transparently.

pub mod accounts;
pub mod atomic_write;
pub mod config;
pub mod error;
pub mod models;
pub mod openai;
pub mod ratelimit;
pub mod schema;
pub mod server;
pub mod session;
pub mod signature;
pub mod streaming;
pub mod translation;
pub mod types;
pub mod upstream;

pub use config::GatewayConfig;
pub use server::serve;
