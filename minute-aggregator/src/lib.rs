//! Minute aggregation of IoT telemetry.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`, full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`, full chain with `Caused by:` sections (Debug).
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source.

pub mod accumulator;
pub mod config;
pub mod dead_letter;
pub mod decoder;
pub mod error;
pub mod event;
pub mod flusher;
pub mod health;
pub mod kafka;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod service;
pub mod sink;
pub mod snapshot;
pub mod window;
