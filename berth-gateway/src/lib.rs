//! HTTP API gateway for the Berth port layer.
//!
//! Exposes container lifecycle, task, network, interaction, and event
//! endpoints over the assembled [`core::Core`]. Streaming responses are
//! newline-delimited JSON or raw bytes, flushed per record.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod core;
pub mod error;
pub mod routes;
pub mod stream;
