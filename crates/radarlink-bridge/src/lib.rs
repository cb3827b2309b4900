//! # radarlink-bridge
//!
//! Service library for the radarlink bridge: process wiring, logging, signal
//! handling and the local status API.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod app;
pub mod logging;
pub mod signals;
pub mod state;
