//! CORS-enabled HLS relay.
//!
//! Fetches a target URL on behalf of a browser player, retrying transport
//! failures, and rewrites every reference in an M3U8 playlist so that the
//! player's follow-up requests come back through the relay.

pub mod cache;
pub mod config;
pub mod error;
pub mod header_rules;
pub mod hls;
pub mod http_retry;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod upstream;
