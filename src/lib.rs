#![forbid(unsafe_code)]

//! Media-fetch gateway: admits HTTP requests for remote videos, schedules
//! yt-dlp invocations over bounded worker pools and relays the output back
//! to the client.

pub mod admission;
pub mod cache;
pub mod config;
pub mod error;
pub mod queue;
pub mod relay;
pub mod resolver;
pub mod security;
pub mod server;
pub mod sink;
pub mod stats;
pub mod video;
pub mod worker;

#[cfg(test)]
mod test_support;
