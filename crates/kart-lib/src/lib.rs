//! kart-lib: announcement engine.
//!
//! Speech cache, cross-process playback claim, audio playback, button
//! monitor and HTTP API. Depends on kart-core for pure types and math.

pub mod announcer;
pub mod cache;
pub mod claim_store;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gpio;
pub mod player;
pub mod server;
pub mod status;
pub mod synth;

#[cfg(test)]
mod testing;

// Re-export kart-core for convenience
pub use kart_core;
