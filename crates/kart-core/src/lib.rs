//! kart-core: pure types and announcement math.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod cache_key;
pub mod claim;
pub mod debounce;
pub mod mp3;
pub mod text_prep;
pub mod types;
