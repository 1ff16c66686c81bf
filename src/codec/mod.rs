//! Codec module - payload serialization.
//!
//! Frame payloads and both newline-delimited control planes carry UTF-8
//! JSON; [`JsonCodec`] is the single place that touches `serde_json` for
//! them.

mod json;

pub use json::JsonCodec;
