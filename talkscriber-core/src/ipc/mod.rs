//! Caller-facing event types.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them as JSON without a translation layer.

pub mod events;
