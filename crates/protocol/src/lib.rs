//! Wire types for the webmux protocols.
//!
//! This crate contains the serde-serializable types that cross a process or
//! file boundary: the JSON-RPC-style tool-call envelope spoken by agent
//! clients, the health payload served by the Primary, the persisted lock
//! record naming the current Primary, and the DevTools-protocol envelopes the
//! session adapter works with.
//!
//! Types here are pure data: no behavior beyond (de)serialization and small
//! constructors. The subsystems that give them meaning live in `webmux-core`.

pub mod types;

pub use types::*;
