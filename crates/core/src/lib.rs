//! Core runtime for webmux: one shared browser-control connection,
//! arbitrated across processes and serialized within one.
//!
//! Three pieces cooperate:
//!
//! - [`serializer`] runs tool calls strictly one at a time, checking for
//!   rebuilt binaries at batch boundaries and draining into a controlled
//!   restart when this process itself went stale.
//! - [`bridge`] elects a single Primary per host via a lock record plus a
//!   liveness probe, and relays every other process's traffic to it.
//! - [`adapter`] presents the relayed single-target link as a multi-target
//!   DevTools endpoint by answering the discovery and attach commands
//!   locally.

pub mod adapter;
pub mod bridge;
pub mod error;
pub mod lock;
pub mod probe;
pub mod relay;
pub mod serializer;

pub use adapter::SessionAdapter;
pub use bridge::{BridgeConfig, Role, SecondaryBridge, elect_role};
pub use error::{Error, Result};
pub use lock::{LockRegistry, default_lock_path, mint_instance_id, new_record};
pub use probe::ProbeClient;
pub use relay::{RelayConnection, RelayEvent};
pub use serializer::{
    ChangeCheckResult, ChangeDetector, RestartState, Serializer, ShutdownHooks, SideChannel,
    StalenessConfig,
};
