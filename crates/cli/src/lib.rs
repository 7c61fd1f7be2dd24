//! Process wiring for the `webmux` binary: argument parsing, logging,
//! the Primary endpoint, and the hot-reload collaborators.

pub mod cli;
pub mod logging;
pub mod reload;
pub mod server;
