//! Command-line interface module.
//!
//! Startup glue for the `criproxy` binary: logging setup, running the
//! proxy and waiting for a shutdown signal.

pub mod handlers;

pub use handlers::{init_logging, run_proxy, shutdown_signal};
