//! criproxy: a Container Runtime Interface proxy.
//!
//! The proxy serves the CRI on a single socket and multiplexes calls across
//! several backend runtimes. Objects of every runtime but the primary one
//! carry a namespace prefix, which is how calls naming them find their way
//! back. Clients speaking an older CRI revision are served by newer runtimes
//! through message translation.

pub mod backend;
pub mod cli;
pub mod config;
pub mod cri;
pub mod error;
pub mod namespace;
pub mod proxy;

pub use error::{ProxyError, Result};
pub use proxy::RuntimeProxy;
