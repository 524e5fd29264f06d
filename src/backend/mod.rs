//! Backend runtimes the proxy forwards to.

use std::path::PathBuf;

use crate::namespace::Namespace;

pub mod client;
pub mod connection;
pub mod connector;

pub use client::{BackendClient, Call};
pub use connection::{BackendConnection, ConnectionState};
pub use connector::{Connected, Connector, UnixConnector};

/// A configured backend: where it listens and which namespace it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub namespace: Namespace,
    pub address: PathBuf,
}

impl BackendSpec {
    pub fn new(namespace: Namespace, address: impl Into<PathBuf>) -> Self {
        Self {
            namespace,
            address: address.into(),
        }
    }
}
