//! Last known names of images referenced by digest.
//!
//! A digest carries no namespace prefix, so when only a digest is at hand
//! the owning runtime is recovered from the prefixed name it was last seen
//! under.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

#[derive(Debug, Default)]
pub struct ImageNameTable {
    names: Mutex<HashMap<String, String>>,
}

impl ImageNameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers that `id` was last seen as the prefixed `name`.
    pub fn record(&self, id: &str, name: &str) {
        if id.is_empty() || name.is_empty() || id == name {
            return;
        }
        trace!("image {} is known as {}", id, name);
        self.names.lock().insert(id.to_string(), name.to_string());
    }

    pub fn lookup(&self, id: &str) -> Option<String> {
        self.names.lock().get(id).cloned()
    }

    pub fn forget(&self, id: &str) {
        self.names.lock().remove(id);
    }

    /// Drops every id last seen under `name`.
    pub fn forget_name(&self, name: &str) {
        self.names.lock().retain(|_, known| known != name);
    }

    pub fn len(&self) -> usize {
        self.names.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
