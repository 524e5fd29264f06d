//! Backend namespaces.
//!
//! Every backend runtime other than the primary one owns a namespace id.
//! Identifiers handed out for its pod sandboxes and containers carry a
//! `{id}__` prefix and image references a `{id}/` prefix, so a later call
//! can be routed back to the runtime that owns the object. The primary
//! runtime never prefixes anything.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ProxyError, Result};

/// Annotation selecting the runtime a pod sandbox is created on.
pub const TARGET_RUNTIME_ANNOTATION: &str = "kubernetes.io/target-runtime";

/// Separator between a namespace id and a sandbox or container id.
pub const ID_SEPARATOR: &str = "__";

/// Separator between a namespace id and an image reference.
pub const IMAGE_SEPARATOR: char = '/';

/// Namespace of one backend runtime. The empty id is the primary runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Namespace {
    id: String,
}

impl Namespace {
    pub fn primary() -> Self {
        Self::default()
    }

    /// Namespace for a named runtime.
    ///
    /// The id must be non-empty and may contain neither `__` nor `/`,
    /// otherwise prefixed values could not be split back unambiguously.
    pub fn named(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ProxyError::Config("empty runtime namespace id".to_string()));
        }
        if id.contains(ID_SEPARATOR) || id.contains(IMAGE_SEPARATOR) {
            return Err(ProxyError::Config(format!(
                "runtime namespace id {:?} may not contain {:?} or {:?}",
                id, ID_SEPARATOR, IMAGE_SEPARATOR
            )));
        }
        Ok(Self { id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_primary(&self) -> bool {
        self.id.is_empty()
    }

    pub fn augment_id(&self, id: &str) -> String {
        if self.is_primary() {
            return id.to_string();
        }
        format!("{}{}{}", self.id, ID_SEPARATOR, id)
    }

    /// Returns the unprefixed id if `id` belongs to this namespace.
    ///
    /// The primary namespace matches everything.
    pub fn id_prefix_matches<'a>(&self, id: &'a str) -> Option<&'a str> {
        if self.is_primary() {
            return Some(id);
        }
        id.strip_prefix(self.id.as_str())
            .and_then(|rest| rest.strip_prefix(ID_SEPARATOR))
    }

    pub fn image_name(&self, name: &str) -> String {
        if self.is_primary() || name.is_empty() || is_digest(name) {
            return name.to_string();
        }
        format!("{}{}{}", self.id, IMAGE_SEPARATOR, name)
    }

    /// Returns the unprefixed image reference if `name` belongs to this
    /// namespace. Digests never carry a namespace.
    pub fn image_matches<'a>(&self, name: &'a str) -> Option<&'a str> {
        if self.is_primary() {
            return Some(name);
        }
        name.strip_prefix(self.id.as_str())
            .and_then(|rest| rest.strip_prefix(IMAGE_SEPARATOR))
    }

    /// A named runtime matches when the target-runtime annotation names it,
    /// the primary one when the annotation is absent.
    pub fn annotations_match(&self, annotations: &HashMap<String, String>) -> bool {
        match annotations.get(TARGET_RUNTIME_ANNOTATION) {
            None => self.is_primary(),
            Some(target) => !self.is_primary() && *target == self.id,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_primary() {
            write!(f, "<primary>")
        } else {
            write!(f, "{}", self.id)
        }
    }
}

/// Whether `value` is a content digest such as `sha256:<hex>`.
pub fn is_digest(value: &str) -> bool {
    let Some((algorithm, encoded)) = value.split_once(':') else {
        return false;
    };
    let expected = match algorithm {
        "sha256" => 64,
        "sha384" => 96,
        "sha512" => 128,
        _ => return false,
    };
    encoded.len() == expected
        && !encoded.bytes().any(|b| b.is_ascii_uppercase())
        && hex::decode(encoded).is_ok()
}
