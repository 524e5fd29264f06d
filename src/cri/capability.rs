//! Field views the router works through.
//!
//! Each message type declares which routing-relevant fields it carries.
//! Accessors a message does not implement return `None`.

use std::collections::HashMap;

use crate::namespace::Namespace;

pub trait Capabilities {
    fn pod_sandbox_id(&mut self) -> Option<&mut String> {
        None
    }

    fn container_id(&mut self) -> Option<&mut String> {
        None
    }

    fn image(&mut self) -> Option<&mut String> {
        None
    }

    fn id_filter(&mut self) -> Option<&mut String> {
        None
    }

    fn pod_sandbox_id_filter(&mut self) -> Option<&mut String> {
        None
    }

    fn image_filter(&mut self) -> Option<&mut String> {
        None
    }

    /// Streaming URL of an exec, attach or port-forward response.
    fn url(&mut self) -> Option<&mut String> {
        None
    }

    fn annotations(&self) -> Option<&HashMap<String, String>> {
        None
    }

    /// `(id, name)` of the image a response describes.
    fn described_image(&self) -> Option<(&str, Option<&str>)> {
        None
    }
}

/// Rewrite applied to objects read back from a backend runtime.
pub trait Prefixable {
    fn add_prefix(&mut self, _namespace: &Namespace) {}
}

/// A response carrying a list of objects.
pub trait ObjectList {
    type Item: Prefixable + Send;

    fn take_items(&mut self) -> Vec<Self::Item>;

    fn set_items(&mut self, items: Vec<Self::Item>);
}

/// Current value of an optional field, or an empty string.
pub fn value_of(field: Option<&mut String>) -> String {
    field.map(|value| value.clone()).unwrap_or_default()
}

pub fn set_field(field: Option<&mut String>, value: impl Into<String>) {
    if let Some(field) = field {
        *field = value.into();
    }
}
