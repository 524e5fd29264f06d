//! CRI message types for every supported protocol revision.
//!
//! `v1alpha2` and `v1` share the [`current`] schema. `v1alpha1` (the bare
//! `runtime` package) differs in a handful of messages, defined in
//! [`legacy`] together with their conversion to the current schema.

use std::fmt::Debug;

pub mod capability;
pub mod current;
pub mod legacy;
pub mod revision;

pub use capability::{Capabilities, ObjectList, Prefixable};
pub use revision::{split_path, Revision, Schema, Translation, IMAGE_SERVICE, RUNTIME_SERVICE};

/// A request or response message of one schema.
///
/// `Upgraded` is the same message in the current schema. For current
/// messages it is the type itself and both conversions are the identity.
pub trait CriMessage:
    prost::Message + Default + Clone + Capabilities + Prefixable + Send + Sync + 'static
{
    type Upgraded: prost::Message + Default + Debug + Send + 'static;

    fn upgrade(self) -> Self::Upgraded;

    fn downgrade(upgraded: Self::Upgraded) -> Self;
}
