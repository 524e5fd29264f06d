//! CRI protocol revisions and method paths.

use std::fmt;

pub const RUNTIME_SERVICE: &str = "RuntimeService";
pub const IMAGE_SERVICE: &str = "ImageService";

/// Message schema shared by one or more revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Schema {
    /// Host namespaces as booleans, no runtime handlers.
    Legacy,
    Current,
}

/// A CRI protocol revision, identified by its protobuf package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Revision {
    V1Alpha1,
    V1Alpha2,
    V1,
}

/// How a request of one revision reaches a runtime speaking another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    Native,
    Upgrade,
    Incompatible,
}

impl Revision {
    pub const ALL: [Revision; 3] = [Revision::V1Alpha1, Revision::V1Alpha2, Revision::V1];

    /// Order in which a newly connected runtime is probed.
    pub const PROBE_ORDER: [Revision; 3] = [Revision::V1, Revision::V1Alpha2, Revision::V1Alpha1];

    pub fn package(self) -> &'static str {
        match self {
            Revision::V1Alpha1 => "runtime",
            Revision::V1Alpha2 => "runtime.v1alpha2",
            Revision::V1 => "runtime.v1",
        }
    }

    pub fn schema(self) -> Schema {
        match self {
            Revision::V1Alpha1 => Schema::Legacy,
            Revision::V1Alpha2 | Revision::V1 => Schema::Current,
        }
    }

    pub fn from_package(package: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.package() == package)
    }

    /// `/{package}.{service}/{method}`
    pub fn method_path(self, service: &str, method: &str) -> String {
        format!("/{}.{}/{}", self.package(), service, method)
    }

    pub fn translation_to(self, backend: Revision) -> Translation {
        match (self.schema(), backend.schema()) {
            (a, b) if a == b => Translation::Native,
            (Schema::Legacy, Schema::Current) => Translation::Upgrade,
            _ => Translation::Incompatible,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Revision::V1Alpha1 => "v1alpha1",
            Revision::V1Alpha2 => "v1alpha2",
            Revision::V1 => "v1",
        };
        f.write_str(name)
    }
}

/// Splits `/{package}.{service}/{method}` into its parts.
pub fn split_path(path: &str) -> Option<(Revision, &str, &str)> {
    let (qualified, method) = path.strip_prefix('/')?.split_once('/')?;
    let (package, service) = qualified.rsplit_once('.')?;
    Some((Revision::from_package(package)?, service, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_path_round_trip() {
        for revision in Revision::ALL {
            let path = revision.method_path(IMAGE_SERVICE, "PullImage");
            assert_eq!(split_path(&path), Some((revision, IMAGE_SERVICE, "PullImage")));
        }
        assert_eq!(
            Revision::V1Alpha1.method_path(RUNTIME_SERVICE, "Version"),
            "/runtime.RuntimeService/Version"
        );
    }

    #[test]
    fn test_split_rejects_unknown_packages() {
        assert_eq!(split_path("/runtime.v2.RuntimeService/Version"), None);
        assert_eq!(split_path("runtime.RuntimeService/Version"), None);
        assert_eq!(split_path("/RuntimeService/Version"), None);
    }

    #[test]
    fn test_translation() {
        use Revision::*;
        assert_eq!(V1Alpha1.translation_to(V1Alpha1), Translation::Native);
        assert_eq!(V1Alpha2.translation_to(V1), Translation::Native);
        assert_eq!(V1.translation_to(V1Alpha2), Translation::Native);
        assert_eq!(V1Alpha1.translation_to(V1), Translation::Upgrade);
        assert_eq!(V1Alpha1.translation_to(V1Alpha2), Translation::Upgrade);
        assert_eq!(V1.translation_to(V1Alpha1), Translation::Incompatible);
    }
}
