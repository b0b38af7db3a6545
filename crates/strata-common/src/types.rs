//! Shared reference types used across the propagation pipeline

use serde::{Deserialize, Serialize};

/// Reference to a Kubernetes Secret by name and namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

impl SecretRef {
    /// Create a new secret reference
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

/// A group/version/kind triple identifying a Kubernetes resource type
///
/// Serialized form matches the declarative provider definition files
/// (`clusterGVK: {group, version, kind}`).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GvkRef {
    /// API group; empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version (e.g., "v1beta1")
    pub version: String,
    /// Resource kind (e.g., "AzureCluster")
    pub kind: String,
}

impl GvkRef {
    /// Create a new GVK reference
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Full apiVersion string ("group/version", or "version" for core)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}
