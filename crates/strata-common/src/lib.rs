//! Common types for Strata: errors, Kubernetes utilities, and shared refs

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod types;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for Strata system resources on the management cluster
/// (shared provider identities, operator state)
pub const STRATA_SYSTEM_NAMESPACE: &str = "strata-system";

/// Namespace in the managed cluster that receives propagated credential
/// objects. CCM and CSI deployments mount them from here.
pub const CLUSTER_SYSTEM_NAMESPACE: &str = "kube-system";

/// Field manager used for every server-side apply issued by Strata
pub const FIELD_OWNER: &str = "strata-controller";

/// Data key under which a managed cluster's kubeconfig Secret stores the
/// serialized kubeconfig (Cluster API convention)
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Label selector key associating machines with their owning cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
