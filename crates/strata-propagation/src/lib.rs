//! Credential propagation for managed workload clusters
//!
//! This crate resolves a provider's identity chain on the management
//! cluster (cluster resource → identity resource → credential secret →
//! auxiliaries), derives the exact Secret/ConfigMap payloads that the
//! cloud-controller-manager and CSI integrations in the workload cluster
//! expect, and server-side-applies them into that cluster through a client
//! built from its stored kubeconfig.
//!
//! Built-in providers (Azure, OpenStack, vSphere) are compiled in; further
//! providers can be registered declaratively from definition files carrying
//! an embedded Lua script that enumerates the objects to propagate.

pub mod apply;
pub mod azure;
pub mod lua;
pub mod openstack;
pub mod registry;
pub mod vsphere;

use kube::Client;
use strata_common::types::SecretRef;

pub use azure::propagate_azure_secrets;
pub use lua::propagate_provider_objects;
pub use openstack::propagate_openstack_secrets;
pub use registry::{BuiltinProvider, PropagationMethod, ProviderDescriptor, ProviderRegistry};
pub use vsphere::propagate_vsphere_secrets;

/// Per-invocation context for one credential propagation attempt
///
/// Owned by the reconciliation controller; constructed per reconcile pass
/// and never persisted. The client is bound to the management (source)
/// cluster; the apply engine builds its own client for the target.
#[derive(Clone)]
pub struct PropagationConfig {
    /// Client for the management cluster holding the source objects
    pub client: Client,
    /// Name of the managed cluster's resources (cluster resource, machines)
    pub cluster_name: String,
    /// Namespace the managed cluster's resources live in
    pub cluster_namespace: String,
    /// Secret holding the managed cluster's serialized kubeconfig under the
    /// `value` key
    pub kubeconfig_secret: SecretRef,
    /// Management-side namespace holding shared provider identity material
    pub system_namespace: String,
}

impl PropagationConfig {
    /// Create a config for a cluster whose kubeconfig Secret follows the
    /// Cluster API `<name>-kubeconfig` convention in the cluster namespace
    pub fn for_cluster(
        client: Client,
        cluster_name: impl Into<String>,
        cluster_namespace: impl Into<String>,
        system_namespace: impl Into<String>,
    ) -> Self {
        let cluster_name = cluster_name.into();
        let cluster_namespace = cluster_namespace.into();
        let kubeconfig_secret = SecretRef::new(
            format!("{}-kubeconfig", cluster_name),
            cluster_namespace.clone(),
        );
        Self {
            client,
            cluster_name,
            cluster_namespace,
            kubeconfig_secret,
            system_namespace: system_namespace.into(),
        }
    }
}
