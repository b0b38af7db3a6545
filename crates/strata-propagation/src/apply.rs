//! Cross-cluster apply engine
//!
//! Builds an independent client for the managed cluster from its stored
//! kubeconfig and server-side-applies already-constructed payload objects
//! into it. Apply must be a patch, not create-or-update: payload objects
//! like `azure-cloud-provider` may already be field-managed by the cluster's
//! own bootstrap, and SSA merges ownership instead of clobbering it.

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

use strata_common::kube_utils::{build_api_resource, client_from_kubeconfig, get_secret, secret_bytes};
use strata_common::{Error, Result, FIELD_OWNER, KUBECONFIG_SECRET_KEY};

use crate::PropagationConfig;

/// Target coordinates extracted from a payload document
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ObjectCoordinates {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

/// Extract apiVersion/kind/name/namespace from a payload document
///
/// Every payload is fully constructed before it reaches the apply engine, so
/// a missing field here is a wrapped apply error, not a skip.
pub(crate) fn object_coordinates(value: &Value) -> Result<ObjectCoordinates> {
    let kind = value
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::apply_for("<unknown>", "<unknown>", "payload missing kind"))?
        .to_string();
    let name = value
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::apply_for(&kind, "<unknown>", "payload missing metadata.name"))?
        .to_string();
    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::apply_for(&kind, &name, "payload missing apiVersion"))?
        .to_string();
    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(ObjectCoordinates {
        api_version,
        kind,
        name,
        namespace,
    })
}

/// Apply one payload document into the target cluster via server-side apply
async fn apply_object(target: &Client, value: &Value) -> Result<()> {
    let coords = object_coordinates(value)?;
    let ar = build_api_resource(&coords.api_version, &coords.kind);

    let api: Api<DynamicObject> = match coords.namespace.as_deref() {
        Some(ns) => Api::namespaced_with(target.clone(), ns, &ar),
        None => Api::all_with(target.clone(), &ar),
    };

    debug!(kind = %coords.kind, name = %coords.name, namespace = ?coords.namespace, "applying payload object");

    api.patch(
        &coords.name,
        &PatchParams::apply(FIELD_OWNER).force(),
        &Patch::Apply(value),
    )
    .await
    .map_err(|e| Error::apply_for(&coords.kind, &coords.name, e.to_string()))?;

    Ok(())
}

/// Apply payload objects into the managed cluster
///
/// Reads the kubeconfig from the configured Secret (fixed `value` key),
/// builds a client scoped to the target cluster, and applies each object in
/// production order. The first failure aborts the remaining objects in the
/// batch; already-applied objects stay applied, and the idempotent
/// re-invocation on the next reconcile converges them.
pub async fn apply_to_managed_cluster(
    cfg: &PropagationConfig,
    objects: &[Value],
) -> Result<()> {
    if objects.is_empty() {
        debug!(cluster = %cfg.cluster_name, "no payload objects to apply");
        return Ok(());
    }

    let secret = get_secret(
        &cfg.client,
        &cfg.kubeconfig_secret.name,
        &cfg.kubeconfig_secret.namespace,
    )
    .await?;
    let kubeconfig = secret_bytes(&secret, KUBECONFIG_SECRET_KEY)?;
    let target = client_from_kubeconfig(&kubeconfig).await?;

    for object in objects {
        apply_object(&target, object).await?;
    }

    info!(
        cluster = %cfg.cluster_name,
        count = objects.len(),
        "propagated credential objects into managed cluster"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coordinates_extracted_from_payload() {
        let value = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "azure-cloud-provider", "namespace": "kube-system"},
            "stringData": {"cloud-config": "{}"}
        });
        let coords = object_coordinates(&value).unwrap();
        assert_eq!(coords.kind, "Secret");
        assert_eq!(coords.name, "azure-cloud-provider");
        assert_eq!(coords.namespace.as_deref(), Some("kube-system"));
        assert_eq!(coords.api_version, "v1");
    }

    #[test]
    fn missing_kind_is_an_apply_error() {
        let value = json!({
            "apiVersion": "v1",
            "metadata": {"name": "x"}
        });
        let err = object_coordinates(&value).unwrap_err();
        assert!(matches!(err, Error::Apply { .. }));
        assert!(err.to_string().contains("missing kind"));
    }

    #[test]
    fn missing_name_names_the_kind() {
        let value = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {}
        });
        let err = object_coordinates(&value).unwrap_err();
        assert!(err.to_string().contains("ConfigMap"));
        assert!(err.to_string().contains("missing metadata.name"));
    }

    #[test]
    fn missing_api_version_names_kind_and_name() {
        let value = json!({
            "kind": "Secret",
            "metadata": {"name": "cloud-config"}
        });
        let err = object_coordinates(&value).unwrap_err();
        assert!(err.to_string().contains("Secret/cloud-config"));
        assert!(err.to_string().contains("missing apiVersion"));
    }

    #[test]
    fn cluster_scoped_payload_has_no_namespace() {
        let value = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "kube-system"}
        });
        let coords = object_coordinates(&value).unwrap();
        assert_eq!(coords.namespace, None);
    }
}
