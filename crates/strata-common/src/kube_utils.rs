//! Shared Kubernetes utilities using kube-rs
//!
//! Dynamic (untyped) resource access for walking provider reference chains,
//! plus client construction from kubeconfig bytes for reaching managed
//! clusters.

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject};
use kube::config::KubeConfigOptions;
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::debug;

use crate::types::GvkRef;
use crate::{Error, Result};

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use strata_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("infrastructure.cluster.x-k8s.io/v1beta1");
/// assert_eq!(group, "infrastructure.cluster.x-k8s.io");
/// assert_eq!(version, "v1beta1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Known resource pluralizations for the kinds this subsystem touches
const KIND_PLURALS: &[(&str, &str)] = &[
    // Core CAPI types
    ("cluster", "clusters"),
    ("machine", "machines"),
    ("machinedeployment", "machinedeployments"),
    // AWS provider
    ("awscluster", "awsclusters"),
    ("awsclusterstaticidentity", "awsclusterstaticidentities"),
    ("awsclusterroleidentity", "awsclusterroleidentities"),
    // Azure provider
    ("azurecluster", "azureclusters"),
    ("azureclusteridentity", "azureclusteridentities"),
    ("azuremachine", "azuremachines"),
    // OpenStack provider
    ("openstackcluster", "openstackclusters"),
    ("openstackmachine", "openstackmachines"),
    // vSphere provider
    ("vspherecluster", "vsphereclusters"),
    ("vsphereclusteridentity", "vsphereclusteridentities"),
    ("vspheremachine", "vspheremachines"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for known provider types, falling back to simple
/// pluralization rules for kinds registered from definition files.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource from a known apiVersion and kind
///
/// The version you provide is used exactly; payload documents carry explicit
/// apiVersions, so no discovery round trip is needed.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Build an ApiResource from a GVK reference
pub fn api_resource_for_gvk(gvk: &GvkRef) -> ApiResource {
    ApiResource {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        kind: gvk.kind.clone(),
        api_version: gvk.api_version(),
        plural: pluralize_kind(&gvk.kind),
    }
}

/// Fetch a namespaced dynamic object, wrapping failures with the object's
/// kind/name/namespace for operator diagnosis
pub async fn get_dynamic(
    client: &Client,
    ar: &ApiResource,
    name: &str,
    namespace: &str,
) -> Result<DynamicObject> {
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, ar);
    match api.get(name).await {
        Ok(obj) => {
            debug!(kind = %ar.kind, name = %name, namespace = %namespace, "fetched object");
            Ok(obj)
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::resolution(
            &ar.kind,
            name,
            namespace,
            "object not found",
        )),
        Err(e) => Err(Error::resolution(&ar.kind, name, namespace, e.to_string())),
    }
}

/// Fetch a cluster-scoped dynamic object with the same error wrapping
pub async fn get_dynamic_cluster_scoped(
    client: &Client,
    ar: &ApiResource,
    name: &str,
) -> Result<DynamicObject> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), ar);
    match api.get(name).await {
        Ok(obj) => Ok(obj),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            Err(Error::resolution(&ar.kind, name, "", "object not found"))
        }
        Err(e) => Err(Error::resolution(&ar.kind, name, "", e.to_string())),
    }
}

/// Fetch a Secret, wrapping failures with its coordinates
pub async fn get_secret(client: &Client, name: &str, namespace: &str) -> Result<Secret> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    match secrets.get(name).await {
        Ok(secret) => Ok(secret),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            Err(Error::resolution("Secret", name, namespace, "object not found"))
        }
        Err(e) => Err(Error::resolution("Secret", name, namespace, e.to_string())),
    }
}

/// Extract a data value from an already-fetched Secret as raw bytes
///
/// Checks `data` (base64-decoded by the API machinery) first, then
/// `stringData`.
pub fn secret_bytes(secret: &Secret, key: &str) -> Result<Vec<u8>> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Ok(bytes.0.clone());
    }
    if let Some(s) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Ok(s.clone().into_bytes());
    }
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
    Err(Error::resolution(
        "Secret",
        name,
        namespace,
        format!("missing key {:?}", key),
    ))
}

/// Extract a data value from an already-fetched Secret as UTF-8 text
pub fn secret_string(secret: &Secret, key: &str) -> Result<String> {
    let bytes = secret_bytes(secret, key)?;
    String::from_utf8(bytes).map_err(|e| {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        Error::resolution(
            "Secret",
            name,
            namespace,
            format!("key {:?} is not valid UTF-8: {}", key, e),
        )
    })
}

/// Create a kube Client from serialized kubeconfig bytes
///
/// Used to reach a managed cluster whose kubeconfig is stored in a Secret on
/// the management cluster. The client lives for one propagation attempt.
pub async fn client_from_kubeconfig(kubeconfig_data: &[u8]) -> Result<Client> {
    let kubeconfig_str = std::str::from_utf8(kubeconfig_data)
        .map_err(|e| Error::kubeconfig(format!("invalid kubeconfig UTF-8: {e}")))?;

    let kubeconfig: kube::config::Kubeconfig = serde_yaml::from_str(kubeconfig_str)
        .map_err(|e| Error::kubeconfig(format!("invalid kubeconfig YAML: {e}")))?;

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::kubeconfig(format!("failed to build config: {e}")))?;

    Client::try_from(config)
        .map_err(|e| Error::kubeconfig(format!("failed to create client: {e}")))
}

/// Strip cluster-specific metadata from an object document before applying
/// it to a different cluster
///
/// Removes fields that would cause server-side apply to fail on a target
/// cluster: `uid`, `resourceVersion`, `creationTimestamp`, `managedFields`,
/// `generation`. Server-populated `status` is dropped too.
pub fn strip_export_metadata(value: &mut serde_json::Value) {
    if let Some(meta) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("uid");
        meta.remove("resourceVersion");
        meta.remove("creationTimestamp");
        meta.remove("managedFields");
        meta.remove("generation");
        meta.remove("ownerReferences");
    }
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_api_version_splits_group() {
        assert_eq!(
            parse_api_version("apps/v1"),
            ("apps".to_string(), "v1".to_string())
        );
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn pluralize_known_provider_kinds() {
        assert_eq!(pluralize_kind("AzureCluster"), "azureclusters");
        assert_eq!(pluralize_kind("AzureClusterIdentity"), "azureclusteridentities");
        assert_eq!(pluralize_kind("VSphereMachine"), "vspheremachines");
    }

    #[test]
    fn pluralize_fallback_rules() {
        assert_eq!(pluralize_kind("Gateway"), "gateways");
        assert_eq!(pluralize_kind("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
    }

    #[test]
    fn build_api_resource_core_group() {
        let ar = build_api_resource("v1", "Secret");
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "secrets");
        assert_eq!(ar.api_version, "v1");
    }

    #[test]
    fn api_resource_for_gvk_builds_api_version() {
        let gvk = GvkRef::new("infrastructure.cluster.x-k8s.io", "v1beta1", "VSphereCluster");
        let ar = api_resource_for_gvk(&gvk);
        assert_eq!(ar.api_version, "infrastructure.cluster.x-k8s.io/v1beta1");
        assert_eq!(ar.plural, "vsphereclusters");
    }

    #[test]
    fn secret_bytes_reads_data_then_string_data() {
        let mut secret = Secret::default();
        secret.string_data = Some(
            [("clouds.yaml".to_string(), "clouds: {}".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(secret_bytes(&secret, "clouds.yaml").unwrap(), b"clouds: {}");

        let err = secret_bytes(&secret, "missing").unwrap_err();
        assert!(err.to_string().contains("missing key"));
    }

    #[test]
    fn secret_string_rejects_invalid_utf8() {
        let mut secret = Secret::default();
        secret.data = Some(
            [(
                "blob".to_string(),
                k8s_openapi::ByteString(vec![0xff, 0xfe]),
            )]
            .into_iter()
            .collect(),
        );
        let err = secret_string(&secret, "blob").unwrap_err();
        assert!(err.to_string().contains("not valid UTF-8"));
    }

    #[tokio::test]
    async fn client_from_kubeconfig_rejects_garbage() {
        let err = match client_from_kubeconfig(b"not valid yaml {{{{").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Kubeconfig { .. }));
    }

    #[test]
    fn strip_export_metadata_prunes_source_fields() {
        let mut v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "kube-system",
                "uid": "abc",
                "resourceVersion": "123",
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "managedFields": [{}],
                "generation": 4
            },
            "status": {"observed": true},
            "data": {"k": "v"}
        });
        strip_export_metadata(&mut v);
        let meta = v["metadata"].as_object().unwrap();
        assert!(meta.contains_key("name"));
        assert!(meta.contains_key("namespace"));
        assert!(!meta.contains_key("uid"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("managedFields"));
        assert!(v.get("status").is_none());
        assert_eq!(v["data"]["k"], "v");
    }
}
