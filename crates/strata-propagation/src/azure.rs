//! Azure credential propagation (CAPZ)
//!
//! Resolves the AzureCluster → AzureClusterIdentity → client-secret chain
//! and derives the `azure-cloud-provider` Secret that the Azure
//! cloud-controller-manager reads. The `cloud-config` JSON layout is parsed
//! rigidly by the CCM binary, so field names and constants are fixed.
//!
//! CAPZ API: infrastructure.cluster.x-k8s.io/v1beta1

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use strata_common::kube_utils::{api_resource_for_gvk, get_dynamic, get_secret, secret_string};
use strata_common::types::GvkRef;
use strata_common::{Error, Result, CLUSTER_SYSTEM_NAMESPACE};

use crate::{apply, PropagationConfig};

/// Provider name used in derivation errors
const PROVIDER: &str = "azure";

/// CAPZ infrastructure API group
const INFRA_GROUP: &str = "infrastructure.cluster.x-k8s.io";
/// CAPZ infrastructure API version
const INFRA_VERSION: &str = "v1beta1";

/// Name of the propagated Secret the Azure CCM mounts
pub const AZURE_CLOUD_PROVIDER_SECRET: &str = "azure-cloud-provider";
/// Data key holding the cloud-config JSON
pub const CLOUD_CONFIG_KEY: &str = "cloud-config";

/// Default Azure environment when the cluster spec omits one
const DEFAULT_AZURE_ENVIRONMENT: &str = "AzurePublicCloud";
/// Key in the identity's client-secret Secret holding the AAD secret
const CLIENT_SECRET_KEY: &str = "clientSecret";

/// Azure cloud-config document
///
/// Field order is the serialization order; the emitted JSON is byte-stable
/// across invocations.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AzureCloudConfig {
    cloud: String,
    tenant_id: String,
    subscription_id: String,
    aad_client_id: String,
    aad_client_secret: String,
    resource_group: String,
    security_group_name: String,
    security_group_resource_group: String,
    location: String,
    vm_type: String,
    vnet_name: String,
    vnet_resource_group: String,
    subnet_name: String,
    load_balancer_sku: String,
    load_balancer_name: String,
    maximum_load_balancer_rule_count: u32,
    use_managed_identity_extension: bool,
    use_instance_metadata: bool,
}

fn required_str<'a>(value: &'a Value, pointer: &str, what: &str) -> Result<&'a str> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::derivation(PROVIDER, format!("{} missing {}", what, pointer)))
}

/// Build the `azure-cloud-provider` payload Secret from already-fetched
/// objects
///
/// `cluster_spec` and `identity_spec` are the `spec` documents of the
/// AzureCluster and AzureClusterIdentity; `client_secret` is the AAD client
/// secret read from the identity's referenced Secret. Values come from the
/// first subnet/security-group entry of the cluster's network spec.
pub fn build_cloud_provider_secret(
    cluster_spec: &Value,
    identity_spec: &Value,
    client_secret: &str,
) -> Result<Value> {
    let resource_group = required_str(cluster_spec, "/resourceGroup", "cluster resource")?;
    let vnet_resource_group = cluster_spec
        .pointer("/networkSpec/vnet/resourceGroup")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(resource_group);

    let config = AzureCloudConfig {
        cloud: cluster_spec
            .pointer("/azureEnvironment")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_AZURE_ENVIRONMENT)
            .to_string(),
        tenant_id: required_str(identity_spec, "/tenantID", "cluster identity")?.to_string(),
        subscription_id: required_str(cluster_spec, "/subscriptionID", "cluster resource")?
            .to_string(),
        aad_client_id: required_str(identity_spec, "/clientID", "cluster identity")?.to_string(),
        aad_client_secret: client_secret.to_string(),
        resource_group: resource_group.to_string(),
        security_group_name: required_str(
            cluster_spec,
            "/networkSpec/subnets/0/securityGroup/name",
            "cluster resource",
        )?
        .to_string(),
        security_group_resource_group: vnet_resource_group.to_string(),
        location: required_str(cluster_spec, "/location", "cluster resource")?.to_string(),
        vm_type: "vmss".to_string(),
        vnet_name: required_str(cluster_spec, "/networkSpec/vnet/name", "cluster resource")?
            .to_string(),
        vnet_resource_group: vnet_resource_group.to_string(),
        subnet_name: required_str(
            cluster_spec,
            "/networkSpec/subnets/0/name",
            "cluster resource",
        )?
        .to_string(),
        load_balancer_sku: "Standard".to_string(),
        load_balancer_name: String::new(),
        maximum_load_balancer_rule_count: 250,
        use_managed_identity_extension: false,
        use_instance_metadata: true,
    };

    let cloud_config = serde_json::to_string(&config)
        .map_err(|e| Error::serialization(format!("azure cloud-config: {}", e)))?;

    Ok(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": AZURE_CLOUD_PROVIDER_SECRET,
            "namespace": CLUSTER_SYSTEM_NAMESPACE,
        },
        "type": "Opaque",
        "stringData": {
            CLOUD_CONFIG_KEY: cloud_config,
        }
    }))
}

/// Resolve the Azure identity chain and build the payload Secret
async fn resolve(cfg: &PropagationConfig) -> Result<Value> {
    let cluster_ar =
        api_resource_for_gvk(&GvkRef::new(INFRA_GROUP, INFRA_VERSION, "AzureCluster"));
    let cluster = get_dynamic(
        &cfg.client,
        &cluster_ar,
        &cfg.cluster_name,
        &cfg.cluster_namespace,
    )
    .await?;
    let cluster_spec = cluster.data.get("spec").cloned().unwrap_or(Value::Null);

    let identity_name = cluster_spec
        .pointer("/identityRef/name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::resolution(
                "AzureCluster",
                &cfg.cluster_name,
                &cfg.cluster_namespace,
                "spec.identityRef.name is empty",
            )
        })?;
    let identity_namespace = cluster_spec
        .pointer("/identityRef/namespace")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(&cfg.cluster_namespace);

    let identity_ar =
        api_resource_for_gvk(&GvkRef::new(INFRA_GROUP, INFRA_VERSION, "AzureClusterIdentity"));
    let identity = get_dynamic(&cfg.client, &identity_ar, identity_name, identity_namespace).await?;
    let identity_spec = identity.data.get("spec").cloned().unwrap_or(Value::Null);

    let secret_name = identity_spec
        .pointer("/clientSecret/name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::resolution(
                "AzureClusterIdentity",
                identity_name,
                identity_namespace,
                "spec.clientSecret.name is empty",
            )
        })?;
    let secret_namespace = identity_spec
        .pointer("/clientSecret/namespace")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(identity_namespace);

    let secret = get_secret(&cfg.client, secret_name, secret_namespace).await?;
    let client_secret = secret_string(&secret, CLIENT_SECRET_KEY)?;

    debug!(
        cluster = %cfg.cluster_name,
        identity = %identity_name,
        "resolved azure identity chain"
    );

    build_cloud_provider_secret(&cluster_spec, &identity_spec, &client_secret)
}

/// Propagate Azure CCM credentials into the managed cluster
///
/// Called by the reconciliation controller once per reconcile pass. The full
/// identity chain must resolve before any payload is applied.
pub async fn propagate_azure_secrets(cfg: &PropagationConfig) -> Result<()> {
    let payload = resolve(cfg).await?;
    apply::apply_to_managed_cluster(cfg, &[payload]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_spec() -> Value {
        json!({
            "azureEnvironment": "AzurePublicCloud",
            "subscriptionID": "sub1",
            "resourceGroup": "rg1",
            "location": "eastus",
            "identityRef": {"name": "ident", "namespace": "default", "kind": "AzureClusterIdentity"},
            "networkSpec": {
                "vnet": {"name": "vnet1", "resourceGroup": "rg1"},
                "subnets": [
                    {"name": "sn1", "securityGroup": {"name": "sg1"}}
                ]
            }
        })
    }

    fn identity_spec() -> Value {
        json!({
            "tenantID": "t1",
            "clientID": "c1",
            "clientSecret": {"name": "creds", "namespace": "default"}
        })
    }

    #[test]
    fn cloud_config_matches_ccm_layout_exactly() {
        let payload =
            build_cloud_provider_secret(&cluster_spec(), &identity_spec(), "s1").unwrap();

        assert_eq!(payload["kind"], "Secret");
        assert_eq!(payload["metadata"]["name"], AZURE_CLOUD_PROVIDER_SECRET);
        assert_eq!(payload["metadata"]["namespace"], "kube-system");

        let rendered = payload["stringData"][CLOUD_CONFIG_KEY].as_str().unwrap();
        let parsed: Value = serde_json::from_str(rendered).unwrap();
        assert_eq!(
            parsed,
            json!({
                "cloud": "AzurePublicCloud",
                "tenantId": "t1",
                "subscriptionId": "sub1",
                "aadClientId": "c1",
                "aadClientSecret": "s1",
                "resourceGroup": "rg1",
                "securityGroupName": "sg1",
                "securityGroupResourceGroup": "rg1",
                "location": "eastus",
                "vmType": "vmss",
                "vnetName": "vnet1",
                "vnetResourceGroup": "rg1",
                "subnetName": "sn1",
                "loadBalancerSku": "Standard",
                "loadBalancerName": "",
                "maximumLoadBalancerRuleCount": 250,
                "useManagedIdentityExtension": false,
                "useInstanceMetadata": true
            })
        );
    }

    #[test]
    fn cloud_config_field_order_is_stable() {
        let rendered = |p: &Value| {
            p["stringData"][CLOUD_CONFIG_KEY]
                .as_str()
                .unwrap()
                .to_string()
        };
        let a = build_cloud_provider_secret(&cluster_spec(), &identity_spec(), "s1").unwrap();
        let b = build_cloud_provider_secret(&cluster_spec(), &identity_spec(), "s1").unwrap();
        assert_eq!(rendered(&a), rendered(&b));
        // Declaration order, starting with the environment
        assert!(rendered(&a).starts_with("{\"cloud\":\"AzurePublicCloud\""));
    }

    #[test]
    fn environment_defaults_to_public_cloud() {
        let mut spec = cluster_spec();
        spec.as_object_mut().unwrap().remove("azureEnvironment");
        let payload = build_cloud_provider_secret(&spec, &identity_spec(), "s1").unwrap();
        let parsed: Value =
            serde_json::from_str(payload["stringData"][CLOUD_CONFIG_KEY].as_str().unwrap())
                .unwrap();
        assert_eq!(parsed["cloud"], "AzurePublicCloud");
    }

    #[test]
    fn vnet_resource_group_falls_back_to_cluster_group() {
        let mut spec = cluster_spec();
        spec["networkSpec"]["vnet"]
            .as_object_mut()
            .unwrap()
            .remove("resourceGroup");
        let payload = build_cloud_provider_secret(&spec, &identity_spec(), "s1").unwrap();
        let parsed: Value =
            serde_json::from_str(payload["stringData"][CLOUD_CONFIG_KEY].as_str().unwrap())
                .unwrap();
        assert_eq!(parsed["vnetResourceGroup"], "rg1");
        assert_eq!(parsed["securityGroupResourceGroup"], "rg1");
    }

    #[test]
    fn missing_subnet_is_a_derivation_error() {
        let mut spec = cluster_spec();
        spec["networkSpec"]["subnets"] = json!([]);
        let err =
            build_cloud_provider_secret(&spec, &identity_spec(), "s1").unwrap_err();
        assert!(matches!(err, Error::Derivation { .. }));
        assert!(err.to_string().contains("subnets"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_tenant_id_is_a_derivation_error() {
        let mut identity = identity_spec();
        identity.as_object_mut().unwrap().remove("tenantID");
        let err = build_cloud_provider_secret(&cluster_spec(), &identity, "s1").unwrap_err();
        assert!(err.to_string().contains("tenantID"));
    }
}
