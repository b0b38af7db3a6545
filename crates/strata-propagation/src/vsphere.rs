//! vSphere credential propagation (CAPV)
//!
//! Resolves the VSphereCluster → identity → credential Secret chain and
//! derives the three payload objects the vSphere CPI/CSI stack expects: the
//! `vsphere-cloud-secret` credential Secret, the `cloud-config` ConfigMap
//! holding the CPI YAML document, and the `vcenter-config-secret` holding
//! the CSI INI config. The datacenter is discovered from one machine
//! belonging to the cluster.
//!
//! CAPV API: infrastructure.cluster.x-k8s.io/v1beta1

use std::collections::BTreeMap;

use kube::api::{Api, DynamicObject, ListParams};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use strata_common::kube_utils::{
    api_resource_for_gvk, get_dynamic, get_dynamic_cluster_scoped, get_secret, secret_string,
};
use strata_common::types::GvkRef;
use strata_common::{Error, Result, CLUSTER_NAME_LABEL, CLUSTER_SYSTEM_NAMESPACE};

use crate::{apply, PropagationConfig};

/// Provider name used in derivation errors
const PROVIDER: &str = "vsphere";

/// CAPV infrastructure API group
const INFRA_GROUP: &str = "infrastructure.cluster.x-k8s.io";
/// CAPV infrastructure API version
const INFRA_VERSION: &str = "v1beta1";

/// Name of the propagated credential Secret the CPI mounts
pub const VSPHERE_CLOUD_SECRET: &str = "vsphere-cloud-secret";
/// Name of the propagated ConfigMap holding the CPI cloud-config
pub const VSPHERE_CLOUD_CONFIG_MAP: &str = "cloud-config";
/// Data key of the CPI cloud-config document
pub const CLOUD_CONFIG_KEY: &str = "cloud-config";
/// Name of the propagated Secret holding the CSI config
pub const VSPHERE_CSI_SECRET: &str = "vcenter-config-secret";
/// Data key of the CSI config document
pub const CSI_CONFIG_KEY: &str = "csi-vsphere.conf";

/// Region topology label advertised to the CPI
const REGION_LABEL: &str = "k8s-region";
/// Zone topology label advertised to the CPI
const ZONE_LABEL: &str = "k8s-zone";

/// CSI config template; the CSI driver parses this INI rigidly
const CSI_CONFIG_TEMPLATE: &str = r#"[Global]
cluster-id = "{{ cluster_id }}"

[VirtualCenter "{{ server }}"]
insecure-flag = "true"
user = "{{ username }}"
password = "{{ password }}"
port = "443"
datacenters = "{{ datacenter }}"
"#;

/// Resolved vSphere credential material
#[derive(Debug, Clone)]
pub struct VSphereCredentials {
    /// vCenter server host
    pub server: String,
    /// vCenter user
    pub username: String,
    /// vCenter password
    pub password: String,
    /// Datacenter discovered from the cluster's machines
    pub datacenter: String,
}

/// CPI cloud-config document
#[derive(Serialize)]
struct CloudConfig {
    global: GlobalConfig,
    vcenter: BTreeMap<String, VCenterConfig>,
    labels: LabelsConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GlobalConfig {
    port: u16,
    insecure_flag: bool,
    secret_name: String,
    secret_namespace: String,
}

#[derive(Serialize)]
struct VCenterConfig {
    server: String,
    datacenters: Vec<String>,
}

#[derive(Serialize)]
struct LabelsConfig {
    region: String,
    zone: String,
}

/// Build the `vsphere-cloud-secret` payload
///
/// The CPI looks up credentials by `"<server>.username"` /
/// `"<server>.password"` keys.
pub fn build_cloud_secret(creds: &VSphereCredentials) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": VSPHERE_CLOUD_SECRET,
            "namespace": CLUSTER_SYSTEM_NAMESPACE,
        },
        "type": "Opaque",
        "stringData": {
            (format!("{}.username", creds.server)): creds.username,
            (format!("{}.password", creds.server)): creds.password,
        }
    })
}

/// Build the `cloud-config` ConfigMap payload holding the CPI YAML document
pub fn build_cloud_config_map(creds: &VSphereCredentials) -> Result<Value> {
    let mut vcenter = BTreeMap::new();
    vcenter.insert(
        creds.server.clone(),
        VCenterConfig {
            server: creds.server.clone(),
            datacenters: vec![creds.datacenter.clone()],
        },
    );

    let config = CloudConfig {
        global: GlobalConfig {
            port: 443,
            insecure_flag: true,
            secret_name: VSPHERE_CLOUD_SECRET.to_string(),
            secret_namespace: CLUSTER_SYSTEM_NAMESPACE.to_string(),
        },
        vcenter,
        labels: LabelsConfig {
            region: REGION_LABEL.to_string(),
            zone: ZONE_LABEL.to_string(),
        },
    };

    let rendered = serde_yaml::to_string(&config)
        .map_err(|e| Error::serialization(format!("vsphere cloud-config: {}", e)))?;

    Ok(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": VSPHERE_CLOUD_CONFIG_MAP,
            "namespace": CLUSTER_SYSTEM_NAMESPACE,
        },
        "data": {
            CLOUD_CONFIG_KEY: rendered,
        }
    }))
}

/// Render the CSI config INI from the resolved credentials
pub fn render_csi_config(cluster_id: &str, creds: &VSphereCredentials) -> Result<String> {
    let mut env = minijinja::Environment::new();
    env.add_template("csi", CSI_CONFIG_TEMPLATE)
        .map_err(|e| Error::derivation(PROVIDER, format!("invalid CSI template: {}", e)))?;

    let ctx = minijinja::context! {
        cluster_id => cluster_id,
        server => creds.server,
        username => creds.username,
        password => creds.password,
        datacenter => creds.datacenter,
    };

    env.get_template("csi")
        .map_err(|e| Error::derivation(PROVIDER, format!("CSI template missing: {}", e)))?
        .render(ctx)
        .map_err(|e| Error::derivation(PROVIDER, format!("CSI config rendering failed: {}", e)))
}

/// Build the `vcenter-config-secret` payload holding the CSI config
pub fn build_csi_secret(cluster_id: &str, creds: &VSphereCredentials) -> Result<Value> {
    let rendered = render_csi_config(cluster_id, creds)?;
    Ok(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": VSPHERE_CSI_SECRET,
            "namespace": CLUSTER_SYSTEM_NAMESPACE,
        },
        "type": "Opaque",
        "stringData": {
            CSI_CONFIG_KEY: rendered,
        }
    }))
}

/// Discover the datacenter from one machine belonging to the cluster
///
/// First-listed, label-selected, limit-1: this is a heuristic. If machines
/// span datacenters the pick is arbitrary and nothing detects the
/// divergence.
async fn discover_datacenter(cfg: &PropagationConfig) -> Result<String> {
    let machine_ar =
        api_resource_for_gvk(&GvkRef::new(INFRA_GROUP, INFRA_VERSION, "VSphereMachine"));
    let api: Api<DynamicObject> =
        Api::namespaced_with(cfg.client.clone(), &cfg.cluster_namespace, &machine_ar);

    let params = ListParams::default()
        .labels(&format!("{}={}", CLUSTER_NAME_LABEL, cfg.cluster_name))
        .limit(1);
    let machines = api.list(&params).await.map_err(|e| {
        Error::resolution(
            "VSphereMachine",
            &cfg.cluster_name,
            &cfg.cluster_namespace,
            format!("listing machines failed: {}", e),
        )
    })?;

    let machine = machines.items.first().ok_or_else(|| {
        Error::resolution(
            "VSphereMachine",
            &cfg.cluster_name,
            &cfg.cluster_namespace,
            "no machines found for cluster",
        )
    })?;

    machine
        .data
        .pointer("/spec/datacenter")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            Error::resolution(
                "VSphereMachine",
                machine.metadata.name.as_deref().unwrap_or_default(),
                &cfg.cluster_namespace,
                "spec.datacenter is empty",
            )
        })
}

/// Resolve the vSphere identity chain and build the payload objects
async fn resolve(cfg: &PropagationConfig) -> Result<Vec<Value>> {
    let cluster_ar =
        api_resource_for_gvk(&GvkRef::new(INFRA_GROUP, INFRA_VERSION, "VSphereCluster"));
    let cluster = get_dynamic(
        &cfg.client,
        &cluster_ar,
        &cfg.cluster_name,
        &cfg.cluster_namespace,
    )
    .await?;
    let spec = cluster.data.get("spec").cloned().unwrap_or(Value::Null);

    let server = spec
        .pointer("/server")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::resolution(
                "VSphereCluster",
                &cfg.cluster_name,
                &cfg.cluster_namespace,
                "spec.server is empty",
            )
        })?
        .to_string();

    let identity_kind = spec
        .pointer("/identityRef/kind")
        .and_then(|v| v.as_str())
        .unwrap_or("Secret");
    let identity_name = spec
        .pointer("/identityRef/name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::resolution(
                "VSphereCluster",
                &cfg.cluster_name,
                &cfg.cluster_namespace,
                "spec.identityRef.name is empty",
            )
        })?;

    let secret = match identity_kind {
        "Secret" => get_secret(&cfg.client, identity_name, &cfg.cluster_namespace).await?,
        "VSphereClusterIdentity" => {
            // Cluster-scoped identity whose backing secret lives in the
            // management system namespace
            let identity_ar = api_resource_for_gvk(&GvkRef::new(
                INFRA_GROUP,
                INFRA_VERSION,
                "VSphereClusterIdentity",
            ));
            let identity =
                get_dynamic_cluster_scoped(&cfg.client, &identity_ar, identity_name).await?;
            let secret_name = identity
                .data
                .pointer("/spec/secretName")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    Error::resolution(
                        "VSphereClusterIdentity",
                        identity_name,
                        "",
                        "spec.secretName is empty",
                    )
                })?;
            get_secret(&cfg.client, secret_name, &cfg.system_namespace).await?
        }
        other => {
            return Err(Error::resolution(
                "VSphereCluster",
                &cfg.cluster_name,
                &cfg.cluster_namespace,
                format!("unsupported identityRef kind {:?}", other),
            ))
        }
    };

    let username = secret_string(&secret, "username")?;
    let password = secret_string(&secret, "password")?;
    let datacenter = discover_datacenter(cfg).await?;

    debug!(
        cluster = %cfg.cluster_name,
        server = %server,
        datacenter = %datacenter,
        "resolved vsphere identity chain"
    );

    let creds = VSphereCredentials {
        server,
        username,
        password,
        datacenter,
    };
    let cluster_id = format!("{}/{}", cfg.cluster_namespace, cfg.cluster_name);

    // The CPI ConfigMap references the cloud secret by name; keep the secret
    // first so a fresh cluster never observes the reference before its
    // target.
    Ok(vec![
        build_cloud_secret(&creds),
        build_cloud_config_map(&creds)?,
        build_csi_secret(&cluster_id, &creds)?,
    ])
}

/// Propagate vSphere CPI/CSI credentials into the managed cluster
pub async fn propagate_vsphere_secrets(cfg: &PropagationConfig) -> Result<()> {
    let payloads = resolve(cfg).await?;
    apply::apply_to_managed_cluster(cfg, &payloads).await
}
