//! OpenStack credential propagation (CAPO)
//!
//! Resolves the OpenStackCluster → identity Secret chain and derives the
//! `openstack-cloud-config` Secret for the OpenStack cloud-controller-manager.
//! The payload carries both historical layouts: the verbatim `clouds.yaml`
//! blob from the identity Secret, and a `cloud.conf` INI synthesized from the
//! named cloud's auth block merged with the cluster's resolved external
//! network.
//!
//! CAPO API: infrastructure.cluster.x-k8s.io/v1beta1

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use strata_common::kube_utils::{api_resource_for_gvk, get_dynamic, get_secret, secret_string};
use strata_common::types::GvkRef;
use strata_common::{Error, Result, CLUSTER_SYSTEM_NAMESPACE};

use crate::{apply, PropagationConfig};

/// Provider name used in derivation errors
const PROVIDER: &str = "openstack";

/// CAPO infrastructure API group
const INFRA_GROUP: &str = "infrastructure.cluster.x-k8s.io";
/// CAPO infrastructure API version
const INFRA_VERSION: &str = "v1beta1";

/// Name of the propagated Secret the OpenStack CCM mounts
pub const OPENSTACK_CLOUD_CONFIG_SECRET: &str = "openstack-cloud-config";
/// Data key holding the verbatim clouds.yaml blob
pub const CLOUDS_YAML_KEY: &str = "clouds.yaml";
/// Data key holding the synthesized cloud.conf INI
pub const CLOUD_CONF_KEY: &str = "cloud.conf";

/// Cloud name used when the identity reference does not pin one
const DEFAULT_CLOUD_NAME: &str = "openstack";

/// Parsed clouds.yaml document
#[derive(Debug, Deserialize)]
pub struct CloudsYaml {
    /// Named cloud entries
    #[serde(default)]
    pub clouds: BTreeMap<String, Cloud>,
}

/// One named cloud entry
#[derive(Debug, Default, Deserialize)]
pub struct Cloud {
    /// Authentication block
    #[serde(default)]
    pub auth: CloudAuth,
    /// Region for this cloud
    #[serde(default)]
    pub region_name: Option<String>,
}

/// Auth block of a named cloud
///
/// Application-credential and username/password auth are mutually exclusive
/// in the rendered output; application-credential fields take precedence
/// when present.
#[derive(Debug, Default, Deserialize)]
pub struct CloudAuth {
    /// Keystone auth URL
    #[serde(default)]
    pub auth_url: Option<String>,
    /// Application credential ID
    #[serde(default)]
    pub application_credential_id: Option<String>,
    /// Application credential secret
    #[serde(default)]
    pub application_credential_secret: Option<String>,
    /// User name
    #[serde(default)]
    pub username: Option<String>,
    /// User password
    #[serde(default)]
    pub password: Option<String>,
    /// Project (tenant) name
    #[serde(default)]
    pub project_name: Option<String>,
    /// Project (tenant) ID
    #[serde(default)]
    pub project_id: Option<String>,
    /// User domain name
    #[serde(default)]
    pub user_domain_name: Option<String>,
}

/// External network resolved from the cluster's status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalNetwork {
    /// Network ID, consumed as the load-balancer floating network
    pub id: String,
    /// Network name, consumed as the public network name
    pub name: String,
}

/// Parse a clouds.yaml document
pub fn parse_clouds_yaml(text: &str) -> Result<CloudsYaml> {
    serde_yaml::from_str(text)
        .map_err(|e| Error::derivation(PROVIDER, format!("invalid clouds.yaml: {}", e)))
}

/// Read the external network from an OpenStackCluster status document
///
/// Both the ID and the name must be populated before propagation can
/// proceed; CAPO fills them once the network is reconciled.
pub fn external_network(status: &Value) -> Result<ExternalNetwork> {
    let id = status
        .pointer("/externalNetwork/id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());
    let name = status
        .pointer("/externalNetwork/name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());
    match (id, name) {
        (Some(id), Some(name)) => Ok(ExternalNetwork {
            id: id.to_string(),
            name: name.to_string(),
        }),
        _ => Err(Error::derivation(
            PROVIDER,
            "external network status incomplete (missing id or name)",
        )),
    }
}

/// Synthesize a cloud.conf INI document from a named cloud's auth block
///
/// Application-credential fields suppress the username/password lines
/// entirely; the username/password branch always emits both lines, even when
/// empty, since the CCM parses the `[Global]` pair positionally.
pub fn render_cloud_conf(
    clouds: &CloudsYaml,
    cloud_name: &str,
    network: &ExternalNetwork,
) -> Result<String> {
    let cloud = clouds.clouds.get(cloud_name).ok_or_else(|| {
        Error::derivation(
            PROVIDER,
            format!("cloud {:?} not found in clouds.yaml", cloud_name),
        )
    })?;
    let auth = &cloud.auth;

    let mut conf = String::from("[Global]\n");
    conf.push_str(&format!(
        "auth-url={}\n",
        auth.auth_url.as_deref().unwrap_or_default()
    ));

    let app_credential = auth.application_credential_id.is_some()
        && auth.application_credential_secret.is_some();
    if app_credential {
        conf.push_str(&format!(
            "application-credential-id={}\n",
            auth.application_credential_id.as_deref().unwrap_or_default()
        ));
        conf.push_str(&format!(
            "application-credential-secret={}\n",
            auth.application_credential_secret
                .as_deref()
                .unwrap_or_default()
        ));
    } else {
        conf.push_str(&format!(
            "username={}\n",
            auth.username.as_deref().unwrap_or_default()
        ));
        conf.push_str(&format!(
            "password={}\n",
            auth.password.as_deref().unwrap_or_default()
        ));
        if let Some(ref domain) = auth.user_domain_name {
            conf.push_str(&format!("domain-name={}\n", domain));
        }
        if let Some(ref project) = auth.project_name {
            conf.push_str(&format!("tenant-name={}\n", project));
        }
        if let Some(ref project_id) = auth.project_id {
            conf.push_str(&format!("tenant-id={}\n", project_id));
        }
    }

    if let Some(ref region) = cloud.region_name {
        conf.push_str(&format!("region={}\n", region));
    }

    conf.push_str("\n[LoadBalancer]\n");
    conf.push_str(&format!("floating-network-id={}\n", network.id));

    conf.push_str("\n[Networking]\n");
    conf.push_str(&format!("public-network-name={}\n", network.name));

    Ok(conf)
}

/// Build the `openstack-cloud-config` payload Secret
///
/// Carries the verbatim clouds.yaml alongside the synthesized cloud.conf so
/// both CCM generations find the layout they expect.
pub fn build_cloud_config_secret(clouds_yaml: &str, cloud_conf: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {
            "name": OPENSTACK_CLOUD_CONFIG_SECRET,
            "namespace": CLUSTER_SYSTEM_NAMESPACE,
        },
        "type": "Opaque",
        "stringData": {
            CLOUDS_YAML_KEY: clouds_yaml,
            CLOUD_CONF_KEY: cloud_conf,
        }
    })
}

/// Resolve the OpenStack identity chain and build the payload Secret
async fn resolve(cfg: &PropagationConfig) -> Result<Value> {
    let cluster_ar =
        api_resource_for_gvk(&GvkRef::new(INFRA_GROUP, INFRA_VERSION, "OpenStackCluster"));
    let cluster = get_dynamic(
        &cfg.client,
        &cluster_ar,
        &cfg.cluster_name,
        &cfg.cluster_namespace,
    )
    .await?;

    let spec = cluster.data.get("spec").cloned().unwrap_or(Value::Null);
    let identity_name = spec
        .pointer("/identityRef/name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::resolution(
                "OpenStackCluster",
                &cfg.cluster_name,
                &cfg.cluster_namespace,
                "spec.identityRef.name is empty",
            )
        })?;
    let cloud_name = spec
        .pointer("/identityRef/cloudName")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_CLOUD_NAME);

    let secret = get_secret(&cfg.client, identity_name, &cfg.cluster_namespace).await?;
    let clouds_blob = secret_string(&secret, CLOUDS_YAML_KEY)?;
    let clouds = parse_clouds_yaml(&clouds_blob)?;

    let status = cluster.data.get("status").cloned().unwrap_or(Value::Null);
    let network = external_network(&status)?;

    debug!(
        cluster = %cfg.cluster_name,
        cloud = %cloud_name,
        network = %network.name,
        "resolved openstack identity chain"
    );

    let cloud_conf = render_cloud_conf(&clouds, cloud_name, &network)?;
    Ok(build_cloud_config_secret(&clouds_blob, &cloud_conf))
}

/// Propagate OpenStack CCM credentials into the managed cluster
pub async fn propagate_openstack_secrets(cfg: &PropagationConfig) -> Result<()> {
    let payload = resolve(cfg).await?;
    apply::apply_to_managed_cluster(cfg, &[payload]).await
}
