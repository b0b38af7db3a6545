//! Provider registry and dispatch
//!
//! Maps a provider name to its descriptor: the cluster-resource GVK, the
//! identity-object kinds it accepts, and how credentials are propagated.
//! Built-in providers are compiled in; further providers are registered from
//! declarative definition files at startup. The registry is an explicit
//! value constructed once during initialization and passed to whatever
//! performs dispatch. Registration is write-once per name and nothing
//! mutates it afterwards, so reads need no synchronization.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use strata_common::types::GvkRef;
use strata_common::{Error, Result};

use crate::{azure, lua, openstack, vsphere, PropagationConfig};

/// Compiled-in providers with dedicated resolvers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinProvider {
    /// Microsoft Azure (CAPZ)
    Azure,
    /// OpenStack (CAPO)
    OpenStack,
    /// VMware vSphere (CAPV)
    VSphere,
}

/// How a provider's credentials reach the managed cluster
#[derive(Clone, Debug)]
pub enum PropagationMethod {
    /// Dispatch to a compiled-in resolver
    Builtin(BuiltinProvider),
    /// Run the provider's Lua script to enumerate objects
    Script {
        /// Lua source defining the `getObjects` entrypoint
        source: String,
    },
    /// Propagation declared off; dispatch is a no-op
    Disabled,
}

/// Immutable description of one registered provider
#[derive(Clone, Debug)]
pub struct ProviderDescriptor {
    /// Registry key, unique per process
    pub name: String,
    /// Human-readable display name
    pub title: String,
    /// GVK of the provider's cluster resource
    pub cluster_gvk: GvkRef,
    /// Kinds accepted as the cluster's identity reference
    pub identity_kinds: Vec<String>,
    /// Credential propagation entrypoint
    pub propagation: PropagationMethod,
}

impl ProviderDescriptor {
    /// Run this provider's credential propagation for one managed cluster
    pub async fn propagate(&self, cfg: &PropagationConfig) -> Result<()> {
        match &self.propagation {
            PropagationMethod::Builtin(BuiltinProvider::Azure) => {
                azure::propagate_azure_secrets(cfg).await
            }
            PropagationMethod::Builtin(BuiltinProvider::OpenStack) => {
                openstack::propagate_openstack_secrets(cfg).await
            }
            PropagationMethod::Builtin(BuiltinProvider::VSphere) => {
                vsphere::propagate_vsphere_secrets(cfg).await
            }
            PropagationMethod::Script { source } => {
                lua::propagate_provider_objects(cfg, source).await
            }
            PropagationMethod::Disabled => {
                debug!(provider = %self.name, "credential propagation disabled");
                Ok(())
            }
        }
    }
}

/// Declarative provider definition file
///
/// ```yaml
/// name: harvester
/// title: Harvester
/// clusterGVK:
///   group: infrastructure.cluster.x-k8s.io
///   version: v1beta1
///   kind: HarvesterCluster
/// clusterIdentityKinds:
///   - Secret
/// credentialPropagation:
///   enabled: true
///   lua: |
///     function getObjects(namespace, name)
///       ...
///     end
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderDefinition {
    name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "clusterGVK")]
    cluster_gvk: GvkRef,
    #[serde(default)]
    cluster_identity_kinds: Vec<String>,
    #[serde(default)]
    credential_propagation: Option<CredentialPropagation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialPropagation {
    #[serde(default)]
    lua: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Process-lifetime provider registry
///
/// Write-once at init, read-only thereafter.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderDescriptor>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with the compiled-in providers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin_descriptors() {
            // Builtin names are distinct by construction
            registry
                .register(descriptor)
                .expect("builtin provider names are unique");
        }
        registry
    }

    /// Register a provider descriptor
    ///
    /// Write-once per name: re-registering an existing name is an error, not
    /// an overwrite.
    pub fn register(&mut self, descriptor: ProviderDescriptor) -> Result<()> {
        if descriptor.name.is_empty() {
            return Err(Error::registry("provider name must not be empty"));
        }
        if descriptor.cluster_gvk.version.is_empty() || descriptor.cluster_gvk.kind.is_empty() {
            return Err(Error::registry(format!(
                "provider {:?}: clusterGVK version and kind are required",
                descriptor.name
            )));
        }
        if self.providers.contains_key(&descriptor.name) {
            return Err(Error::registry(format!(
                "provider {:?} already registered",
                descriptor.name
            )));
        }
        info!(provider = %descriptor.name, kind = %descriptor.cluster_gvk.kind, "registered provider");
        self.providers.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Parse a declarative definition file and register it
    pub fn register_from_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::registry(format!("reading {}: {}", path.display(), e)))?;
        let definition: ProviderDefinition = serde_yaml::from_str(&text)
            .map_err(|e| Error::registry(format!("parsing {}: {}", path.display(), e)))?;

        let propagation = match definition.credential_propagation {
            Some(cp) if cp.enabled => match cp.lua {
                Some(source) if !source.trim().is_empty() => {
                    PropagationMethod::Script { source }
                }
                _ => {
                    return Err(Error::registry(format!(
                        "{}: credentialPropagation is enabled but no lua script is given",
                        path.display()
                    )))
                }
            },
            _ => PropagationMethod::Disabled,
        };

        let title = definition
            .title
            .unwrap_or_else(|| definition.name.clone());
        self.register(ProviderDescriptor {
            name: definition.name,
            title,
            cluster_gvk: definition.cluster_gvk,
            identity_kinds: definition.cluster_identity_kinds,
            propagation,
        })
    }

    /// Register every definition file matching a glob pattern
    ///
    /// Aborts on the first parse or registration failure: a malformed
    /// definition stops process startup rather than surfacing at runtime.
    pub fn register_from_glob(&mut self, pattern: &str) -> Result<()> {
        let paths = glob::glob(pattern)
            .map_err(|e| Error::registry(format!("invalid glob pattern {:?}: {}", pattern, e)))?;
        for entry in paths {
            let path = entry.map_err(|e| Error::registry(e.to_string()))?;
            self.register_from_file(&path)?;
        }
        Ok(())
    }

    /// Look up a provider by name
    pub fn get(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers.get(name)
    }

    /// Iterate over registered descriptors in name order
    pub fn iter(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.providers.values()
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry has no providers
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Descriptors for the compiled-in providers
fn builtin_descriptors() -> Vec<ProviderDescriptor> {
    vec![
        ProviderDescriptor {
            name: "aws".to_string(),
            title: "Amazon Web Services".to_string(),
            // AWS nodes obtain credentials from instance profiles; there is
            // nothing to propagate into the workload cluster.
            cluster_gvk: GvkRef::new("infrastructure.cluster.x-k8s.io", "v1beta2", "AWSCluster"),
            identity_kinds: vec![
                "AWSClusterStaticIdentity".to_string(),
                "AWSClusterRoleIdentity".to_string(),
            ],
            propagation: PropagationMethod::Disabled,
        },
        ProviderDescriptor {
            name: "azure".to_string(),
            title: "Microsoft Azure".to_string(),
            cluster_gvk: GvkRef::new("infrastructure.cluster.x-k8s.io", "v1beta1", "AzureCluster"),
            identity_kinds: vec!["AzureClusterIdentity".to_string()],
            propagation: PropagationMethod::Builtin(BuiltinProvider::Azure),
        },
        ProviderDescriptor {
            name: "openstack".to_string(),
            title: "OpenStack".to_string(),
            cluster_gvk: GvkRef::new(
                "infrastructure.cluster.x-k8s.io",
                "v1beta1",
                "OpenStackCluster",
            ),
            identity_kinds: vec!["Secret".to_string()],
            propagation: PropagationMethod::Builtin(BuiltinProvider::OpenStack),
        },
        ProviderDescriptor {
            name: "vsphere".to_string(),
            title: "VMware vSphere".to_string(),
            cluster_gvk: GvkRef::new(
                "infrastructure.cluster.x-k8s.io",
                "v1beta1",
                "VSphereCluster",
            ),
            identity_kinds: vec!["Secret".to_string(), "VSphereClusterIdentity".to_string()],
            propagation: PropagationMethod::Builtin(BuiltinProvider::VSphere),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_definition(dir: &Path, file: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(file);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    const HARVESTER_DEFINITION: &str = r#"
name: harvester
title: Harvester
clusterGVK:
  group: infrastructure.cluster.x-k8s.io
  version: v1beta1
  kind: HarvesterCluster
clusterIdentityKinds:
  - Secret
credentialPropagation:
  enabled: true
  lua: |
    function getObjects(namespace, name)
      return {}
    end
"#;

    #[test]
    fn builtins_are_preregistered() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.len(), 4);

        let azure = registry.get("azure").expect("azure registered");
        assert_eq!(azure.cluster_gvk.kind, "AzureCluster");
        assert!(matches!(
            azure.propagation,
            PropagationMethod::Builtin(BuiltinProvider::Azure)
        ));

        let vsphere = registry.get("vsphere").expect("vsphere registered");
        assert_eq!(
            vsphere.identity_kinds,
            vec!["Secret".to_string(), "VSphereClusterIdentity".to_string()]
        );

        // AWS needs no credential propagation (instance profiles)
        let aws = registry.get("aws").expect("aws registered");
        assert!(matches!(aws.propagation, PropagationMethod::Disabled));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ProviderRegistry::with_builtins();
        let err = registry
            .register(ProviderDescriptor {
                name: "azure".to_string(),
                title: "Azure again".to_string(),
                cluster_gvk: GvkRef::new("g", "v1", "K"),
                identity_kinds: vec![],
                propagation: PropagationMethod::Disabled,
            })
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        // Original descriptor untouched
        assert_eq!(registry.get("azure").unwrap().title, "Microsoft Azure");
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut registry = ProviderRegistry::new();
        let err = registry
            .register(ProviderDescriptor {
                name: String::new(),
                title: String::new(),
                cluster_gvk: GvkRef::new("g", "v1", "K"),
                identity_kinds: vec![],
                propagation: PropagationMethod::Disabled,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Registry { .. }));
    }

    #[test]
    fn definition_file_registers_a_script_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(dir.path(), "harvester.yaml", HARVESTER_DEFINITION);

        let mut registry = ProviderRegistry::new();
        registry.register_from_file(&path).unwrap();

        let provider = registry.get("harvester").expect("registered");
        assert_eq!(provider.title, "Harvester");
        assert_eq!(provider.cluster_gvk.kind, "HarvesterCluster");
        assert_eq!(provider.identity_kinds, vec!["Secret".to_string()]);
        match &provider.propagation {
            PropagationMethod::Script { source } => {
                assert!(source.contains("function getObjects"))
            }
            other => panic!("expected Script propagation, got {:?}", other),
        }
    }

    #[test]
    fn disabled_propagation_yields_a_noop_method() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(
            dir.path(),
            "quiet.yaml",
            r#"
name: quiet
clusterGVK:
  group: infrastructure.cluster.x-k8s.io
  version: v1beta1
  kind: QuietCluster
credentialPropagation:
  enabled: false
  lua: "function getObjects(n, m) return {} end"
"#,
        );

        let mut registry = ProviderRegistry::new();
        registry.register_from_file(&path).unwrap();
        assert!(matches!(
            registry.get("quiet").unwrap().propagation,
            PropagationMethod::Disabled
        ));
    }

    #[test]
    fn absent_propagation_block_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(
            dir.path(),
            "bare.yaml",
            "name: bare\nclusterGVK:\n  version: v1\n  kind: BareCluster\n",
        );

        let mut registry = ProviderRegistry::new();
        registry.register_from_file(&path).unwrap();
        assert!(matches!(
            registry.get("bare").unwrap().propagation,
            PropagationMethod::Disabled
        ));
        // Title falls back to the name
        assert_eq!(registry.get("bare").unwrap().title, "bare");
    }

    #[test]
    fn enabled_without_script_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_definition(
            dir.path(),
            "broken.yaml",
            r#"
name: broken
clusterGVK:
  version: v1beta1
  kind: BrokenCluster
credentialPropagation:
  enabled: true
"#,
        );

        let mut registry = ProviderRegistry::new();
        let err = registry.register_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("no lua script"));
        assert!(registry.is_empty());
    }

    #[test]
    fn glob_registration_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        write_definition(dir.path(), "00-bad.yaml", "name: [not valid\n");
        write_definition(dir.path(), "10-good.yaml", HARVESTER_DEFINITION);

        let mut registry = ProviderRegistry::new();
        let pattern = format!("{}/*.yaml", dir.path().display());
        let err = registry.register_from_glob(&pattern).unwrap_err();
        assert!(err.to_string().contains("00-bad.yaml"));
        // Fail-fast: nothing after the bad file was registered
        assert!(registry.get("harvester").is_none());
    }

    #[test]
    fn glob_registration_loads_every_match() {
        let dir = tempfile::tempdir().unwrap();
        write_definition(dir.path(), "harvester.yaml", HARVESTER_DEFINITION);
        write_definition(
            dir.path(),
            "bare.yaml",
            "name: bare\nclusterGVK:\n  version: v1\n  kind: BareCluster\n",
        );

        let mut registry = ProviderRegistry::with_builtins();
        let pattern = format!("{}/*.yaml", dir.path().display());
        registry.register_from_glob(&pattern).unwrap();
        assert_eq!(registry.len(), 6);
        assert!(registry.get("harvester").is_some());
        assert!(registry.get("bare").is_some());
    }
}
