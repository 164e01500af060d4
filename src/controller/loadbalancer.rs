//! The load balancer controller: watch loop over Ingress, Endpoints and
//! the optional NGINX ConfigMap.
//!
//! Each event is resolved into a fresh `IngressEx` snapshot (the Ingress
//! plus its referenced Secrets and Endpoints) and handed to the
//! Configurator. Reference-resolution failures degrade to absent map
//! entries so a broken reference never blocks convergence of the rest of
//! the configuration.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::nginx::{Config, Configurator, IngressEx, NginxBackend};

/// Namespaced reference to the ConfigMap customizing NGINX settings,
/// given on the command line as `<namespace>/<name>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigMapRef {
    pub namespace: String,
    pub name: String,
}

impl FromStr for ConfigMapRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(ConfigMapRef {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(Error::ConfigError(format!(
                "ConfigMap reference must be <namespace>/<name>, got {:?}",
                s
            ))),
        }
    }
}

/// Watches the cluster and drives the Configurator.
pub struct LoadBalancerController<B: NginxBackend> {
    client: Client,
    /// Namespace to watch; `None` watches all namespaces.
    namespace: Option<String>,
    configurator: Arc<Configurator<B>>,
    nginx_config_map: Option<ConfigMapRef>,
    /// Known Ingresses, keyed `namespace/name`. Backs the
    /// Endpoints-to-Ingress fan-out.
    ingresses: Mutex<HashMap<String, Ingress>>,
}

impl<B: NginxBackend> LoadBalancerController<B> {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        configurator: Arc<Configurator<B>>,
        nginx_config_map: Option<ConfigMapRef>,
    ) -> Self {
        LoadBalancerController {
            client,
            namespace,
            configurator,
            nginx_config_map,
            ingresses: Mutex::new(HashMap::new()),
        }
    }

    /// Run all watchers until one of them fails terminally.
    pub async fn run(&self) -> Result<()> {
        tokio::try_join!(
            self.watch_ingresses(),
            self.watch_endpoints(),
            self.watch_config_map(),
        )?;
        Ok(())
    }

    async fn watch_ingresses(&self) -> Result<()> {
        let api: Api<Ingress> = self.namespaced_api();
        let stream = watcher(api, watcher::Config::default());
        pin_mut!(stream);

        info!("Starting Ingress watcher");

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(ingress))
                | Ok(watcher::Event::InitApply(ingress)) => {
                    self.handle_ingress_apply(ingress).await;
                }
                Ok(watcher::Event::Delete(ingress)) => {
                    self.handle_ingress_delete(&ingress);
                }
                Ok(_) => {}
                Err(e) => warn!("Ingress watch error: {}", e),
            }
        }

        Ok(())
    }

    async fn watch_endpoints(&self) -> Result<()> {
        let api: Api<Endpoints> = self.namespaced_api();
        let stream = watcher(api, watcher::Config::default());
        pin_mut!(stream);

        info!("Starting Endpoints watcher");

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(endpoints))
                | Ok(watcher::Event::InitApply(endpoints))
                | Ok(watcher::Event::Delete(endpoints)) => {
                    self.handle_endpoints_change(&endpoints).await;
                }
                Ok(_) => {}
                Err(e) => warn!("Endpoints watch error: {}", e),
            }
        }

        Ok(())
    }

    async fn watch_config_map(&self) -> Result<()> {
        let reference = match &self.nginx_config_map {
            Some(reference) => reference.clone(),
            None => return Ok(()),
        };

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &reference.namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={}", reference.name));
        let stream = watcher(api, config);
        pin_mut!(stream);

        info!(
            "Watching ConfigMap {}/{} for NGINX configuration",
            reference.namespace, reference.name
        );

        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(config_map))
                | Ok(watcher::Event::InitApply(config_map)) => {
                    info!(
                        "Updating NGINX configuration from ConfigMap {}/{}",
                        reference.namespace, reference.name
                    );
                    let data = config_map.data.unwrap_or_default();
                    self.configurator.update_config(Config::from_config_map(&data));
                }
                Ok(watcher::Event::Delete(_)) => {
                    info!(
                        "ConfigMap {}/{} deleted, restoring default NGINX configuration",
                        reference.namespace, reference.name
                    );
                    self.configurator.update_config(Config::default());
                }
                Ok(_) => {}
                Err(e) => warn!("ConfigMap watch error: {}", e),
            }
        }

        Ok(())
    }

    #[instrument(skip(self, ingress), fields(name = %ingress.name_any(), namespace = ingress.namespace()))]
    async fn handle_ingress_apply(&self, ingress: Ingress) {
        let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());
        let name = ingress.name_any();
        let key = format!("{}/{}", namespace, name);

        self.index().insert(key.clone(), ingress.clone());

        match self.build_ingress_ex(ingress).await {
            Ok(ing_ex) => {
                info!("Adding or updating configuration for Ingress {}", key);
                self.configurator
                    .add_or_update_ingress(&config_name(&namespace, &name), &ing_ex);
            }
            Err(e) => warn!("Failed to resolve references for Ingress {}: {}", key, e),
        }
    }

    fn handle_ingress_delete(&self, ingress: &Ingress) {
        let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());
        let name = ingress.name_any();

        self.index().remove(&format!("{}/{}", namespace, name));

        info!("Deleting configuration for Ingress {}/{}", namespace, name);
        self.configurator
            .delete_ingress(&config_name(&namespace, &name));
    }

    #[instrument(skip(self, endpoints), fields(name = %endpoints.name_any(), namespace = endpoints.namespace()))]
    async fn handle_endpoints_change(&self, endpoints: &Endpoints) {
        let namespace = endpoints
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let service = endpoints.name_any();

        let affected = ingresses_for_service(&self.index(), &namespace, &service);
        for ingress in affected {
            let name = ingress.name_any();
            debug!(
                "Endpoints {}/{} changed, regenerating Ingress {}/{}",
                namespace, service, namespace, name
            );
            match self.build_ingress_ex(ingress).await {
                Ok(ing_ex) => self
                    .configurator
                    .update_endpoints(&config_name(&namespace, &name), &ing_ex),
                Err(e) => warn!(
                    "Failed to resolve references for Ingress {}/{}: {}",
                    namespace, name, e
                ),
            }
        }
    }

    /// Resolve the Ingress's referenced Secrets and Endpoints into a
    /// snapshot. Missing objects leave their map entry absent; the
    /// Configurator degrades gracefully on those.
    async fn build_ingress_ex(&self, ingress: Ingress) -> Result<IngressEx> {
        let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());
        let secrets_api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let endpoints_api: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);

        let mut secrets = HashMap::new();
        let tls_specs = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.tls.as_deref())
            .unwrap_or(&[]);
        for tls in tls_specs {
            let secret_name = match tls.secret_name.as_deref() {
                Some(name) => name,
                None => continue,
            };
            match secrets_api.get(secret_name).await {
                Ok(secret) => {
                    secrets.insert(secret_name.to_string(), secret);
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    warn!(
                        "TLS secret {} referenced by Ingress {}/{} not found",
                        secret_name,
                        namespace,
                        ingress.name_any()
                    );
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }

        let mut endpoints = HashMap::new();
        for service in referenced_services(&ingress) {
            match endpoints_api.get(&service).await {
                Ok(endp) => {
                    endpoints.insert(service, endp);
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!("No endpoints for service {}/{}", namespace, service);
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }

        Ok(IngressEx {
            ingress,
            secrets,
            endpoints,
        })
    }

    fn namespaced_api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    fn index(&self) -> MutexGuard<'_, HashMap<String, Ingress>> {
        self.ingresses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Name under which an Ingress's configuration is applied to the backend.
fn config_name(namespace: &str, name: &str) -> String {
    format!("{}-{}", namespace, name)
}

/// All service names an Ingress forwards to: the default backend plus
/// every rule path backend.
pub(super) fn referenced_services(ingress: &Ingress) -> BTreeSet<String> {
    let mut services = BTreeSet::new();

    let spec = match ingress.spec.as_ref() {
        Some(spec) => spec,
        None => return services,
    };

    if let Some(service) = spec
        .default_backend
        .as_ref()
        .and_then(|backend| backend.service.as_ref())
    {
        services.insert(service.name.clone());
    }

    for rule in spec.rules.as_deref().unwrap_or(&[]) {
        let http = match rule.http.as_ref() {
            Some(http) => http,
            None => continue,
        };
        for path in &http.paths {
            if let Some(service) = path.backend.service.as_ref() {
                services.insert(service.name.clone());
            }
        }
    }

    services
}

/// Ingresses in `namespace` that reference `service`.
pub(super) fn ingresses_for_service(
    index: &HashMap<String, Ingress>,
    namespace: &str,
    service: &str,
) -> Vec<Ingress> {
    index
        .values()
        .filter(|ingress| {
            ingress.namespace().as_deref() == Some(namespace)
                && referenced_services(ingress).contains(service)
        })
        .cloned()
        .collect()
}
