//! Configurator: transforms Ingress resources into NGINX configuration.
//!
//! One mutual-exclusion lock serializes every mutating operation for its
//! full duration (generation, apply, reload request), so concurrent
//! reconcile events can never interleave their writes to the backend or
//! observe a half-replaced configuration baseline.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::api::core::v1::{Endpoints, Secret};
use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend};
use kube::ResourceExt;
use tracing::warn;

use crate::nginx::config::Config;
use crate::nginx::controller::NginxBackend;
use crate::nginx::model::{
    IngressNginxConfig, Location, MainConfig, Server, Upstream, UpstreamKey, UpstreamServer,
};

const EMPTY_HOST: &str = "";

/// Standard kubernetes.io/tls secret data keys.
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Fully-resolved view of one Ingress: the resource plus the Secrets and
/// Endpoints it references, looked up by the watch layer at event time.
/// Built fresh per reconciliation and discarded after use.
#[derive(Clone, Debug, Default)]
pub struct IngressEx {
    pub ingress: Ingress,
    /// Secret name -> Secret, for the names referenced by the TLS spec.
    pub secrets: HashMap<String, Secret>,
    /// Service name -> live Endpoints, for the services referenced by rules.
    pub endpoints: HashMap<String, Endpoints>,
}

struct Inner<B> {
    config: Config,
    nginx: B,
}

/// Serializes configuration generation and application against one NGINX
/// instance.
pub struct Configurator<B: NginxBackend> {
    inner: Mutex<Inner<B>>,
}

impl<B: NginxBackend> Configurator<B> {
    pub fn new(nginx: B, config: Config) -> Self {
        Configurator {
            inner: Mutex::new(Inner { config, nginx }),
        }
    }

    /// Generate and apply NGINX configuration for an Ingress resource,
    /// then request a reload. Malformed or incomplete resources produce a
    /// best-effort configuration rather than an error (see module docs of
    /// the generation helpers below).
    pub fn add_or_update_ingress(&self, name: &str, ing_ex: &IngressEx) {
        let mut inner = self.lock();

        let pems = update_certificates(&mut inner.nginx, ing_ex);
        let nginx_config = generate_nginx_config(&inner.config, ing_ex, &pems);
        inner.nginx.add_or_update_ingress(name, &nginx_config);
        inner.nginx.reload();
    }

    /// Remove the configuration for an Ingress resource and request a
    /// reload.
    pub fn delete_ingress(&self, name: &str) {
        let mut inner = self.lock();

        inner.nginx.delete_ingress(name);
        inner.nginx.reload();
    }

    /// Endpoints changed for a service the Ingress references. This is a
    /// full regeneration, not an incremental patch.
    pub fn update_endpoints(&self, name: &str, ing_ex: &IngressEx) {
        self.add_or_update_ingress(name, ing_ex);
    }

    /// Replace the process-wide baseline wholesale and push the
    /// main-configuration settings. Does not regenerate per-Ingress
    /// configurations by itself.
    pub fn update_config(&self, config: Config) {
        let mut inner = self.lock();

        let main_config = MainConfig {
            server_names_hash_bucket_size: config.server_names_hash_bucket_size.clone(),
            server_names_hash_max_size: config.server_names_hash_max_size.clone(),
        };
        inner.config = config;
        inner.nginx.update_main_config(&main_config);
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B>> {
        // A panic while holding the lock poisons it; the held state is
        // still consistent (the backend replaces files atomically per
        // operation), so recover the guard and continue.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolve TLS declarations to certificate file references.
///
/// An absent secret skips the declaration silently; a secret missing the
/// certificate or key field is logged and skipped, leaving its hosts
/// without TLS. A declaration with no hosts registers its file under the
/// empty host, making it the default certificate.
fn update_certificates<B: NginxBackend>(
    nginx: &mut B,
    ing_ex: &IngressEx,
) -> HashMap<String, String> {
    let mut pems = HashMap::new();

    let tls_specs = ing_ex
        .ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.tls.as_deref())
        .unwrap_or(&[]);

    for tls in tls_specs {
        let secret_name = match tls.secret_name.as_deref() {
            Some(name) => name,
            None => continue,
        };
        let secret = match ing_ex.secrets.get(secret_name) {
            Some(secret) => secret,
            None => continue,
        };

        let data = secret.data.as_ref();
        let cert = match data.and_then(|d| d.get(TLS_CERT_KEY)) {
            Some(cert) => cert,
            None => {
                warn!("Secret {} has no {}", secret_name, TLS_CERT_KEY);
                continue;
            }
        };
        let key = match data.and_then(|d| d.get(TLS_PRIVATE_KEY_KEY)) {
            Some(key) => key,
            None => {
                warn!("Secret {} has no {}", secret_name, TLS_PRIVATE_KEY_KEY);
                continue;
            }
        };

        let pem_file = nginx.add_or_update_cert_and_key(secret_name, &cert.0, &key.0);

        let hosts = tls.hosts.as_deref().unwrap_or(&[]);
        for host in hosts {
            pems.insert(host.clone(), pem_file.clone());
        }
        if hosts.is_empty() {
            pems.insert(EMPTY_HOST.to_string(), pem_file);
        }
    }

    pems
}

/// Walk the Ingress rules and build the full configuration model.
fn generate_nginx_config(
    config: &Config,
    ing_ex: &IngressEx,
    pems: &HashMap<String, String>,
) -> IngressNginxConfig {
    let ing_config = config.overlay(ing_ex.ingress.annotations());

    let namespace = ing_ex
        .ingress
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let ing_name = ing_ex.ingress.name_any();

    // Keyed by group name; BTreeMap keeps the rendered order stable.
    let mut upstreams: BTreeMap<String, Upstream> = BTreeMap::new();

    let default_backend = ing_ex
        .ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.default_backend.as_ref())
        .and_then(|backend| backend.service.as_ref());

    // The default backend's group is built eagerly: host rules lacking a
    // root location fall back to it later.
    if let Some(backend) = default_backend {
        let name = UpstreamKey {
            namespace: &namespace,
            ingress: &ing_name,
            host: EMPTY_HOST,
            service: &backend.name,
        }
        .to_string();
        let upstream = create_upstream(ing_ex, name.clone(), backend);
        upstreams.insert(name, upstream);
    }

    let rules = ing_ex
        .ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_deref())
        .unwrap_or(&[]);

    let mut servers = Vec::new();

    for rule in rules {
        let http = match rule.http.as_ref() {
            Some(http) => http,
            None => continue,
        };

        let host = rule.host.as_deref().unwrap_or(EMPTY_HOST);
        if host == EMPTY_HOST {
            warn!(
                "Host field of ingress rule in {}/{} is empty",
                namespace, ing_name
            );
        }

        let mut server = Server {
            name: host.to_string(),
            ..Default::default()
        };

        if let Some(pem_file) = pems.get(host) {
            server.ssl = true;
            server.ssl_certificate = pem_file.clone();
            server.ssl_certificate_key = pem_file.clone();
        }

        let mut root_location = false;

        for path in &http.paths {
            let backend = match path.backend.service.as_ref() {
                Some(service) => service,
                None => {
                    warn!(
                        "Ingress {}/{} path {:?} has no service backend",
                        namespace, ing_name, path.path
                    );
                    continue;
                }
            };

            let upstream_name = UpstreamKey {
                namespace: &namespace,
                ingress: &ing_name,
                host,
                service: &backend.name,
            }
            .to_string();

            if !upstreams.contains_key(&upstream_name) {
                let upstream = create_upstream(ing_ex, upstream_name.clone(), backend);
                upstreams.insert(upstream_name.clone(), upstream);
            }

            let location =
                create_location(path_or_default(path.path.as_deref()), &upstream_name, &ing_config);
            if location.path == "/" {
                root_location = true;
            }
            server.locations.push(location);
        }

        if !root_location {
            if let Some(backend) = default_backend {
                let upstream_name = UpstreamKey {
                    namespace: &namespace,
                    ingress: &ing_name,
                    host: EMPTY_HOST,
                    service: &backend.name,
                }
                .to_string();
                server
                    .locations
                    .push(create_location("/".to_string(), &upstream_name, &ing_config));
            }
        }

        servers.push(server);
    }

    // No host rules at all: a default backend still gets a wildcard server
    // with a single root location.
    if rules.is_empty() {
        if let Some(backend) = default_backend {
            let mut server = Server {
                name: EMPTY_HOST.to_string(),
                ..Default::default()
            };

            if let Some(pem_file) = pems.get(EMPTY_HOST) {
                server.ssl = true;
                server.ssl_certificate = pem_file.clone();
                server.ssl_certificate_key = pem_file.clone();
            }

            let upstream_name = UpstreamKey {
                namespace: &namespace,
                ingress: &ing_name,
                host: EMPTY_HOST,
                service: &backend.name,
            }
            .to_string();
            server
                .locations
                .push(create_location("/".to_string(), &upstream_name, &ing_config));

            servers.push(server);
        }
    }

    IngressNginxConfig {
        upstreams: upstreams.into_values().collect(),
        servers,
    }
}

/// Build an upstream group from the service's live endpoints. When no
/// endpoint subset exposes the requested port the group keeps its
/// placeholder server, so it stays renderable.
fn create_upstream(ing_ex: &IngressEx, name: String, backend: &IngressServiceBackend) -> Upstream {
    let mut upstream = Upstream::with_default_server(name);

    if let Some(endpoints) = ing_ex.endpoints.get(&backend.name) {
        // Named service ports cannot match the integer scan and keep the
        // placeholder.
        if let Some(port) = backend.port.as_ref().and_then(|p| p.number) {
            let servers = endpoints_to_upstream_servers(endpoints, port);
            if !servers.is_empty() {
                upstream.servers = servers;
            }
        }
    }

    upstream
}

fn endpoints_to_upstream_servers(endpoints: &Endpoints, service_port: i32) -> Vec<UpstreamServer> {
    let mut servers = Vec::new();

    for subset in endpoints.subsets.as_deref().unwrap_or(&[]) {
        for port in subset.ports.as_deref().unwrap_or(&[]) {
            if port.port == service_port {
                for address in subset.addresses.as_deref().unwrap_or(&[]) {
                    servers.push(UpstreamServer {
                        address: address.ip.clone(),
                        port: service_port.to_string(),
                    });
                }
                // First matching port wins for this subset.
                break;
            }
        }
    }

    servers
}

fn create_location(path: String, upstream: &str, config: &Config) -> Location {
    Location {
        path,
        upstream: upstream.to_string(),
        proxy_connect_timeout: config.proxy_connect_timeout.clone(),
        proxy_read_timeout: config.proxy_read_timeout.clone(),
        client_max_body_size: config.client_max_body_size.clone(),
    }
}

fn path_or_default(path: Option<&str>) -> String {
    match path {
        Some(path) if !path.is_empty() => path.to_string(),
        _ => "/".to_string(),
    }
}
