//! The NGINX configuration model.
//!
//! In-memory form of everything the backend renders for one Ingress:
//! upstream server groups, virtual servers and their path locations.

use std::fmt;

/// Address of the placeholder server used when a group has no live
/// endpoints. Rendering an upstream block with zero servers is invalid
/// NGINX configuration, so every group keeps at least this one.
const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: &str = "8181";

/// A single backend address inside an upstream group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamServer {
    pub address: String,
    pub port: String,
}

/// Named pool of backend servers that locations forward to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub servers: Vec<UpstreamServer>,
}

impl Upstream {
    /// Upstream seeded with the default placeholder server.
    pub fn with_default_server(name: String) -> Self {
        Upstream {
            name,
            servers: vec![UpstreamServer {
                address: DEFAULT_SERVER_ADDRESS.to_string(),
                port: DEFAULT_SERVER_PORT.to_string(),
            }],
        }
    }
}

/// Composite key identifying an upstream group within one Ingress.
///
/// Identical tuples across rules and paths collapse to a single group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpstreamKey<'a> {
    pub namespace: &'a str,
    pub ingress: &'a str,
    pub host: &'a str,
    pub service: &'a str,
}

impl fmt::Display for UpstreamKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.namespace, self.ingress, self.host, self.service
        )
    }
}

/// One path-routed location inside a server block.
///
/// The proxy settings are copied from the effective configuration at
/// generation time so every location of one pass agrees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub upstream: String,
    pub proxy_connect_timeout: String,
    pub proxy_read_timeout: String,
    pub client_max_body_size: String,
}

/// Virtual server for one host. An empty name is the wildcard/default
/// server that catches requests for any host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Server {
    pub name: String,
    pub ssl: bool,
    pub ssl_certificate: String,
    pub ssl_certificate_key: String,
    pub locations: Vec<Location>,
}

/// Complete generated configuration for one Ingress resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressNginxConfig {
    pub upstreams: Vec<Upstream>,
    pub servers: Vec<Server>,
}

/// Process-global settings written to the main NGINX configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MainConfig {
    pub server_names_hash_bucket_size: String,
    pub server_names_hash_max_size: String,
}
