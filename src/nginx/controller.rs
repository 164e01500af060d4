//! Backend boundary to the running NGINX instance.
//!
//! The configurator computes configuration models; this module owns how
//! they are persisted. `NginxController` renders the models to NGINX
//! configuration text under a configuration directory and records
//! certificate material for TLS servers. NGINX process lifecycle
//! (start/stop, the actual reload signal) stays outside this crate;
//! `reload()` marks the boundary where that instruction is issued.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::nginx::model::{IngressNginxConfig, MainConfig};

/// Operations the configurator needs from a running NGINX instance.
pub trait NginxBackend: Send {
    /// Store a certificate/key pair under `name`, returning the file
    /// reference used for both `ssl_certificate` and
    /// `ssl_certificate_key` directives.
    fn add_or_update_cert_and_key(&mut self, name: &str, cert: &[u8], key: &[u8]) -> String;

    /// Replace the configuration for one Ingress resource.
    fn add_or_update_ingress(&mut self, name: &str, config: &IngressNginxConfig);

    /// Remove the configuration for one Ingress resource.
    fn delete_ingress(&mut self, name: &str);

    /// Update process-global settings in the main configuration file.
    fn update_main_config(&mut self, config: &MainConfig);

    /// Ask the running NGINX to pick up the persisted configuration.
    fn reload(&mut self);
}

/// File-backed NGINX configuration manager.
///
/// In local mode (testing against a kubectl proxy) rendered configuration
/// is printed to stdout instead of written to disk, and reload requests
/// are skipped.
pub struct NginxController {
    nginx_conf_path: PathBuf,
    local: bool,
}

impl NginxController {
    pub fn new(nginx_conf_path: impl Into<PathBuf>, local: bool) -> Self {
        NginxController {
            nginx_conf_path: nginx_conf_path.into(),
            local,
        }
    }

    fn ingress_file_name(&self, name: &str) -> PathBuf {
        self.nginx_conf_path
            .join("conf.d")
            .join(format!("{}.conf", name))
    }

    fn pem_file_name(&self, name: &str) -> PathBuf {
        self.nginx_conf_path
            .join("ssl")
            .join(format!("{}.pem", name))
    }

    fn main_file_name(&self) -> PathBuf {
        self.nginx_conf_path.join("nginx.conf")
    }

    /// Write a rendered file, or print it in local mode. Write failures
    /// are logged, not propagated: a failed write must not abort the
    /// reconciliation of other resources.
    fn write_file(&self, path: &Path, content: &str) {
        if self.local {
            println!("# {}\n{}", path.display(), content);
            return;
        }
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create {}: {}", parent.display(), e);
                return;
            }
        }
        match fs::write(path, content) {
            Ok(()) => debug!("Wrote {}", path.display()),
            Err(e) => error!("Failed to write {}: {}", path.display(), e),
        }
    }
}

impl NginxBackend for NginxController {
    fn add_or_update_cert_and_key(&mut self, name: &str, cert: &[u8], key: &[u8]) -> String {
        let path = self.pem_file_name(name);
        let mut pem = String::new();
        pem.push_str(String::from_utf8_lossy(cert).trim_end());
        pem.push('\n');
        pem.push_str(String::from_utf8_lossy(key).trim_end());
        pem.push('\n');
        self.write_file(&path, &pem);
        path.display().to_string()
    }

    fn add_or_update_ingress(&mut self, name: &str, config: &IngressNginxConfig) {
        let content = render_ingress_config(config);
        self.write_file(&self.ingress_file_name(name), &content);
    }

    fn delete_ingress(&mut self, name: &str) {
        if self.local {
            println!("# delete {}", self.ingress_file_name(name).display());
            return;
        }
        let path = self.ingress_file_name(name);
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!("Failed to remove {}: {}", path.display(), e),
        }
    }

    fn update_main_config(&mut self, config: &MainConfig) {
        let content = render_main_config(config);
        self.write_file(&self.main_file_name(), &content);
    }

    fn reload(&mut self) {
        if self.local {
            debug!("Local mode, skipping NGINX reload");
            return;
        }
        // The reload itself (signaling the NGINX master process) is owned
        // by the deployment wrapping this controller.
        info!("Requesting NGINX reload");
    }
}

fn render_ingress_config(config: &IngressNginxConfig) -> String {
    let mut out = String::new();

    for upstream in &config.upstreams {
        out.push_str(&format!("upstream {} {{\n", upstream.name));
        for server in &upstream.servers {
            out.push_str(&format!("\tserver {}:{};\n", server.address, server.port));
        }
        out.push_str("}\n\n");
    }

    for server in &config.servers {
        out.push_str("server {\n");
        out.push_str("\tlisten 80;\n");
        if server.ssl {
            out.push_str("\tlisten 443 ssl;\n");
            out.push_str(&format!("\tssl_certificate {};\n", server.ssl_certificate));
            out.push_str(&format!(
                "\tssl_certificate_key {};\n",
                server.ssl_certificate_key
            ));
        }
        if !server.name.is_empty() {
            out.push_str(&format!("\tserver_name {};\n", server.name));
        }
        for location in &server.locations {
            out.push('\n');
            out.push_str(&format!("\tlocation {} {{\n", location.path));
            out.push_str(&format!(
                "\t\tproxy_connect_timeout {};\n",
                location.proxy_connect_timeout
            ));
            out.push_str(&format!(
                "\t\tproxy_read_timeout {};\n",
                location.proxy_read_timeout
            ));
            out.push_str(&format!(
                "\t\tclient_max_body_size {};\n",
                location.client_max_body_size
            ));
            out.push_str("\t\tproxy_set_header Host $host;\n");
            out.push_str("\t\tproxy_set_header X-Real-IP $remote_addr;\n");
            out.push_str("\t\tproxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
            out.push_str(&format!("\t\tproxy_pass http://{};\n", location.upstream));
            out.push_str("\t}\n");
        }
        out.push_str("}\n\n");
    }

    out
}

fn render_main_config(config: &MainConfig) -> String {
    let mut out = String::new();
    out.push_str("user nginx;\nworker_processes auto;\n\n");
    out.push_str("events {\n\tworker_connections 1024;\n}\n\n");
    out.push_str("http {\n");
    out.push_str(&format!(
        "\tserver_names_hash_max_size {};\n",
        config.server_names_hash_max_size
    ));
    if !config.server_names_hash_bucket_size.is_empty() {
        out.push_str(&format!(
            "\tserver_names_hash_bucket_size {};\n",
            config.server_names_hash_bucket_size
        ));
    }
    out.push_str("\tinclude /etc/nginx/conf.d/*.conf;\n");
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nginx::model::{Location, Server, Upstream, UpstreamServer};

    fn sample_config() -> IngressNginxConfig {
        IngressNginxConfig {
            upstreams: vec![Upstream {
                name: "default-cafe-cafe.example.com-coffee-svc".to_string(),
                servers: vec![UpstreamServer {
                    address: "10.0.0.1".to_string(),
                    port: "80".to_string(),
                }],
            }],
            servers: vec![Server {
                name: "cafe.example.com".to_string(),
                ssl: false,
                ssl_certificate: String::new(),
                ssl_certificate_key: String::new(),
                locations: vec![Location {
                    path: "/coffee".to_string(),
                    upstream: "default-cafe-cafe.example.com-coffee-svc".to_string(),
                    proxy_connect_timeout: "60s".to_string(),
                    proxy_read_timeout: "60s".to_string(),
                    client_max_body_size: "1m".to_string(),
                }],
            }],
        }
    }

    #[test]
    fn test_render_contains_upstream_and_server_blocks() {
        let text = render_ingress_config(&sample_config());

        assert!(text.contains("upstream default-cafe-cafe.example.com-coffee-svc {"));
        assert!(text.contains("server 10.0.0.1:80;"));
        assert!(text.contains("server_name cafe.example.com;"));
        assert!(text.contains("location /coffee {"));
        assert!(text.contains("proxy_pass http://default-cafe-cafe.example.com-coffee-svc;"));
    }

    #[test]
    fn test_render_omits_ssl_directives_without_tls() {
        let text = render_ingress_config(&sample_config());

        assert!(!text.contains("ssl_certificate"));
        assert!(!text.contains("listen 443"));
    }

    #[test]
    fn test_render_emits_ssl_directives_with_tls() {
        let mut config = sample_config();
        config.servers[0].ssl = true;
        config.servers[0].ssl_certificate = "/etc/nginx/ssl/cafe-secret.pem".to_string();
        config.servers[0].ssl_certificate_key = "/etc/nginx/ssl/cafe-secret.pem".to_string();

        let text = render_ingress_config(&config);

        assert!(text.contains("listen 443 ssl;"));
        assert!(text.contains("ssl_certificate /etc/nginx/ssl/cafe-secret.pem;"));
        assert!(text.contains("ssl_certificate_key /etc/nginx/ssl/cafe-secret.pem;"));
    }

    #[test]
    fn test_render_main_config_includes_hash_settings() {
        let main = MainConfig {
            server_names_hash_bucket_size: "128".to_string(),
            server_names_hash_max_size: "1024".to_string(),
        };

        let text = render_main_config(&main);

        assert!(text.contains("server_names_hash_max_size 1024;"));
        assert!(text.contains("server_names_hash_bucket_size 128;"));
    }

    #[test]
    fn test_render_main_config_skips_empty_bucket_size() {
        let main = MainConfig {
            server_names_hash_bucket_size: String::new(),
            server_names_hash_max_size: "512".to_string(),
        };

        let text = render_main_config(&main);

        assert!(!text.contains("server_names_hash_bucket_size"));
    }

    #[test]
    fn test_controller_writes_and_deletes_ingress_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut nginx = NginxController::new(dir.path(), false);

        nginx.add_or_update_ingress("default-cafe", &sample_config());
        let conf = dir.path().join("conf.d").join("default-cafe.conf");
        assert!(conf.exists());

        nginx.delete_ingress("default-cafe");
        assert!(!conf.exists());
    }

    #[test]
    fn test_controller_local_mode_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut nginx = NginxController::new(dir.path(), true);

        nginx.add_or_update_ingress("default-cafe", &sample_config());
        assert!(!dir.path().join("conf.d").exists());
    }

    #[test]
    fn test_cert_and_key_written_to_single_pem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut nginx = NginxController::new(dir.path(), false);

        let pem_file =
            nginx.add_or_update_cert_and_key("cafe-secret", b"CERT DATA\n", b"KEY DATA\n");

        assert_eq!(
            pem_file,
            dir.path().join("ssl").join("cafe-secret.pem").display().to_string()
        );
        let written = fs::read_to_string(&pem_file).expect("pem file");
        assert_eq!(written, "CERT DATA\nKEY DATA\n");
    }
}
