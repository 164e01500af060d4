//! NGINX configuration settings.
//!
//! `Config` is the process-wide baseline applied to every generated
//! location. A per-Ingress overlay copies the baseline and applies the
//! recognized `nginx.org/` annotations on top; the shared baseline itself
//! is only ever replaced wholesale, never mutated in place.

use std::collections::BTreeMap;

const PROXY_CONNECT_TIMEOUT_ANNOTATION: &str = "nginx.org/proxy-connect-timeout";
const PROXY_READ_TIMEOUT_ANNOTATION: &str = "nginx.org/proxy-read-timeout";
const CLIENT_MAX_BODY_SIZE_ANNOTATION: &str = "nginx.org/client-max-body-size";

/// Baseline NGINX settings. Values are kept in NGINX syntax (`60s`, `1m`)
/// and passed through to the rendered configuration verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub proxy_connect_timeout: String,
    pub proxy_read_timeout: String,
    pub client_max_body_size: String,
    pub server_names_hash_bucket_size: String,
    pub server_names_hash_max_size: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            proxy_connect_timeout: "60s".to_string(),
            proxy_read_timeout: "60s".to_string(),
            client_max_body_size: "1m".to_string(),
            // Empty means NGINX picks its own bucket size.
            server_names_hash_bucket_size: String::new(),
            server_names_hash_max_size: "512".to_string(),
        }
    }
}

impl Config {
    /// Build a baseline from a ConfigMap's data, leaving absent keys at
    /// their defaults.
    pub fn from_config_map(data: &BTreeMap<String, String>) -> Self {
        let mut config = Config::default();
        if let Some(v) = data.get("proxy-connect-timeout") {
            config.proxy_connect_timeout = v.clone();
        }
        if let Some(v) = data.get("proxy-read-timeout") {
            config.proxy_read_timeout = v.clone();
        }
        if let Some(v) = data.get("client-max-body-size") {
            config.client_max_body_size = v.clone();
        }
        if let Some(v) = data.get("server-names-hash-bucket-size") {
            config.server_names_hash_bucket_size = v.clone();
        }
        if let Some(v) = data.get("server-names-hash-max-size") {
            config.server_names_hash_max_size = v.clone();
        }
        config
    }

    /// Copy of the baseline with the per-Ingress annotation overrides
    /// applied. Unrecognized annotations are ignored.
    pub fn overlay(&self, annotations: &BTreeMap<String, String>) -> Config {
        let mut config = self.clone();
        if let Some(v) = annotations.get(PROXY_CONNECT_TIMEOUT_ANNOTATION) {
            config.proxy_connect_timeout = v.clone();
        }
        if let Some(v) = annotations.get(PROXY_READ_TIMEOUT_ANNOTATION) {
            config.proxy_read_timeout = v.clone();
        }
        if let Some(v) = annotations.get(CLIENT_MAX_BODY_SIZE_ANNOTATION) {
            config.client_max_body_size = v.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_applies_recognized_annotations() {
        let baseline = Config::default();
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "nginx.org/proxy-connect-timeout".to_string(),
            "10s".to_string(),
        );
        annotations.insert(
            "nginx.org/client-max-body-size".to_string(),
            "8m".to_string(),
        );

        let effective = baseline.overlay(&annotations);

        assert_eq!(effective.proxy_connect_timeout, "10s");
        assert_eq!(effective.client_max_body_size, "8m");
        // Not overridden, stays at baseline.
        assert_eq!(effective.proxy_read_timeout, baseline.proxy_read_timeout);
    }

    #[test]
    fn test_overlay_ignores_unrecognized_annotations() {
        let baseline = Config::default();
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "kubernetes.io/ingress.class".to_string(),
            "nginx".to_string(),
        );
        annotations.insert("nginx.org/unknown-key".to_string(), "value".to_string());

        let effective = baseline.overlay(&annotations);

        assert_eq!(effective, baseline);
    }

    #[test]
    fn test_overlay_does_not_mutate_baseline() {
        let baseline = Config::default();
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "nginx.org/proxy-read-timeout".to_string(),
            "300s".to_string(),
        );

        let _effective = baseline.overlay(&annotations);

        assert_eq!(baseline.proxy_read_timeout, "60s");
    }

    #[test]
    fn test_from_config_map_partial_data() {
        let mut data = BTreeMap::new();
        data.insert("proxy-read-timeout".to_string(), "120s".to_string());
        data.insert(
            "server-names-hash-max-size".to_string(),
            "1024".to_string(),
        );

        let config = Config::from_config_map(&data);

        assert_eq!(config.proxy_read_timeout, "120s");
        assert_eq!(config.server_names_hash_max_size, "1024");
        assert_eq!(config.proxy_connect_timeout, "60s");
        assert_eq!(config.client_max_body_size, "1m");
    }

    #[test]
    fn test_from_config_map_empty_data_is_default() {
        let config = Config::from_config_map(&BTreeMap::new());
        assert_eq!(config, Config::default());
    }
}
