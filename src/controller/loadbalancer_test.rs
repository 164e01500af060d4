//! Unit tests for the watch layer's reference resolution helpers.

use std::collections::HashMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::loadbalancer::{ingresses_for_service, referenced_services};
use super::ConfigMapRef;

fn backend(service: &str) -> IngressBackend {
    IngressBackend {
        service: Some(IngressServiceBackend {
            name: service.to_string(),
            port: Some(ServiceBackendPort {
                number: Some(80),
                ..Default::default()
            }),
        }),
        ..Default::default()
    }
}

fn ingress(namespace: &str, name: &str, default_backend: Option<&str>, services: &[&str]) -> Ingress {
    let rules = if services.is_empty() {
        None
    } else {
        Some(vec![IngressRule {
            host: Some("example.com".to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: services
                    .iter()
                    .map(|service| HTTPIngressPath {
                        path: Some(format!("/{}", service)),
                        path_type: "Prefix".to_string(),
                        backend: backend(service),
                    })
                    .collect(),
            }),
        }])
    };

    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            default_backend: default_backend.map(backend),
            rules,
            ..Default::default()
        }),
        status: None,
    }
}

#[test]
fn test_referenced_services_collects_default_backend_and_paths() {
    let ing = ingress("default", "cafe", Some("tea-svc"), &["coffee-svc", "tea-svc"]);

    let services = referenced_services(&ing);

    assert_eq!(
        services.into_iter().collect::<Vec<_>>(),
        vec!["coffee-svc".to_string(), "tea-svc".to_string()]
    );
}

#[test]
fn test_referenced_services_empty_spec() {
    let ing = Ingress {
        metadata: ObjectMeta {
            name: Some("bare".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: None,
        status: None,
    };

    assert!(referenced_services(&ing).is_empty());
}

#[test]
fn test_endpoints_fan_out_matches_namespace_and_service() {
    let mut index = HashMap::new();
    index.insert(
        "default/cafe".to_string(),
        ingress("default", "cafe", None, &["coffee-svc"]),
    );
    index.insert(
        "default/shop".to_string(),
        ingress("default", "shop", None, &["shop-svc"]),
    );
    index.insert(
        "other/cafe".to_string(),
        ingress("other", "cafe", None, &["coffee-svc"]),
    );

    let affected = ingresses_for_service(&index, "default", "coffee-svc");

    assert_eq!(affected.len(), 1);
    assert_eq!(affected[0].metadata.name.as_deref(), Some("cafe"));
    assert_eq!(affected[0].metadata.namespace.as_deref(), Some("default"));
}

#[test]
fn test_endpoints_fan_out_includes_default_backend_references() {
    let mut index = HashMap::new();
    index.insert(
        "default/cafe".to_string(),
        ingress("default", "cafe", Some("tea-svc"), &[]),
    );

    let affected = ingresses_for_service(&index, "default", "tea-svc");

    assert_eq!(affected.len(), 1);
}

#[test]
fn test_config_map_ref_parses_namespaced_name() {
    let reference: ConfigMapRef = "nginx/nginx-config".parse().expect("valid reference");

    assert_eq!(
        reference,
        ConfigMapRef {
            namespace: "nginx".to_string(),
            name: "nginx-config".to_string(),
        }
    );
}

#[test]
fn test_config_map_ref_rejects_bare_name() {
    assert!("nginx-config".parse::<ConfigMapRef>().is_err());
    assert!("/nginx-config".parse::<ConfigMapRef>().is_err());
    assert!("nginx/".parse::<ConfigMapRef>().is_err());
}
