//! Watch layer driving the Configurator.
//!
//! Observes Ingress, Endpoints and (optionally) a ConfigMap, resolves each
//! Ingress's referenced Secrets and Endpoints into a snapshot, and invokes
//! the Configurator for every change.

mod loadbalancer;
#[cfg(test)]
mod loadbalancer_test;

pub use loadbalancer::{ConfigMapRef, LoadBalancerController};
