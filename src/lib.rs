//! NGINX Ingress Controller for Kubernetes
//!
//! This crate watches Ingress resources and their referenced Secrets and
//! Endpoints, generates NGINX configuration for them, and applies the
//! result atomically against a running NGINX instance.

pub mod controller;
pub mod error;
pub mod nginx;

pub use crate::error::{Error, Result};
