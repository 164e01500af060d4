//! NGINX configuration generation and application.
//!
//! This module turns Ingress resources into an NGINX configuration model
//! (upstream groups, virtual servers, locations) and hands the result to a
//! backend that persists it and asks NGINX to reload.

mod config;
mod configurator;
mod controller;
mod model;

pub use config::Config;
pub use configurator::{Configurator, IngressEx};
pub use controller::{NginxBackend, NginxController};
pub use model::{
    IngressNginxConfig, Location, MainConfig, Server, Upstream, UpstreamServer,
};
