use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nginx_ingress_controller::controller::{ConfigMapRef, LoadBalancerController};
use nginx_ingress_controller::nginx::{Config, Configurator, NginxController};
use nginx_ingress_controller::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of a kubectl proxy to connect through. When set, the controller
    /// runs in local mode: generated configuration is printed to stdout
    /// instead of written to disk and NGINX is not reloaded.
    #[arg(long, env = "PROXY_URL")]
    proxy: Option<String>,

    /// Namespace to watch for Ingress/Services/Endpoints. Watches all
    /// namespaces by default.
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// ConfigMap customizing NGINX configuration, as <namespace>/<name>.
    #[arg(long, env = "NGINX_CONFIGMAPS")]
    nginx_configmaps: Option<String>,

    /// Directory holding the NGINX configuration.
    #[arg(long, env = "NGINX_CONF_PATH", default_value = "/etc/nginx")]
    nginx_conf_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    info!(
        "Starting NGINX Ingress Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let nginx_config_map = args
        .nginx_configmaps
        .as_deref()
        .map(|s| s.parse::<ConfigMapRef>())
        .transpose()?;

    let local = args.proxy.is_some();
    let client = match &args.proxy {
        Some(url) => {
            let uri = url
                .parse()
                .map_err(|e| Error::ConfigError(format!("Invalid proxy URL {}: {}", url, e)))?;
            Client::try_from(kube::Config::new(uri)).map_err(Error::KubeError)?
        }
        None => Client::try_default().await.map_err(Error::KubeError)?,
    };

    info!("Connected to Kubernetes cluster");
    if local {
        info!("Local mode: configuration is printed, NGINX is not reloaded");
    }

    let nginx = NginxController::new(&args.nginx_conf_path, local);
    let configurator = Arc::new(Configurator::new(nginx, Config::default()));
    let controller = LoadBalancerController::new(
        client,
        args.watch_namespace,
        configurator,
        nginx_config_map,
    );

    tokio::select! {
        result = controller.run() => result,
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
