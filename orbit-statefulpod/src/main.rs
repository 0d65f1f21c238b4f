use anyhow::Result;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orbit_statefulpod::config::OperatorConfig;
use orbit_statefulpod::crd::StatefulPod;
use orbit_statefulpod::dispatcher::Dispatcher;
use orbit_statefulpod::store::KubeStore;
use orbit_statefulpod::Reconciler;

#[derive(Parser)]
#[command(name = "orbit-statefulpod")]
#[command(about = "Kubernetes operator for ordered, stateful replica sets")]
struct Args {
    /// Kubernetes namespace to watch (empty = all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Operator configuration file (TOML, or YAML by extension)
    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Health probe bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable development mode (more verbose logging)
    #[arg(long, env = "DEV_MODE")]
    dev_mode: bool,

    /// Print the StatefulPod CRD manifest and exit
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&StatefulPod::crd())?);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if args.dev_mode { "debug" } else { args.log_level.as_str() };
        EnvFilter::new(format!("orbit_statefulpod={},kube=warn", level))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(args.dev_mode)
                .with_level(true)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .init();

    info!("Starting Orbit StatefulPod operator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Watch namespace: {:?}", args.namespace);
    info!("Health address: {}", args.health_addr);

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            OperatorConfig::from_file(path)?
        }
        None => OperatorConfig::default(),
    };
    let config = Arc::new(config);

    let client = Client::try_default().await?;
    info!("Kubernetes client initialized");

    let store = Arc::new(KubeStore::new(client.clone()));
    let reconciler = Reconciler::new(store, Arc::clone(&config));
    let dispatcher = Dispatcher::new(client, reconciler, config);

    let health_server = start_health_server(args.health_addr.clone());
    let dispatch_task = tokio::spawn(dispatcher.run(args.namespace.clone()));

    info!("StatefulPod controller started");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = dispatch_task => {
            warn!("StatefulPod controller exited unexpectedly");
        }
        result = health_server => {
            warn!("Health server exited unexpectedly: {:?}", result);
        }
    }

    info!("Orbit StatefulPod operator shutdown complete");
    Ok(())
}

async fn start_health_server(addr: String) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    fn respond(status: StatusCode, body: &'static str) -> Response<Body> {
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        response
    }

    async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        Ok(match req.uri().path() {
            "/healthz" => respond(StatusCode::OK, r#"{"status":"healthy"}"#),
            "/readyz" => respond(StatusCode::OK, r#"{"status":"ready"}"#),
            _ => respond(StatusCode::NOT_FOUND, r#"{"status":"not found"}"#),
        })
    }

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let addr: SocketAddr = addr.parse()?;
    let server = Server::bind(&addr).serve(make_svc);

    info!("Health server listening on {}", addr);
    server.await?;
    Ok(())
}
