use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use msgate::auth::roble::RobleIdentityProvider;
use msgate::cli;
use msgate::config::{self, Config, RuntimeKind};
use msgate::jobs;
use msgate::probe::ProbeRequest;
use msgate::runtime::docker::DockerRuntime;
use msgate::runtime::memory::MemoryRuntime;
use msgate::runtime::ContainerRuntime;
use msgate::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // OTLP export is opt-in through OTEL_EXPORTER_OTLP_ENDPOINT.
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "msgate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "msgate=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Services { command }) => handle_services_command(cfg, command).await,
        Some(cli::Commands::Probe {
            id,
            endpoint,
            method,
            body,
        }) => handle_probe_command(cfg, id, endpoint, method, body).await,
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn connect_runtime(cfg: &Config) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    match cfg.runtime {
        RuntimeKind::Docker => {
            tracing::info!("Connecting to Docker...");
            let docker = DockerRuntime::connect(cfg.docker_socket.as_deref())?;
            if let Err(e) = docker.healthcheck().await {
                // Listing still works from the registry; builds and starts will fail until
                // the daemon comes back.
                tracing::warn!("Docker daemon not reachable yet: {}", e);
            }
            Ok(Arc::new(docker))
        }
        RuntimeKind::Memory => {
            tracing::warn!("Using the in-memory container runtime; no real containers will run");
            Ok(Arc::new(MemoryRuntime::new()))
        }
    }
}

async fn build_state(cfg: Config) -> anyhow::Result<Arc<AppState>> {
    let runtime = connect_runtime(&cfg).await?;
    let identity = Arc::new(
        RobleIdentityProvider::new(&cfg.auth.base_url, &cfg.auth.contract)
            .context("failed to build identity client")?,
    );
    AppState::build(cfg, runtime, identity).await
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let reconcile_every = std::time::Duration::from_secs(cfg.reconcile_interval_secs);
    tracing::info!(data_file = %cfg.data_file.display(), "Loading service registry...");
    let state = build_state(cfg).await?;

    if !state.authorizer.is_enabled() {
        tracing::warn!("Control API authentication is disabled");
    }

    let app = msgate::router(state.clone());

    if jobs::reconcile::spawn(state.manager.clone(), reconcile_every).is_some() {
        tracing::info!(
            "Background reconciliation started (every {}s)",
            reconcile_every.as_secs()
        );
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("msgate listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("msgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

async fn handle_services_command(cfg: Config, cmd: cli::ServiceCommands) -> anyhow::Result<()> {
    let state = build_state(cfg).await?;
    let manager = &state.manager;

    match cmd {
        cli::ServiceCommands::List => {
            let list = manager.list().await;
            if !list.reconciled {
                println!("(runtime unavailable, showing stored statuses)");
            }
            println!("{:<36}  {:<30}  {:<8}  URL", "ID", "SERVICE", "STATUS");
            for s in list.services {
                println!(
                    "{:<36}  {:<30}  {:<8}  {}",
                    s.id,
                    s.service_name,
                    s.status.as_str(),
                    s.url.as_deref().unwrap_or("-")
                );
            }
        }
        cli::ServiceCommands::Show { id } => {
            let id = parse_id(&id)?;
            let service = manager.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&service)?);
        }
        cli::ServiceCommands::Delete { id } => {
            let id = parse_id(&id)?;
            let report = manager.delete(id).await?;
            println!("Deleted service {}", id);
            for warning in report.failures {
                println!("  warning: {}", warning);
            }
        }
    }
    Ok(())
}

async fn handle_probe_command(
    cfg: Config,
    id: String,
    endpoint: String,
    method: String,
    body: Option<String>,
) -> anyhow::Result<()> {
    let state = build_state(cfg).await?;
    let service = state.manager.find(parse_id(&id)?).await?;

    let body = body.map(|raw| {
        serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
    });
    let req = ProbeRequest {
        endpoint,
        method,
        headers: Default::default(),
        body,
    };

    let resp = state.probe.send(&service.service_name, &req).await?;
    println!("HTTP {}", resp.status);
    for (name, value) in &resp.headers {
        println!("{}: {}", name, value);
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&resp.data)?);
    Ok(())
}

fn parse_id(id: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(id).with_context(|| format!("invalid service id '{}'", id))
}
