use actix_web::{middleware, web, web::Data, App, HttpResponse, HttpServer, Responder};
use ns_manager::config::Settings;
use ns_manager::context::{State, ACTION_CONTROLLER, COLLECT_CONTROLLER};
use ns_manager::error::Error;
use ns_manager::leader::{LeaderArbiter, Leadership};
use ns_manager::telemetry;
use ns_manager::{action, collect, people};
use ns_manager_k8s_util::client::instrumented_client;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{crate_authors, crate_description, crate_version, Parser, Subcommand};
use kube::Config;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;

async fn metrics_endpoint(state: Data<State>) -> HttpResponse {
    match state.metrics_text() {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(metrics),
        Err(e) => {
            tracing::error!("failed to encode metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn health_endpoint() -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[derive(Parser)]
#[command(
    name = "ns-manager",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to the configuration document.
    #[arg(long, env = "CONFIG_PATH", default_value = "/etc/ns-manager/config.yaml")]
    config_path: PathBuf,

    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    /// Example: "info,kube=debug,ns_manager=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint; tracing is disabled
    /// when unset.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Ratio of traces to sample.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[derive(Subcommand)]
enum Command {
    /// Run the collect and action control loops plus the metrics server.
    Run,
    /// One-shot classification of a single namespace (child-job action).
    CheckNamespace {
        #[arg(long)]
        target_namespace: String,
    },
    /// Resolve a namespace's owner and publish it (child-job action).
    GetOwnerInfo {
        #[arg(long)]
        target_namespace: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = telemetry::init(
        &args.log_filter,
        args.log_format.clone(),
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await
    {
        eprintln!("telemetry initialization failed: {e}");
        std::process::exit(2);
    }

    let settings = match Settings::load(&args.config_path) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            tracing::error!(%e, "configuration error");
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = run(args, settings).await {
        tracing::error!(%e, "exiting");
        std::process::exit(e.exit_code());
    }
}

async fn run(args: Args, settings: Arc<Settings>) -> Result<(), Error> {
    let mut registry = Registry::with_prefix("ns-manager");
    let kube_config = Config::infer()
        .await
        .map_err(|e| Error::Config(format!("cannot infer Kubernetes config: {e}")))?;
    let client = instrumented_client(kube_config, &mut registry)?;
    let state = State::new(registry);
    let ctx = state.to_context(client, settings.clone())?;

    match args.command {
        Command::CheckNamespace { target_namespace } => {
            return collect::check_namespace_once(&ctx, &target_namespace).await;
        }
        Command::GetOwnerInfo { target_namespace } => {
            let people_gateway = ctx
                .people
                .as_ref()
                .ok_or_else(|| Error::Config("people_api is not configured".into()))?;
            return people::resolve_and_annotate(&ctx.gateway, people_gateway, &target_namespace)
                .await;
        }
        Command::Run => {}
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let (collect_leadership, action_leadership) = if settings.leader_election.enabled {
        let election = &settings.leader_election;
        let collect_arbiter = Arc::new(LeaderArbiter::new(
            &election.path,
            COLLECT_CONTROLLER,
            election.lease_ttl,
        )?);
        let action_arbiter = Arc::new(LeaderArbiter::new(
            &election.path,
            ACTION_CONTROLLER,
            election.lease_ttl,
        )?);
        tokio::spawn(collect_arbiter.clone().run(shutdown.clone()));
        tokio::spawn(action_arbiter.clone().run(shutdown.clone()));
        (
            Leadership::Elected(collect_arbiter),
            Leadership::Elected(action_arbiter),
        )
    } else {
        tracing::warn!("leader election is disabled; assuming single replica");
        (Leadership::Standalone, Leadership::Standalone)
    };

    let collect_loop = collect::run(ctx.clone(), collect_leadership, shutdown.clone());
    let action_loop = action::run(ctx.clone(), action_leadership, shutdown.clone());

    if settings.metrics.enabled {
        let registry_path = settings.metrics.registry_path.clone();
        let server_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(Data::new(server_state.clone()))
                .wrap(middleware::Logger::default().exclude("/health"))
                .route(&registry_path, web::get().to(metrics_endpoint))
                .route("/health", web::get().to(health_endpoint))
        })
        .bind(format!("0.0.0.0:{}", args.port))
        .map_err(|e| Error::Runtime(format!("cannot bind metrics server: {e}")))?
        .shutdown_timeout(5);

        // All three implement graceful shutdown; wait for every one.
        let (_, _, served) = tokio::join!(collect_loop, action_loop, server.run());
        served.map_err(|e| Error::Runtime(format!("metrics server failed: {e}")))?;
    } else {
        tokio::join!(collect_loop, action_loop);
    }
    Ok(())
}
