//! Weaver - compiles Base and Application resources into platform objects

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use weaver::config::ControllerConfig;
use weaver::controller::{kube_events, Context, Controller};
use weaver::crd::{Application, Base};
use weaver::retry::{retry_with_backoff, RetryConfig};
use weaver::store::KubeStore;
use weaver::FIELD_MANAGER;

/// Weaver - CRD-driven controller for Base + Application workloads
#[derive(Parser, Debug)]
#[command(name = "weaver", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    ///
    /// Watches Applications and Bases and keeps each Application's
    /// Deployment, Service, configuration Secret and KafkaTopics converged.
    Controller,

    /// Print the Base and Application CRD manifests and exit
    Crd,
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Server-side apply the CRDs before starting
    #[arg(long, env = "WEAVER_INSTALL_CRDS")]
    install_crds: bool,

    #[command(flatten)]
    config: ControllerConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weaver=info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Crd) => print_crds(),
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

fn print_crds() -> anyhow::Result<()> {
    let base = serde_yaml::to_string(&Base::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize Base CRD: {}", e))?;
    let application = serde_yaml::to_string(&Application::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize Application CRD: {}", e))?;
    println!("{base}---\n{application}");
    Ok(())
}

/// Server-side apply the Base and Application CRDs so their versions always
/// match the controller binary
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Base::crd(), Application::crd()] {
        let name = crd
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generated CRD has no name"))?;
        tracing::info!(crd = %name, "Installing CRD");

        let patch = Patch::Apply(&crd);
        retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crd", || {
            crds.patch(&name, &params, &patch)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("Weaver CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Weaver controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let namespace = args.config.watch_namespace.clone();
    let ctx = Context::builder(Arc::new(KubeStore::new(client.clone())))
        .config(args.config)
        .build();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let events = kube_events(client, namespace.as_deref());
    Controller::new(Arc::new(ctx)).run(events, shutdown).await;

    tracing::info!("Weaver controller exited");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, using ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
