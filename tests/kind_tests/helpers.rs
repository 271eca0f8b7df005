//! Test helpers for integration tests
//!
//! Provides utilities for managing the kind cluster, CRDs and an in-process
//! controller.

use std::process::Command;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, Config, CustomResourceExt};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use weaver::config::ControllerConfig;
use weaver::controller::{kube_events, Context, Controller};
use weaver::crd::{Application, Base, KafkaTopic};
use weaver::store::KubeStore;

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "weaver-integration-test";

/// Global lock to ensure cluster is created only once
static CLUSTER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Track if CRDs have been installed (async-safe)
static CRDS_INSTALLED: OnceCell<Result<(), String>> = OnceCell::const_new();

/// Check if a kind cluster with the given name exists
pub fn kind_cluster_exists(name: &str) -> bool {
    let output = Command::new("kind")
        .args(["get", "clusters"])
        .output()
        .expect("failed to run kind");

    let clusters = String::from_utf8_lossy(&output.stdout);
    clusters.lines().any(|line| line.trim() == name)
}

/// Create a kind cluster for testing
pub fn create_kind_cluster(name: &str) -> Result<(), String> {
    if kind_cluster_exists(name) {
        println!("Kind cluster '{name}' already exists, reusing it");
        return Ok(());
    }

    println!("Creating kind cluster '{name}'...");
    let output = Command::new("kind")
        .args(["create", "cluster", "--name", name, "--wait", "60s"])
        .output()
        .map_err(|e| format!("failed to run kind: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "failed to create kind cluster: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    Ok(())
}

/// Server-side apply the Base and Application CRDs, plus a stand-in
/// KafkaTopic CRD since the messaging operator is not installed in kind
pub async fn install_crds(client: &Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("weaver-integration-test").force();

    for crd in [Base::crd(), Application::crd(), KafkaTopic::crd()] {
        let name = crd.metadata.name.clone().unwrap();
        println!("Installing CRD {name}...");
        crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
    }

    // Wait for CRDs to be established
    sleep(Duration::from_secs(2)).await;
    Ok(())
}

/// Create a Kubernetes client connected to the test cluster
pub async fn create_test_client() -> Result<Client, String> {
    let context_name = format!("kind-{TEST_CLUSTER_NAME}");

    let config = Config::from_kubeconfig(&kube::config::KubeConfigOptions {
        context: Some(context_name),
        ..Default::default()
    })
    .await
    .map_err(|e| format!("failed to load kubeconfig: {e}"))?;

    Client::try_from(config).map_err(|e| format!("failed to create client: {e}"))
}

/// Ensure the test cluster is ready (cluster created once, CRDs installed once)
///
/// Returns a fresh Client for each call.
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let cluster_result = CLUSTER_INIT.get_or_init(|| create_kind_cluster(TEST_CLUSTER_NAME));
    cluster_result.clone()?;

    let client = create_test_client().await?;

    CRDS_INSTALLED
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crds(&client)
                .await
                .map_err(|e| format!("failed to install CRDs: {e}"))
        })
        .await
        .clone()?;

    Ok(client)
}

/// Create a fresh namespace for one test, deleting any leftover from a
/// previous run
pub async fn fresh_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    if api.get_opt(name).await.expect("failed to get namespace").is_some() {
        let _ = api.delete(name, &DeleteParams::default()).await;
        let api = &api;
        wait_until(Duration::from_secs(120), || async move {
            matches!(api.get_opt(name).await, Ok(None))
        })
        .await;
    }

    let ns = Namespace {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(&PostParams::default(), &ns)
        .await
        .expect("failed to create namespace");
}

/// A controller running in the test process, scoped to one namespace
pub struct RunningController {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningController {
    /// Start a controller watching `namespace`
    pub fn start(client: Client, namespace: &str) -> Self {
        let config = ControllerConfig {
            watch_namespace: Some(namespace.to_string()),
            base_fetch_delay_ms: 200,
            backoff_initial_ms: 200,
            backoff_max_secs: 5,
            ..Default::default()
        };
        let ctx = Context::builder(Arc::new(KubeStore::new(client.clone())))
            .config(config)
            .build();

        let shutdown = CancellationToken::new();
        let events = kube_events(client, Some(namespace));
        let controller = Controller::new(Arc::new(ctx));
        let handle = tokio::spawn(controller.run(events, shutdown.clone()));

        Self { shutdown, handle }
    }

    /// Stop the controller and wait for it to exit
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Poll `check` once a second until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_secs(1)).await;
    }
    false
}
