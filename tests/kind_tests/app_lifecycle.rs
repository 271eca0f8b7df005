//! Integration tests for the Application lifecycle
//!
//! Each story runs the controller in-process against the kind cluster, scoped
//! to its own namespace so stories do not observe each other's objects.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;

use weaver::crd::{
    AppPhase, Application, ApplicationSpec, Base, BaseSpec, KafkaTopic, TopicRequest,
};
use weaver::CONFIG_HASH_ANNOTATION;

use super::helpers::{ensure_test_cluster, fresh_namespace, wait_until, RunningController};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Test Fixtures
// =============================================================================

fn sample_base(namespace: &str) -> Base {
    Base {
        metadata: ObjectMeta {
            name: Some("shared".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: BaseSpec {
            web_port: 8080,
            metrics_port: 9090,
            metrics_path: "/metrics".to_string(),
        },
    }
}

fn sample_app(namespace: &str, topics: &[(&str, i32)]) -> Application {
    Application {
        metadata: ObjectMeta {
            name: Some("inventory".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: ApplicationSpec {
            image: "registry.local/inventory:1.0".to_string(),
            base: "shared".to_string(),
            kafka_topics: topics
                .iter()
                .map(|(name, partitions)| TopicRequest {
                    topic_name: name.to_string(),
                    partitions: *partitions,
                })
                .collect(),
        },
        status: None,
    }
}

async fn phase_of(client: &Client, namespace: &str) -> Option<AppPhase> {
    let apps: Api<Application> = Api::namespaced(client.clone(), namespace);
    apps.get_opt("inventory")
        .await
        .ok()
        .flatten()
        .and_then(|app| app.status)
        .map(|status| status.phase)
}

// =============================================================================
// Application Lifecycle Stories
// =============================================================================

/// Story: A team creates a Base and an Application with one topic
///
/// Expected behavior:
/// - The Deployment, Service, Secret and KafkaTopic all appear, owned by the
///   Application
/// - The Application reports Ready
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_team_deploys_application_with_topic() {
    let client = ensure_test_cluster().await.expect("failed to setup cluster");
    let ns = "weaver-story-deploy";
    fresh_namespace(&client, ns).await;
    let controller = RunningController::start(client.clone(), ns);
    let client = &client;

    let bases: Api<Base> = Api::namespaced(client.clone(), ns);
    let apps: Api<Application> = Api::namespaced(client.clone(), ns);
    bases
        .create(&PostParams::default(), &sample_base(ns))
        .await
        .expect("failed to create base");
    let app = apps
        .create(&PostParams::default(), &sample_app(ns, &[("inventory", 32)]))
        .await
        .expect("failed to create application");

    let ready = wait_until(CONVERGE_TIMEOUT, || async move {
        phase_of(client, ns).await == Some(AppPhase::Ready)
    })
    .await;
    assert!(ready, "application never became Ready");

    let uid = app.metadata.uid.clone().unwrap();
    let deployment = Api::<Deployment>::namespaced(client.clone(), ns)
        .get("inventory")
        .await
        .expect("deployment missing");
    let owners = deployment.metadata.owner_references.clone().unwrap_or_default();
    assert!(owners.iter().any(|o| o.uid == uid && o.controller == Some(true)));

    let service = Api::<Service>::namespaced(client.clone(), ns)
        .get("inventory")
        .await
        .expect("service missing");
    let ports = service.spec.unwrap().ports.unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port, 9090);

    Api::<Secret>::namespaced(client.clone(), ns)
        .get("inventory")
        .await
        .expect("secret missing");

    let topic = Api::<KafkaTopic>::namespaced(client.clone(), ns)
        .get("inventory")
        .await
        .expect("topic missing");
    assert_eq!(topic.spec.replicas, Some(32));

    controller.stop().await;
}

/// Story: An Application arrives before its Base
///
/// Expected behavior:
/// - The Application waits in Pending instead of failing
/// - Once the Base is created, it converges to Ready
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_application_waits_for_its_base() {
    let client = ensure_test_cluster().await.expect("failed to setup cluster");
    let ns = "weaver-story-late-base";
    fresh_namespace(&client, ns).await;
    let controller = RunningController::start(client.clone(), ns);
    let client = &client;

    let apps: Api<Application> = Api::namespaced(client.clone(), ns);
    apps.create(&PostParams::default(), &sample_app(ns, &[]))
        .await
        .expect("failed to create application");

    let pending = wait_until(CONVERGE_TIMEOUT, || async move {
        phase_of(client, ns).await == Some(AppPhase::Pending)
    })
    .await;
    assert!(pending, "application should wait for its base");

    Api::<Base>::namespaced(client.clone(), ns)
        .create(&PostParams::default(), &sample_base(ns))
        .await
        .expect("failed to create base");

    let ready = wait_until(CONVERGE_TIMEOUT, || async move {
        phase_of(client, ns).await == Some(AppPhase::Ready)
    })
    .await;
    assert!(ready, "application should converge once the base exists");

    controller.stop().await;
}

/// Story: A Base changes its web port
///
/// Expected behavior:
/// - The Deployment container port follows the Base
/// - The pod template config hash changes, rolling the pods
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_base_edit_rolls_dependent_deployment() {
    let client = ensure_test_cluster().await.expect("failed to setup cluster");
    let ns = "weaver-story-base-edit";
    fresh_namespace(&client, ns).await;
    let controller = RunningController::start(client.clone(), ns);
    let client = &client;

    let bases: Api<Base> = Api::namespaced(client.clone(), ns);
    bases
        .create(&PostParams::default(), &sample_base(ns))
        .await
        .expect("failed to create base");
    Api::<Application>::namespaced(client.clone(), ns)
        .create(&PostParams::default(), &sample_app(ns, &[]))
        .await
        .expect("failed to create application");

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), ns);
    let deployments = &deployments;
    let hash_of = |d: &Deployment| {
        d.spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(CONFIG_HASH_ANNOTATION).cloned())
    };

    assert!(
        wait_until(CONVERGE_TIMEOUT, || async move {
            deployments.get_opt("inventory").await.ok().flatten().is_some()
        })
        .await
    );
    let before = hash_of(&deployments.get("inventory").await.unwrap());

    bases
        .patch(
            "shared",
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({"spec": {"webPort": 8081}})),
        )
        .await
        .expect("failed to patch base");

    let before = &before;
    let rolled = wait_until(CONVERGE_TIMEOUT, || async move {
        let Ok(Some(d)) = deployments.get_opt("inventory").await else {
            return false;
        };
        let port = d
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.ports.as_ref())
            .and_then(|ports| ports.first())
            .map(|p| p.container_port);
        port == Some(8081) && hash_of(&d) != *before
    })
    .await;
    assert!(rolled, "deployment should follow the base");

    controller.stop().await;
}

/// Story: A team deletes an Application
///
/// Expected behavior:
/// - The cluster garbage collector removes every derived object through the
///   owner references weaver set
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deleting_application_removes_derived_objects() {
    let client = ensure_test_cluster().await.expect("failed to setup cluster");
    let ns = "weaver-story-delete";
    fresh_namespace(&client, ns).await;
    let controller = RunningController::start(client.clone(), ns);
    let client = &client;

    Api::<Base>::namespaced(client.clone(), ns)
        .create(&PostParams::default(), &sample_base(ns))
        .await
        .expect("failed to create base");
    let apps: Api<Application> = Api::namespaced(client.clone(), ns);
    apps.create(&PostParams::default(), &sample_app(ns, &[("events", 3)]))
        .await
        .expect("failed to create application");

    assert!(
        wait_until(CONVERGE_TIMEOUT, || async move {
            phase_of(client, ns).await == Some(AppPhase::Ready)
        })
        .await
    );

    apps.delete("inventory", &DeleteParams::foreground())
        .await
        .expect("failed to delete application");

    let topics: Api<KafkaTopic> = Api::namespaced(client.clone(), ns);
    let services: Api<Service> = Api::namespaced(client.clone(), ns);
    let (topics, services) = (&topics, &services);
    let gone = wait_until(Duration::from_secs(120), || async move {
        matches!(topics.get_opt("events").await, Ok(None))
            && matches!(services.get_opt("inventory").await, Ok(None))
    })
    .await;
    assert!(gone, "derived objects should be garbage collected");

    controller.stop().await;
}
