//! Workload resource builders
//!
//! Builds the Deployment, Service and Secret for an Application from its
//! validated inputs. Every field the controller manages is set explicitly,
//! including values the API server would otherwise default (port protocols,
//! Secret volume mode), so a freshly read object compares equal to what was
//! built here.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Secret, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use crate::schema::ValidatedInputs;
use crate::{
    CONFIG_HASH_ANNOTATION, CONFIG_MOUNT_PATH, CONFIG_VOLUME_NAME, LABEL_APPLICATION,
    LABEL_MANAGED_BY, LABEL_NAME, MANAGED_BY,
};

/// Name of the single application container
pub const CONTAINER_NAME: &str = "app";

/// Default mode of the mounted Secret files (0644)
const SECRET_FILE_MODE: i32 = 0o644;

/// Standard labels carried by every derived object
pub fn standard_labels(app_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), app_name.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_APPLICATION.to_string(), app_name.to_string()),
    ])
}

/// Labels the Deployment selects its pods by
pub fn selector_labels(app_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_NAME.to_string(), app_name.to_string())])
}

/// Object metadata shared by derived objects
pub fn derived_meta(name: &str, inputs: &ValidatedInputs) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(inputs.namespace.clone()),
        labels: Some(standard_labels(&inputs.app_name)),
        ..Default::default()
    }
}

/// Compiler for the Application's workload objects
pub struct WorkloadCompiler;

impl WorkloadCompiler {
    /// Name of the configuration Secret for an Application.
    ///
    /// The Secret takes the Application's name so Applications sharing a
    /// namespace never collide; only the pod volume is called
    /// [`CONFIG_VOLUME_NAME`](crate::CONFIG_VOLUME_NAME).
    pub fn secret_name(app_name: &str) -> String {
        app_name.to_string()
    }

    /// Build the configuration Secret from rendered data
    pub fn compile_secret(inputs: &ValidatedInputs, data: &BTreeMap<String, Vec<u8>>) -> Secret {
        Secret {
            metadata: derived_meta(&Self::secret_name(&inputs.app_name), inputs),
            type_: Some("Opaque".to_string()),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Build the metrics Service: one port, the Base's metrics port
    pub fn compile_service(inputs: &ValidatedInputs) -> Service {
        Service {
            metadata: derived_meta(&inputs.app_name, inputs),
            spec: Some(ServiceSpec {
                selector: Some(selector_labels(&inputs.app_name)),
                ports: Some(vec![ServicePort {
                    name: Some("metrics".to_string()),
                    port: inputs.metrics_port,
                    target_port: Some(IntOrString::Int(inputs.metrics_port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the Deployment.
    ///
    /// The pod template is annotated with `config_hash` so a configuration
    /// change rolls the pods.
    pub fn compile_deployment(inputs: &ValidatedInputs, config_hash: &str) -> Deployment {
        let selector = selector_labels(&inputs.app_name);

        let pod_labels = standard_labels(&inputs.app_name);

        let mut ports = vec![ContainerPort {
            name: Some("web".to_string()),
            container_port: inputs.web_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }];
        if inputs.metrics_port != inputs.web_port {
            ports.push(ContainerPort {
                name: Some("metrics".to_string()),
                container_port: inputs.metrics_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(inputs.image.clone()),
            ports: Some(ports),
            volume_mounts: Some(vec![VolumeMount {
                name: CONFIG_VOLUME_NAME.to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Deployment {
            metadata: derived_meta(&inputs.app_name, inputs),
            spec: Some(DeploymentSpec {
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: Some(BTreeMap::from([(
                            CONFIG_HASH_ANNOTATION.to_string(),
                            config_hash.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: Some(vec![Volume {
                            name: CONFIG_VOLUME_NAME.to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(Self::secret_name(&inputs.app_name)),
                                default_mode: Some(SECRET_FILE_MODE),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
