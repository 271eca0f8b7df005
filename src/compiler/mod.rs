//! Desired-state compiler
//!
//! Pure function from validated `(Base, Application)` inputs to the full set
//! of objects the Application should own. No I/O, no clock, no randomness:
//! the same inputs always produce identical output.
//!
//! # Architecture
//!
//! [`compile`] delegates to:
//! - [`ConfigRenderer`]: Secret contents
//! - [`WorkloadCompiler`](crate::workload::WorkloadCompiler): Deployment, Service, Secret
//! - [`compile_topics`]: one KafkaTopic per requested topic

mod render;

pub use render::{config_hash, ConfigRenderer, JsonConfigRenderer, CONFIG_FILE_KEY};
#[cfg(test)]
pub use render::MockConfigRenderer;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};

use crate::crd::{KafkaTopic, KafkaTopicSpec};
use crate::schema::ValidatedInputs;
use crate::workload::{derived_meta, WorkloadCompiler};
use crate::Error;

/// Every object an Application should own
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    /// The workload
    pub deployment: Deployment,
    /// The metrics Service
    pub service: Service,
    /// The configuration Secret
    pub secret: Secret,
    /// One topic per request, in request order
    pub topics: Vec<KafkaTopic>,
}

impl DesiredState {
    /// Total number of objects
    pub fn object_count(&self) -> usize {
        3 + self.topics.len()
    }
}

/// Compile validated inputs into the desired object set
pub fn compile(
    inputs: &ValidatedInputs,
    renderer: &dyn ConfigRenderer,
) -> Result<DesiredState, Error> {
    let data = renderer.render(inputs)?;
    let hash = config_hash(&data);

    Ok(DesiredState {
        deployment: WorkloadCompiler::compile_deployment(inputs, &hash),
        service: WorkloadCompiler::compile_service(inputs),
        secret: WorkloadCompiler::compile_secret(inputs, &data),
        topics: compile_topics(inputs),
    })
}

/// One KafkaTopic per request, named after the topic.
///
/// The requested partition count is carried in `spec.replicas` and
/// `spec.partitions` is left to the messaging operator's default. Duplicate
/// names are kept; the sync stage rejects the later ones.
pub fn compile_topics(inputs: &ValidatedInputs) -> Vec<KafkaTopic> {
    inputs
        .topics
        .iter()
        .map(|request| KafkaTopic {
            metadata: derived_meta(&request.topic_name, inputs),
            spec: KafkaTopicSpec {
                replicas: Some(request.partitions),
                ..Default::default()
            },
        })
        .collect()
}
