//! Application Custom Resource Definition
//!
//! An Application declares a workload: its container image, the Base it draws
//! shared configuration from, and the Kafka topics it needs. The controller
//! compiles it into a Deployment, Service, Secret and one KafkaTopic per
//! requested topic, all owned by the Application.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AppPhase, Condition, DerivedRef};

/// Specification for an Application
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "weaver.dev",
    version = "v1alpha1",
    kind = "Application",
    plural = "applications",
    shortname = "wapp",
    namespaced,
    derive = "PartialEq",
    status = "ApplicationStatus",
    printcolumn = r#"{"name":"Base","type":"string","jsonPath":".spec.base"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// Container image to run
    pub image: String,

    /// Name of the Base (same namespace) this Application uses
    pub base: String,

    /// Kafka topics to declare, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kafka_topics: Vec<TopicRequest>,
}

/// A requested Kafka topic
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopicRequest {
    /// Topic name; becomes the KafkaTopic object name
    pub topic_name: String,

    /// Requested partition count
    pub partitions: i32,
}

/// Status for an Application
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: AppPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Spec generation this status describes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the Application state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Derived objects written during the last reconcile
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_objects: Vec<DerivedRef>,
}

impl ApplicationStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: AppPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        // Remove existing condition of the same type
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Record the derived objects and return self for chaining
    pub fn derived_objects(mut self, mut refs: Vec<DerivedRef>) -> Self {
        refs.sort();
        refs.dedup();
        self.derived_objects = refs;
        self
    }

    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// True when `other` carries the same observable state.
    ///
    /// Condition timestamps and messages are ignored so that an unchanged
    /// reconcile does not rewrite status.
    pub fn is_equivalent(&self, other: &ApplicationStatus) -> bool {
        self.phase == other.phase
            && self.message == other.message
            && self.observed_generation == other.observed_generation
            && self.derived_objects == other.derived_objects
            && self.conditions.len() == other.conditions.len()
            && self.conditions.iter().all(|c| {
                other
                    .get_condition(&c.type_)
                    .map(|o| o.same_state(c))
                    .unwrap_or(false)
            })
    }

    /// Keep `lastTransitionTime` from `previous` for conditions whose state did not change
    pub fn carry_transition_times(mut self, previous: Option<&ApplicationStatus>) -> Self {
        if let Some(prev) = previous {
            for cond in &mut self.conditions {
                if let Some(old) = prev.get_condition(&cond.type_) {
                    if old.same_state(cond) {
                        cond.last_transition_time = old.last_transition_time;
                    }
                }
            }
        }
        self
    }
}

impl Application {
    /// True when the last recorded terminal failure was for the current spec generation
    pub fn failed_at_current_generation(&self) -> bool {
        match &self.status {
            Some(status) => {
                status.phase == AppPhase::Failed
                    && status.observed_generation.is_some()
                    && status.observed_generation == self.metadata.generation
            }
            None => false,
        }
    }
}
