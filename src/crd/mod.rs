//! Custom Resource Definitions for weaver
//!
//! This module contains the CRDs the controller watches (Base, Application)
//! and the shape of the externally-owned KafkaTopic it declares.

mod application;
mod base;
mod topic;
mod types;

pub use application::{Application, ApplicationSpec, ApplicationStatus, TopicRequest};
pub use base::{Base, BaseSpec, DEFAULT_METRICS_PATH};
pub use topic::{KafkaTopic, KafkaTopicSpec};
pub use types::{AppPhase, Condition, ConditionStatus, DerivedRef};
