//! Weaver - compiles Base and Application resources into platform objects
//!
//! An Application names a container image, a Base (shared web/metrics port
//! configuration) and a list of Kafka topics. Weaver keeps a Deployment, a
//! metrics Service, a configuration Secret and one KafkaTopic per requested
//! topic converged to what the pair describes, all owned by the Application.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Base, Application) and the KafkaTopic shape
//! - [`schema`] - Validation and defaulting of Base/Application pairs
//! - [`compiler`] - Pure compilation of validated inputs into desired objects
//! - [`workload`] - Deployment, Service and Secret builders used by the compiler
//! - [`owner`] - Controller owner references on derived objects
//! - [`store`] - Object store boundary (kube-rs, timeout decorator, in-memory)
//! - [`retry`] - Retry-fetch and backoff utilities
//! - [`controller`] - Work queue, worker pool, reconcile and per-kind sync
//! - [`config`] - Controller tuning knobs
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod compiler;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod owner;
pub mod retry;
pub mod schema;
pub mod store;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared Constants
// =============================================================================

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "weaver-controller";

/// Name of the pod volume (and mount) carrying the rendered configuration
pub const CONFIG_VOLUME_NAME: &str = "config-secret";

/// Directory the configuration Secret is mounted at
pub const CONFIG_MOUNT_PATH: &str = "/etc/weaver";

/// Label: application name (also the Deployment selector)
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Label: managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label: owning Application
pub const LABEL_APPLICATION: &str = "weaver.dev/application";

/// Value of [`LABEL_MANAGED_BY`]
pub const MANAGED_BY: &str = "weaver";

/// Pod template annotation carrying a hash of the rendered configuration
pub const CONFIG_HASH_ANNOTATION: &str = "weaver.dev/config-hash";
