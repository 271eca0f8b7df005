//! Base Custom Resource Definition
//!
//! A Base holds configuration shared by every Application that references it:
//! the web port, the metrics port and the metrics path.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default path metrics are served on
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Specification for a Base
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "weaver.dev",
    version = "v1alpha1",
    kind = "Base",
    plural = "bases",
    shortname = "wb",
    namespaced,
    printcolumn = r#"{"name":"Web","type":"integer","jsonPath":".spec.webPort"}"#,
    printcolumn = r#"{"name":"Metrics","type":"integer","jsonPath":".spec.metricsPort"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BaseSpec {
    /// Port the application serves traffic on
    pub web_port: i32,

    /// Port the application exposes metrics on
    pub metrics_port: i32,

    /// HTTP path metrics are served on
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.to_string()
}
