//! KafkaTopic resource shape
//!
//! KafkaTopic is owned by an external messaging operator (Strimzi). weaver only
//! declares these objects; it never installs their CRD or realizes topics.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a KafkaTopic
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kafka.strimzi.io",
    version = "v1beta1",
    kind = "KafkaTopic",
    plural = "kafkatopics",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct KafkaTopicSpec {
    /// Topic name on the broker, when it differs from the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,

    /// Number of partitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<i32>,

    /// Replication factor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Topic configuration overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<BTreeMap<String, serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_api_identity_matches_strimzi() {
        assert_eq!(KafkaTopic::api_version(&()), "kafka.strimzi.io/v1beta1");
        assert_eq!(KafkaTopic::kind(&()), "KafkaTopic");
        assert_eq!(KafkaTopic::plural(&()), "kafkatopics");
    }

    #[test]
    fn test_unset_fields_are_omitted() {
        let spec = KafkaTopicSpec {
            replicas: Some(3),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json, serde_json::json!({"replicas": 3}));
    }

    #[test]
    fn test_topics_compare_by_value() {
        let topic = |replicas| {
            KafkaTopic::new(
                "orders",
                KafkaTopicSpec {
                    replicas: Some(replicas),
                    ..Default::default()
                },
            )
        };
        assert_eq!(topic(3), topic(3));
        assert_ne!(topic(3), topic(4));
    }
}
