//! Schema validation and defaulting for Base/Application pairs
//!
//! Everything here is side-effect free. The compiler only ever sees
//! [`ValidatedInputs`], so it never has to re-check field ranges.

use crate::crd::{Application, Base, TopicRequest, DEFAULT_METRICS_PATH};
use crate::Error;

/// Maximum length of a DNS-1123 label
const MAX_LABEL_LEN: usize = 63;
/// Maximum length of a DNS-1123 subdomain
const MAX_SUBDOMAIN_LEN: usize = 253;

/// A Base/Application pair that passed validation, with defaults applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedInputs {
    /// Namespace shared by the Application, its Base and all derived objects
    pub namespace: String,
    /// Application name
    pub app_name: String,
    /// Base name
    pub base_name: String,
    /// Container image
    pub image: String,
    /// Web port from the Base
    pub web_port: i32,
    /// Metrics port from the Base
    pub metrics_port: i32,
    /// Metrics path from the Base, defaulted
    pub metrics_path: String,
    /// Requested topics, in declaration order
    pub topics: Vec<TopicRequest>,
}

/// Validate the parts of an Application that do not depend on its Base.
///
/// Run before the Base is resolved so a malformed reference is reported as a
/// validation failure rather than an endless not-found retry.
pub fn validate_application(app: &Application) -> Result<(), Error> {
    let name = app
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::validation("application has no metadata.name"))?;
    if app.metadata.namespace.is_none() {
        return Err(Error::validation(format!(
            "application '{}' must be namespaced",
            name
        )));
    }

    validate_image(&app.spec.image)?;

    validate_dns_label(&app.spec.base)
        .map_err(|msg| Error::validation(format!("spec.base: {}", msg)))?;

    for (i, topic) in app.spec.kafka_topics.iter().enumerate() {
        validate_topic(i, topic)?;
    }

    Ok(())
}

/// Validate a resolved Base/Application pair and apply defaults
pub fn validate(base: &Base, app: &Application) -> Result<ValidatedInputs, Error> {
    validate_application(app)?;

    let namespace = app.metadata.namespace.clone().unwrap_or_default();
    let base_namespace = base.metadata.namespace.as_deref().unwrap_or_default();
    if base_namespace != namespace {
        return Err(Error::validation(format!(
            "base '{}' is in namespace '{}', application is in '{}'",
            app.spec.base, base_namespace, namespace
        )));
    }

    validate_port("webPort", base.spec.web_port)?;
    validate_port("metricsPort", base.spec.metrics_port)?;

    let metrics_path = if base.spec.metrics_path.is_empty() {
        DEFAULT_METRICS_PATH.to_string()
    } else {
        base.spec.metrics_path.clone()
    };
    if !metrics_path.starts_with('/') {
        return Err(Error::validation(format!(
            "metricsPath '{}' must start with '/'",
            metrics_path
        )));
    }

    Ok(ValidatedInputs {
        namespace,
        app_name: app.metadata.name.clone().unwrap_or_default(),
        base_name: app.spec.base.clone(),
        image: app.spec.image.clone(),
        web_port: base.spec.web_port,
        metrics_port: base.spec.metrics_port,
        metrics_path,
        topics: app.spec.kafka_topics.clone(),
    })
}

fn validate_image(image: &str) -> Result<(), Error> {
    if image.is_empty() {
        return Err(Error::validation("spec.image cannot be empty"));
    }

    if image.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::validation(format!(
            "spec.image '{}' contains invalid characters",
            image
        )));
    }

    Ok(())
}

fn validate_port(field: &str, port: i32) -> Result<(), Error> {
    if !(1..=65535).contains(&port) {
        return Err(Error::validation(format!(
            "{} {} is out of range (1-65535)",
            field, port
        )));
    }
    Ok(())
}

fn validate_topic(index: usize, topic: &TopicRequest) -> Result<(), Error> {
    validate_dns_subdomain(&topic.topic_name).map_err(|msg| {
        Error::validation(format!("spec.kafkaTopics[{}].topicName: {}", index, msg))
    })?;

    if topic.partitions < 1 {
        return Err(Error::validation(format!(
            "spec.kafkaTopics[{}].partitions must be at least 1, got {}",
            index, topic.partitions
        )));
    }

    Ok(())
}

/// Validate a DNS-1123 label (object references such as `spec.base`).
///
/// Rules:
/// - 1 to 63 characters
/// - lowercase alphanumeric or '-'
/// - starts and ends with an alphanumeric character
pub fn validate_dns_label(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if s.len() > MAX_LABEL_LEN {
        return Err(format!(
            "name '{}' exceeds {} characters",
            s, MAX_LABEL_LEN
        ));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "name '{}' must be lowercase alphanumeric with hyphens",
            s
        ));
    }
    if s.starts_with('-') || s.ends_with('-') {
        return Err(format!("name '{}' must start and end with alphanumeric", s));
    }
    Ok(())
}

/// Validate a DNS-1123 subdomain (dot-separated labels, up to 253 characters)
pub fn validate_dns_subdomain(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if s.len() > MAX_SUBDOMAIN_LEN {
        return Err(format!(
            "name '{}' exceeds {} characters",
            s, MAX_SUBDOMAIN_LEN
        ));
    }
    for part in s.split('.') {
        validate_dns_label(part).map_err(|_| {
            format!(
                "name '{}' must be lowercase alphanumeric, '-' or '.', starting and ending with alphanumeric",
                s
            )
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ApplicationSpec, BaseSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rstest::rstest;

    fn sample_base() -> Base {
        Base {
            metadata: ObjectMeta {
                name: Some("shared".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: BaseSpec {
                web_port: 8080,
                metrics_port: 9000,
                metrics_path: "/metrics".to_string(),
            },
        }
    }

    fn sample_app() -> Application {
        Application {
            metadata: ObjectMeta {
                name: Some("inventory".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ApplicationSpec {
                image: "test:test".to_string(),
                base: "shared".to_string(),
                kafka_topics: vec![TopicRequest {
                    topic_name: "inventory".to_string(),
                    partitions: 32,
                }],
            },
            status: None,
        }
    }

    #[test]
    fn story_valid_pair_is_flattened_for_the_compiler() {
        let inputs = validate(&sample_base(), &sample_app()).unwrap();
        assert_eq!(inputs.namespace, "default");
        assert_eq!(inputs.app_name, "inventory");
        assert_eq!(inputs.base_name, "shared");
        assert_eq!(inputs.image, "test:test");
        assert_eq!(inputs.metrics_port, 9000);
        assert_eq!(inputs.topics.len(), 1);
    }

    #[test]
    fn story_empty_metrics_path_gets_default() {
        let mut base = sample_base();
        base.spec.metrics_path = String::new();
        let inputs = validate(&base, &sample_app()).unwrap();
        assert_eq!(inputs.metrics_path, "/metrics");
    }

    #[test]
    fn story_empty_image_is_rejected() {
        let mut app = sample_app();
        app.spec.image = String::new();
        let err = validate(&sample_base(), &app).unwrap_err();
        assert!(err.to_string().contains("spec.image cannot be empty"));
    }

    #[rstest]
    #[case::empty("")]
    #[case::uppercase("Shared")]
    #[case::leading_hyphen("-shared")]
    #[case::dotted("shared.base")]
    fn test_malformed_base_reference_is_rejected(#[case] base_ref: &str) {
        let mut app = sample_app();
        app.spec.base = base_ref.to_string();
        let err = validate_application(&app).unwrap_err();
        assert!(err.to_string().contains("spec.base"));
    }

    #[rstest]
    #[case::zero(0)]
    #[case::negative(-1)]
    #[case::too_large(70000)]
    fn test_out_of_range_ports_are_rejected(#[case] port: i32) {
        let mut base = sample_base();
        base.spec.metrics_port = port;
        assert!(validate(&base, &sample_app()).is_err());
    }

    #[test]
    fn test_topic_with_zero_partitions_is_rejected() {
        let mut app = sample_app();
        app.spec.kafka_topics[0].partitions = 0;
        let err = validate_application(&app).unwrap_err();
        assert!(err.to_string().contains("kafkaTopics[0].partitions"));
    }

    #[test]
    fn test_topic_names_follow_object_naming_rules() {
        let mut app = sample_app();
        app.spec.kafka_topics[0].topic_name = "platform.inventory-events".to_string();
        assert!(validate_application(&app).is_ok());

        app.spec.kafka_topics[0].topic_name = "Inventory_Events".to_string();
        assert!(validate_application(&app).is_err());
    }

    /// Duplicate topic names are accepted here; the second write is rejected
    /// as a conflict when the topics are synced.
    #[test]
    fn test_duplicate_topic_names_pass_validation() {
        let mut app = sample_app();
        app.spec.kafka_topics.push(TopicRequest {
            topic_name: "inventory".to_string(),
            partitions: 8,
        });
        assert!(validate_application(&app).is_ok());
    }

    #[test]
    fn test_base_in_other_namespace_is_rejected() {
        let mut base = sample_base();
        base.metadata.namespace = Some("other".to_string());
        let err = validate(&base, &sample_app()).unwrap_err();
        assert!(err.to_string().contains("namespace"));
    }

    #[test]
    fn test_metrics_path_must_be_absolute() {
        let mut base = sample_base();
        base.spec.metrics_path = "metrics".to_string();
        assert!(validate(&base, &sample_app()).is_err());
    }

    #[test]
    fn test_validation_is_side_effect_free() {
        let base = sample_base();
        let app = sample_app();
        let first = validate(&base, &app).unwrap();
        let second = validate(&base, &app).unwrap();
        assert_eq!(first, second);
        assert_eq!(app, sample_app());
    }
}
