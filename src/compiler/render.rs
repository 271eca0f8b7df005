//! Configuration rendering for the derived Secret

use std::collections::BTreeMap;

#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::schema::ValidatedInputs;
use crate::Error;

/// Key of the rendered document inside the Secret
pub const CONFIG_FILE_KEY: &str = "config.json";

/// Renders the configuration the workload reads from its mounted Secret.
///
/// Returns Secret data keyed by file name. Must be deterministic.
#[cfg_attr(test, automock)]
pub trait ConfigRenderer: Send + Sync {
    /// Render the Secret contents for `inputs`
    fn render(&self, inputs: &ValidatedInputs) -> Result<BTreeMap<String, Vec<u8>>, Error>;
}

/// Default renderer: a single pretty-printed JSON document
#[derive(Clone, Debug, Default)]
pub struct JsonConfigRenderer;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderedConfig<'a> {
    web_port: i32,
    metrics_port: i32,
    metrics_path: &'a str,
    kafka: RenderedKafka<'a>,
}

#[derive(Serialize)]
struct RenderedKafka<'a> {
    topics: Vec<RenderedTopic<'a>>,
}

#[derive(Serialize)]
struct RenderedTopic<'a> {
    name: &'a str,
    partitions: i32,
}

impl ConfigRenderer for JsonConfigRenderer {
    fn render(&self, inputs: &ValidatedInputs) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        let config = RenderedConfig {
            web_port: inputs.web_port,
            metrics_port: inputs.metrics_port,
            metrics_path: &inputs.metrics_path,
            kafka: RenderedKafka {
                topics: inputs
                    .topics
                    .iter()
                    .map(|t| RenderedTopic {
                        name: &t.topic_name,
                        partitions: t.partitions,
                    })
                    .collect(),
            },
        };

        let document = serde_json::to_vec_pretty(&config)?;
        Ok(BTreeMap::from([(CONFIG_FILE_KEY.to_string(), document)]))
    }
}

/// Short content hash of Secret data, stable across runs
pub fn config_hash(data: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}
