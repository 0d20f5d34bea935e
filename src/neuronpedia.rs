//! Neuronpedia feature pages and explanations
//!
//! SAE ids use Neuronpedia's `{model}/{sae}` form, e.g.
//! `gemma-2-2b/20-gemmascope-res-65k`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{info, warn};

const BASE_URL: &str = "https://www.neuronpedia.org";
const MISSING_EXPLANATION: &str = "No explanation found";

/// Feature page URL
pub fn construct_url(sae_id: &str, feature: usize) -> String {
    format!("{BASE_URL}/{sae_id}/{feature}")
}

/// Split `{model}/{sae}`
pub fn split_sae_id(sae_id: &str) -> Result<(&str, &str)> {
    sae_id
        .split_once('/')
        .filter(|(model, sae)| !model.is_empty() && !sae.is_empty() && !sae.contains('/'))
        .ok_or_else(|| anyhow::anyhow!("Neuronpedia id '{sae_id}' is not of the form model/sae"))
}

fn client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("Failed to build HTTP client")
}

/// Explanations of every feature of one SAE, from Neuronpedia's bulk export
#[derive(Debug, Clone, Default)]
pub struct ExplanationLoader {
    explanations: HashMap<usize, String>,
}

impl ExplanationLoader {
    /// Load explanations for `sae_id`, downloading the export on first use.
    pub fn new(sae_id: &str) -> Result<Self> {
        let cache_dir = hf_hub::Cache::default().path().join("neuronpedia");
        Self::with_cache_dir(sae_id, &cache_dir)
    }

    /// Like [`ExplanationLoader::new`], caching the export under `cache_dir`.
    pub fn with_cache_dir(sae_id: &str, cache_dir: &Path) -> Result<Self> {
        let path = cache_path(sae_id, cache_dir)?;
        if path.exists() {
            info!("Reading cached explanations from {}", path.display());
            let body = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            return Self::from_export_json(&body);
        }

        let (model, sae) = split_sae_id(sae_id)?;
        let url = format!("{BASE_URL}/api/explanation/export?modelId={model}&saeId={sae}");
        info!("Downloading explanations from {}", url);
        let body = client()?
            .get(&url)
            .send()
            .with_context(|| format!("Request to {url} failed"))?
            .error_for_status()?
            .text()?;
        let loader = Self::from_export_json(&body)?;

        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("Failed to create {}", cache_dir.display()))?;
        std::fs::write(&path, &body)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Cached {} explanations at {}", loader.len(), path.display());
        Ok(loader)
    }

    /// Parse an export: a JSON array of objects with `index` and `description`.
    ///
    /// When a feature has several explanations the first one is kept.
    pub fn from_export_json(body: &str) -> Result<Self> {
        let entries: Vec<Value> =
            serde_json::from_str(body).context("Explanation export is not a JSON array")?;
        let mut explanations = HashMap::new();
        for entry in &entries {
            let index = match entry.get("index") {
                Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
                Some(Value::String(s)) => s.parse().ok(),
                _ => None,
            };
            let description = entry.get("description").and_then(Value::as_str);
            match (index, description) {
                (Some(i), Some(d)) => {
                    explanations.entry(i).or_insert_with(|| d.to_string());
                }
                _ => warn!("Skipping malformed explanation entry"),
            }
        }
        Ok(Self { explanations })
    }

    /// Description of `feature`, or a placeholder when none exists
    pub fn get_explanation(&self, feature: usize) -> String {
        self.explanations
            .get(&feature)
            .cloned()
            .unwrap_or_else(|| MISSING_EXPLANATION.to_string())
    }

    pub fn len(&self) -> usize {
        self.explanations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.explanations.is_empty()
    }
}

fn cache_path(sae_id: &str, cache_dir: &Path) -> Result<PathBuf> {
    let (model, sae) = split_sae_id(sae_id)?;
    Ok(cache_dir.join(format!("{model}__{sae}.json")))
}

/// First explanation of one feature, from the feature API
pub fn fetch_feature_description(sae_id: &str, feature: usize) -> Result<String> {
    fetch_with(&client()?, sae_id, feature)
}

/// Descriptions of many features, reusing one connection pool
pub fn fetch_feature_descriptions(sae_id: &str, features: &[usize]) -> Result<Vec<String>> {
    let client = client()?;
    features
        .iter()
        .map(|&f| fetch_with(&client, sae_id, f))
        .collect()
}

fn fetch_with(client: &Client, sae_id: &str, feature: usize) -> Result<String> {
    let url = format!("{BASE_URL}/api/feature/{sae_id}/{feature}");
    let data: Value = client
        .get(&url)
        .send()
        .with_context(|| format!("Request to {url} failed"))?
        .error_for_status()?
        .json()?;
    first_description(&data)
        .with_context(|| format!("No explanation in response for feature {feature}: {data}"))
}

fn first_description(data: &Value) -> Option<String> {
    data.get("explanations")?
        .get(0)?
        .get("description")?
        .as_str()
        .map(str::to_string)
}
