// rust/cleaner-core/src/tracking.rs

//! Experiment tracking lookups.
//!
//! Each run directory holds the `config.yaml` it was trained with. Its
//! `wandb` section names the tracking entity, project and run name, which
//! are used to look up the run's tracking id.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::TrackingConfig;
use crate::error::{CleanerError, Result};

/// The parts of a training config this crate reads. Everything else in the
/// file is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub wandb: Option<WandbSettings>,
}

/// Tracking settings of a training run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WandbSettings {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

impl FromStr for TrainConfig {
    type Err = CleanerError;

    fn from_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s)
            .map_err(|e| CleanerError::config_with_source("failed to parse training config", e))
    }
}

impl TrainConfig {
    /// Loads a training config from a local YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CleanerError::storage_with_source(path, "failed to read training config", e)
        })?;
        content.parse()
    }
}

/// A run known to the tracking service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRun {
    pub id: String,
    pub display_name: String,
}

/// Queries the experiment tracking service.
#[async_trait]
pub trait RunTracker: Send + Sync {
    /// Returns the runs of `entity/project` whose display name matches the
    /// regular expression `name_pattern`.
    async fn find_runs(
        &self,
        entity: &str,
        project: &str,
        name_pattern: &str,
    ) -> Result<Vec<TrackedRun>>;
}

/// Resolves the tracking id of the single run matching `name`.
///
/// # Errors
///
/// Returns `TrackingLookup` when no run or more than one run matches.
pub async fn resolve_run_id(
    tracker: &dyn RunTracker,
    entity: &str,
    project: &str,
    name: &str,
) -> Result<String> {
    let mut runs = tracker.find_runs(entity, project, name).await?;
    match runs.len() {
        0 => Err(CleanerError::tracking_lookup(format!(
            "no runs named '{name}' found in {entity}/{project}"
        ))),
        1 => Ok(runs.remove(0).id),
        n => Err(CleanerError::tracking_lookup(format!(
            "{n} runs named '{name}' found in {entity}/{project}"
        ))),
    }
}

const RUNS_QUERY: &str = r#"
query Runs($project: String!, $entity: String!, $filters: JSONString, $first: Int) {
  project(name: $project, entityName: $entity) {
    runs(filters: $filters, first: $first) {
      edges { node { name displayName } }
    }
  }
}
"#;

/// Runs returned per query. More than one match is already an error.
const RUNS_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<ProjectData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProjectData {
    project: Option<Project>,
}

#[derive(Debug, Deserialize)]
struct Project {
    runs: RunConnection,
}

#[derive(Debug, Deserialize)]
struct RunConnection {
    edges: Vec<RunEdge>,
}

#[derive(Debug, Deserialize)]
struct RunEdge {
    node: RunNode,
}

#[derive(Debug, Deserialize)]
struct RunNode {
    name: String,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

/// Tracking client for the Weights & Biases GraphQL API.
#[derive(Debug, Clone)]
pub struct WandbTracker {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl WandbTracker {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Builds a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when no API key is configured.
    pub fn from_config(config: &TrackingConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            CleanerError::config("tracking.api_key (or WANDB_API_KEY) must be set")
        })?;
        Ok(Self::new(config.api_url.clone(), api_key))
    }

    fn graphql_url(&self) -> String {
        format!("{}/graphql", self.api_url.trim_end_matches('/'))
    }
}

fn runs_request_body(entity: &str, project: &str, name_pattern: &str) -> serde_json::Value {
    let filters = json!({ "display_name": { "$regex": name_pattern } });
    json!({
        "query": RUNS_QUERY,
        "variables": {
            "entity": entity,
            "project": project,
            "filters": filters.to_string(),
            "first": RUNS_PAGE_SIZE,
        }
    })
}

fn parse_runs_response(body: &str, entity: &str, project: &str) -> Result<Vec<TrackedRun>> {
    let response: GraphQlResponse = serde_json::from_str(body).map_err(|e| {
        CleanerError::tracking_lookup(format!("invalid response from tracking service: {e}"))
    })?;

    if !response.errors.is_empty() {
        let messages: Vec<&str> = response.errors.iter().map(|e| e.message.as_str()).collect();
        return Err(CleanerError::tracking_lookup(messages.join("; ")));
    }

    let project = response
        .data
        .and_then(|data| data.project)
        .ok_or_else(|| CleanerError::tracking_lookup(format!("project {entity}/{project} not found")))?;

    Ok(project
        .runs
        .edges
        .into_iter()
        .map(|edge| TrackedRun {
            display_name: edge.node.display_name.unwrap_or_else(|| edge.node.name.clone()),
            id: edge.node.name,
        })
        .collect())
}

#[async_trait]
impl RunTracker for WandbTracker {
    async fn find_runs(
        &self,
        entity: &str,
        project: &str,
        name_pattern: &str,
    ) -> Result<Vec<TrackedRun>> {
        tracing::debug!(entity, project, name_pattern, "querying tracked runs");

        let response = self
            .client
            .post(self.graphql_url())
            .basic_auth("api", Some(&self.api_key))
            .json(&runs_request_body(entity, project, name_pattern))
            .send()
            .await
            .map_err(|e| {
                CleanerError::tracking_lookup(format!("request to tracking service failed: {e}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            CleanerError::tracking_lookup(format!("failed to read tracking response: {e}"))
        })?;
        if !status.is_success() {
            tracing::error!(status = %status, body = %body, "tracking service returned an error");
            return Err(CleanerError::tracking_lookup(format!(
                "tracking service returned {status}"
            )));
        }

        parse_runs_response(&body, entity, project)
    }
}
