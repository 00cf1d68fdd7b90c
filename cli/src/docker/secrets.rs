use std::collections::HashMap;

use anyhow::{Context, Result};
use tanjun_common::project::ProjectName;

use super::kv::KvClient;

/// The project's secret map lives under one KV key as a JSON object. An
/// unknown project reads as an empty map, never as an error.
pub async fn list_project_secrets(
    kv: &mut KvClient,
    project: &ProjectName,
) -> Result<HashMap<String, String>> {
    let raw = kv.get(&project.secrets_key()).await?;

    decode_secrets(&raw)
}

pub async fn set_project_secrets(
    kv: &mut KvClient,
    project: &ProjectName,
    secrets: &HashMap<String, String>,
) -> Result<()> {
    let encoded = serde_json::to_string(secrets)?;

    kv.set(&project.secrets_key(), &encoded)
        .await
        .context("could not store project secrets")
}

fn decode_secrets(raw: &str) -> Result<HashMap<String, String>> {
    if raw.is_empty() {
        return Ok(HashMap::new());
    }

    serde_json::from_str(raw).context("stored secrets are not a JSON object")
}
