use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use tanjun_common::config::OnePasswordItem;
use tokio::process::Command;

#[derive(Debug, Deserialize)]
struct ItemResponse {
    #[serde(default)]
    fields: Vec<ItemField>,
}

#[derive(Debug, Deserialize)]
struct ItemField {
    #[serde(default)]
    label: String,
    #[serde(default)]
    value: String,
}

/// Fetch one item via the 1Password CLI and turn its fields into env pairs,
/// honoring `omit_fields` and `remap_fields` (new name -> old field label).
pub async fn resolve_secrets(item: &OnePasswordItem) -> Result<HashMap<String, String>> {
    let output = Command::new("op")
        .args([
            "--vault",
            &item.vault,
            "item",
            "get",
            &item.name,
            "--format",
            "json",
        ])
        .output()
        .await
        .context("running the 1password cli")?;

    if !output.status.success() {
        anyhow::bail!(
            "1password cli failed for item {:?}: {}",
            item.name,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let response: ItemResponse =
        serde_json::from_slice(&output.stdout).context("unmarshalling 1password response")?;

    Ok(collect_fields(item, response))
}

fn collect_fields(item: &OnePasswordItem, response: ItemResponse) -> HashMap<String, String> {
    let mut secrets: HashMap<String, String> = response
        .fields
        .into_iter()
        .filter(|field| !field.label.is_empty() && !field.value.is_empty())
        .map(|field| (field.label, field.value))
        .collect();

    for field in &item.omit_fields {
        secrets.remove(field);
    }

    for (new_key, old_key) in &item.remap_fields {
        if let Some(value) = secrets.remove(old_key) {
            secrets.insert(new_key.clone(), value);
        }
    }

    secrets
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn item(omit: &[&str], remap: &[(&str, &str)]) -> OnePasswordItem {
        OnePasswordItem {
            name: "prod".to_string(),
            vault: "infra".to_string(),
            omit_fields: omit.iter().map(ToString::to_string).collect(),
            remap_fields: remap
                .iter()
                .map(|(new, old)| (new.to_string(), old.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn response() -> ItemResponse {
        serde_json::from_str(
            r#"{"fields": [
                {"label": "API_KEY", "value": "abc"},
                {"label": "notes", "value": "internal"},
                {"label": "empty", "value": ""},
                {"label": "", "value": "unlabeled"}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_collects_labeled_fields_only() {
        let secrets = collect_fields(&item(&[], &[]), response());

        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets["API_KEY"], "abc");
        assert_eq!(secrets["notes"], "internal");
    }

    #[test]
    fn test_omit_and_remap() {
        let secrets = collect_fields(&item(&["notes"], &[("SERVICE_KEY", "API_KEY")]), response());

        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets["SERVICE_KEY"], "abc");
        assert!(!secrets.contains_key("API_KEY"));
    }
}
