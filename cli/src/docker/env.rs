use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Context, Result};
use minijinja::value::Value as TemplateValue;
use rand::Rng;
use tanjun_common::config::{InitialSecret, ProjectConfig};
use tanjun_common::project::ProjectName;
use tracing::warn;

use super::kv::KvClient;
use super::secrets::{list_project_secrets, set_project_secrets};
use crate::onepassword;

/// The expression context of `env.*.expr` and `initial_secrets.*.expr`:
/// `config` (the full project config), `service` (attach-info per service
/// name) and `randomString(n)`.
pub struct Evaluator {
    env: minijinja::Environment<'static>,
}

impl Evaluator {
    pub fn new(
        config: &ProjectConfig,
        service_info: &HashMap<String, serde_json::Value>,
    ) -> Self {
        let mut env = minijinja::Environment::new();
        env.add_function("randomString", |n: u32| random_string(n as usize));
        env.add_global("config", TemplateValue::from_serialize(config));
        env.add_global("service", TemplateValue::from_serialize(service_info));

        Self { env }
    }

    /// Expression problems are configuration errors and surface before any
    /// container is touched.
    pub fn eval(&self, expr: &str) -> Result<String> {
        let compiled = self
            .env
            .compile_expression(expr)
            .map_err(|err| anyhow!("invalid expression {expr:?}: {err}"))?;

        let value = compiled
            .eval(minijinja::context! {})
            .map_err(|err| anyhow!("expression {expr:?} failed: {err}"))?;

        Ok(value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()))
    }
}

pub fn random_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

/// Resolve the full environment for this deploy. Phases in order, later
/// phases overwrite earlier ones: literal/expression env, process env
/// passthrough, env files, stored secrets, 1Password items, initial secrets.
/// The result is frozen and injected into every container of the deploy.
pub async fn prepare_environment_variables(
    config: &ProjectConfig,
    project: &ProjectName,
    service_info: &HashMap<String, serde_json::Value>,
    kv: &mut KvClient,
) -> Result<HashMap<String, String>> {
    let evaluator = Evaluator::new(config, service_info);
    let mut env = HashMap::new();

    for (key, value) in &config.app.env {
        if let Some(literal) = &value.value {
            env.insert(key.clone(), literal.clone());
        } else if let Some(expr) = &value.expr {
            let resolved = evaluator
                .eval(expr)
                .with_context(|| format!("env {key}"))?;
            env.insert(key.clone(), resolved);
        }
    }

    apply_env_passthrough(&config.app.secrets.from_env, &mut env, |name| {
        std::env::var(name).ok()
    });

    for file in &config.app.secrets.from_env_file {
        match dotenvy::from_path_iter(file) {
            Ok(entries) => {
                for entry in entries {
                    let (key, value) =
                        entry.with_context(|| format!("parsing {}", file.display()))?;
                    env.insert(key, value);
                }
            }
            Err(err) => warn!("skipping env file {}: {err}", file.display()),
        }
    }

    let mut stored = list_project_secrets(kv, project).await?;

    for (key, stored_key) in &config.app.secrets.from_stored {
        let lookup = if stored_key.is_empty() { key } else { stored_key };

        match stored.get(lookup) {
            Some(value) => {
                env.insert(key.clone(), value.clone());
            }
            None => warn!("stored secret {lookup} is not set, skipping {key}"),
        }
    }

    for item in &config.app.secrets.onepassword.items {
        let resolved = onepassword::resolve_secrets(item).await?;
        env.extend(resolved);
    }

    let changed = apply_initial_secrets(&config.app.initial_secrets, &evaluator, &mut stored, &mut env)?;

    if changed {
        set_project_secrets(kv, project, &stored).await?;
    }

    Ok(env)
}

pub fn apply_env_passthrough(
    passthrough: &BTreeMap<String, String>,
    env: &mut HashMap<String, String>,
    lookup: impl Fn(&str) -> Option<String>,
) {
    for (key, var) in passthrough {
        // an empty value means "same name as the key"
        let var_name = if var.is_empty() { key } else { var };

        match lookup(var_name) {
            Some(value) => {
                env.insert(key.clone(), value);
            }
            None => warn!("environment variable {var_name} is not set, skipping {key}"),
        }
    }
}

/// Initial secrets are generated exactly once per project: an already-stored
/// value is reused verbatim, anything new is evaluated and marked for an
/// atomic rewrite of the stored map.
pub fn apply_initial_secrets(
    initial: &BTreeMap<String, InitialSecret>,
    evaluator: &Evaluator,
    stored: &mut HashMap<String, String>,
    env: &mut HashMap<String, String>,
) -> Result<bool> {
    let mut changed = false;

    for (key, secret) in initial {
        if let Some(existing) = stored.get(key) {
            env.insert(key.clone(), existing.clone());
            continue;
        }

        let value = evaluator
            .eval(&secret.expr)
            .with_context(|| format!("initial secret {key}"))?;

        env.insert(key.clone(), value.clone());
        stored.insert(key.clone(), value);
        changed = true;
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_config() -> ProjectConfig {
        serde_yaml::from_str(
            r#"
name: hello
image: ghcr.io/u/hello
server:
  address: 192.168.0.10
proxy:
  host: hello.example.com
"#,
        )
        .unwrap()
    }

    fn cache_service_info() -> HashMap<String, serde_json::Value> {
        HashMap::from([(
            "cache".to_string(),
            serde_json::json!({"host": "cache", "port": "6379", "url": "redis://cache:6379"}),
        )])
    }

    #[test]
    fn test_expression_reads_config() {
        let evaluator = Evaluator::new(&test_config(), &HashMap::new());
        assert_eq!(evaluator.eval("config.name").unwrap(), "hello");
    }

    #[test]
    fn test_expression_reads_service_attach_info() {
        let evaluator = Evaluator::new(&test_config(), &cache_service_info());
        assert_eq!(
            evaluator.eval("service.cache.url").unwrap(),
            "redis://cache:6379"
        );
    }

    #[test]
    fn test_expression_concatenation() {
        let evaluator = Evaluator::new(&test_config(), &cache_service_info());
        assert_eq!(
            evaluator.eval("\"db-\" ~ config.name").unwrap(),
            "db-hello"
        );
    }

    #[test]
    fn test_random_string_length_and_charset() {
        let evaluator = Evaluator::new(&test_config(), &HashMap::new());
        let value = evaluator.eval("randomString(24)").unwrap();

        assert_eq!(value.len(), 24);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));

        // astronomically unlikely to collide
        assert_ne!(value, evaluator.eval("randomString(24)").unwrap());
    }

    #[test]
    fn test_invalid_expression_is_an_error() {
        let evaluator = Evaluator::new(&test_config(), &HashMap::new());
        assert!(evaluator.eval("config.").is_err());
    }

    #[test]
    fn test_env_passthrough_skips_missing_variables() {
        let passthrough = BTreeMap::from([
            ("TOKEN".to_string(), String::new()),
            ("RENAMED".to_string(), "SOURCE_VAR".to_string()),
            ("MISSING".to_string(), String::new()),
        ]);
        let mut env = HashMap::new();

        apply_env_passthrough(&passthrough, &mut env, |name| match name {
            "TOKEN" => Some("t0k3n".to_string()),
            "SOURCE_VAR" => Some("renamed".to_string()),
            _ => None,
        });

        assert_eq!(env.get("TOKEN").map(String::as_str), Some("t0k3n"));
        assert_eq!(env.get("RENAMED").map(String::as_str), Some("renamed"));
        assert!(!env.contains_key("MISSING"));
    }

    #[test]
    fn test_initial_secrets_stick() {
        let evaluator = Evaluator::new(&test_config(), &HashMap::new());
        let initial = BTreeMap::from([(
            "APP_SECRET".to_string(),
            InitialSecret {
                expr: "randomString(32)".to_string(),
            },
        )]);

        // first deploy: generated and marked for persistence
        let mut stored = HashMap::new();
        let mut env = HashMap::new();
        let changed = apply_initial_secrets(&initial, &evaluator, &mut stored, &mut env).unwrap();

        assert!(changed);
        let first = env["APP_SECRET"].clone();
        assert_eq!(stored["APP_SECRET"], first);

        // second deploy: the stored value wins, nothing to persist
        let mut env = HashMap::new();
        let changed = apply_initial_secrets(&initial, &evaluator, &mut stored, &mut env).unwrap();

        assert!(!changed);
        assert_eq!(env["APP_SECRET"], first);
    }
}
