use std::collections::HashMap;

use anyhow::{bail, Result};
use bollard::Docker;
use tanjun_common::config::ProjectConfig;
use tanjun_common::project::ProjectName;

use crate::docker::kv::KvClient;
use crate::docker::secrets::list_project_secrets;
use crate::onepassword;

/// Build-time secrets are a narrower pipeline than the runtime one: process
/// env, the stored project map, and 1Password. A missing build secret is an
/// error, not a warning, because the Dockerfile references it by name.
pub async fn resolve_build_secrets(
    remote: &Docker,
    config: &ProjectConfig,
    project: &ProjectName,
) -> Result<HashMap<String, String>> {
    let mut secrets = HashMap::new();

    for (key, var) in &config.build.secrets.from_env {
        let var_name = if var.is_empty() { key } else { var };

        match std::env::var(var_name) {
            Ok(value) => {
                secrets.insert(key.clone(), value);
            }
            Err(_) => bail!(
                "could not find a value for build secret {key}: environment variable {var_name} is not set"
            ),
        }
    }

    if !config.build.secrets.from_stored.is_empty() {
        let mut kv = KvClient::connect(remote).await?;
        let stored = list_project_secrets(&mut kv, project).await;
        kv.close().await;
        let stored = stored?;

        for (key, stored_key) in &config.build.secrets.from_stored {
            let lookup = if stored_key.is_empty() { key } else { stored_key };

            match stored.get(lookup) {
                Some(value) => {
                    secrets.insert(key.clone(), value.clone());
                }
                None => bail!(
                    "could not find a value for build secret {key}: stored secret {lookup} is not set"
                ),
            }
        }
    }

    for item in &config.build.secrets.onepassword.items {
        let resolved = onepassword::resolve_secrets(item).await?;
        secrets.extend(resolved);
    }

    Ok(secrets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(build: &str) -> ProjectConfig {
        serde_yaml::from_str(&format!(
            r#"
name: hello
image: ghcr.io/u/hello
server:
  address: 127.0.0.1
proxy:
  host: hello.example.com
{build}
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_from_env_resolution() {
        std::env::set_var("TANJUN_TEST_BUILD_SECRET", "abc");

        let config = config(
            "build:\n  secrets:\n    from_env:\n      NPM_TOKEN: TANJUN_TEST_BUILD_SECRET\n",
        );
        let project = config.project_name().unwrap();
        let docker = Docker::connect_with_local_defaults().unwrap();

        let secrets = resolve_build_secrets(&docker, &config, &project)
            .await
            .unwrap();
        assert_eq!(secrets["NPM_TOKEN"], "abc");
    }

    #[tokio::test]
    async fn test_missing_env_var_is_an_error() {
        let config = config(
            "build:\n  secrets:\n    from_env:\n      NPM_TOKEN: TANJUN_TEST_UNSET_VARIABLE\n",
        );
        let project = config.project_name().unwrap();
        let docker = Docker::connect_with_local_defaults().unwrap();

        let err = resolve_build_secrets(&docker, &config, &project)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NPM_TOKEN"));
    }
}
