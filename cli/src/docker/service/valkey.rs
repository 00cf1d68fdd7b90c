use anyhow::Result;
use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, HealthConfig};
use bollard::Docker;
use tanjun_common::config::ServiceConfig;

use super::{
    existing_cmd, service_scaffold, settings_args, start_service, stop_and_remove_container,
    string_schema, validate_settings_keys, AppService,
};
use crate::docker::deploy::DeployContext;

const SETTINGS: &[&str] = &["maxmemory", "maxmemory-policy", "appendonly", "save"];

pub struct ValkeyService;

#[async_trait]
impl AppService for ValkeyService {
    fn supported_types(&self) -> &'static [&'static str] {
        &["valkey:7.2", "valkey:8.0"]
    }

    fn validate(&self, name: &str, service: &ServiceConfig) -> Result<()> {
        validate_settings_keys(name, service, SETTINGS)
    }

    fn attach_info(&self, name: &str, _service: &ServiceConfig) -> serde_json::Value {
        serde_json::json!({
            "host": name,
            "port": "6379",
            "url": format!("redis://{name}:6379"),
        })
    }

    fn config_schema(&self, _service_type: &str) -> serde_json::Value {
        string_schema(&[
            (
                "maxmemory",
                "Memory limit: an absolute number of bytes or a percentage of the available memory.",
            ),
            (
                "maxmemory-policy",
                "How Valkey selects what to remove when maxmemory is reached.",
            ),
            ("appendonly", "Persist data to disk (yes/no)."),
            ("save", "Snapshot the DB to disk."),
        ])
    }

    async fn deploy(
        &self,
        docker: &Docker,
        name: &str,
        deploy: &DeployContext,
        existing: Option<&ContainerInspectResponse>,
    ) -> Result<()> {
        let service = &deploy.config.services[name];
        let (container_name, mut body) = service_scaffold(deploy, name);

        body.image = Some(format!("valkey/{}", service.service_type));
        body.healthcheck = Some(HealthConfig {
            test: Some(vec![
                "CMD".to_string(),
                "valkey-cli".to_string(),
                "ping".to_string(),
            ]),
            ..Default::default()
        });

        let mut cmd = vec!["valkey-server".to_string()];
        cmd.extend(settings_args(&service.settings));
        body.cmd = Some(cmd.clone());

        if let Some(existing) = existing {
            if existing_cmd(existing) == cmd {
                return Ok(());
            }

            stop_and_remove_container(docker, existing.id.as_deref().unwrap_or_default()).await?;
        }

        start_service(docker, name, container_name, body).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_attach_info() {
        let service = ServiceConfig {
            service_type: "valkey:7.2".to_string(),
            settings: Default::default(),
        };

        let info = ValkeyService.attach_info("cache", &service);
        assert_eq!(info["host"], "cache");
        assert_eq!(info["port"], "6379");
        assert_eq!(info["url"], "redis://cache:6379");
    }

    #[test]
    fn test_settings_allow_list() {
        let mut service = ServiceConfig {
            service_type: "valkey:7.2".to_string(),
            settings: [("maxmemory".to_string(), "256mb".to_string())].into(),
        };
        assert!(ValkeyService.validate("cache", &service).is_ok());

        service
            .settings
            .insert("requirepass".to_string(), "nope".to_string());
        assert!(ValkeyService.validate("cache", &service).is_err());
    }

    #[test]
    fn test_schema_lists_every_allowed_key() {
        let schema = ValkeyService.config_schema("valkey:7.2");
        let properties = schema["properties"].as_object().unwrap();

        for key in SETTINGS {
            assert!(properties.contains_key(*key), "{key} missing from schema");
        }
    }
}
