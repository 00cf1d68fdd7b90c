use anyhow::Result;
use async_trait::async_trait;
use bollard::models::{ContainerInspectResponse, HealthConfig};
use bollard::Docker;
use tanjun_common::config::ServiceConfig;

use super::{
    existing_cmd, service_data_mount, service_scaffold, settings_args, start_service,
    stop_and_remove_container, string_schema, validate_settings_keys, AppService,
};
use crate::docker::deploy::DeployContext;

const SETTINGS: &[&str] = &[
    "max_connections",
    "shared_buffers",
    "effective_cache_size",
    "maintenance_work_mem",
    "checkpoint_completion_target",
    "wal_buffers",
    "default_statistics_target",
    "random_page_cost",
    "effective_io_concurrency",
    "work_mem",
    "min_wal_size",
    "max_wal_size",
    "max_worker_processes",
    "max_parallel_workers_per_gather",
    "max_parallel_workers",
];

pub struct PostgresService;

#[async_trait]
impl AppService for PostgresService {
    fn supported_types(&self) -> &'static [&'static str] {
        &["postgres:17", "postgres:16", "postgres:15", "postgres:14"]
    }

    fn validate(&self, name: &str, service: &ServiceConfig) -> Result<()> {
        validate_settings_keys(name, service, SETTINGS)
    }

    fn attach_info(&self, name: &str, _service: &ServiceConfig) -> serde_json::Value {
        serde_json::json!({
            "host": name,
            "port": "5432",
            "username": "user",
            "password": "password",
            "database": "database",
            "url": format!("postgres://user:password@{name}:5432/database"),
            "go": format!("user:password@tcp({name}:5432)/database"),
        })
    }

    fn config_schema(&self, _service_type: &str) -> serde_json::Value {
        string_schema(
            &SETTINGS
                .iter()
                .map(|key| (*key, ""))
                .collect::<Vec<_>>(),
        )
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

        body.image = Some(format!("{}-alpine", service.service_type));
        body.env = Some(vec![
            "POSTGRES_DB=database".to_string(),
            "POSTGRES_USER=user".to_string(),
            "POSTGRES_PASSWORD=password".to_string(),
        ]);
        body.healthcheck = Some(HealthConfig {
            test: Some(vec![
                "CMD-SHELL".to_string(),
                "pg_isready -U user".to_string(),
            ]),
            ..Default::default()
        });

        if let Some(host_config) = body.host_config.as_mut() {
            host_config.mounts = Some(vec![service_data_mount(
                deploy,
                name,
                "/var/lib/postgresql/data",
            )]);
        }

        let mut cmd = vec!["postgres".to_string()];
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
    use bollard::models::ContainerConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_attach_info() {
        let service = ServiceConfig {
            service_type: "postgres:16".to_string(),
            settings: Default::default(),
        };

        let info = PostgresService.attach_info("db", &service);
        assert_eq!(info["url"], "postgres://user:password@db:5432/database");
        assert_eq!(info["port"], "5432");
    }

    #[test]
    fn test_unchanged_command_line_is_detected() {
        let existing = ContainerInspectResponse {
            config: Some(ContainerConfig {
                cmd: Some(vec![
                    "postgres".to_string(),
                    "--max_connections=50".to_string(),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(
            existing_cmd(&existing),
            vec!["postgres".to_string(), "--max_connections=50".to_string()]
        );
    }
}
