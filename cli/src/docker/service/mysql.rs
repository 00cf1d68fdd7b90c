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
    "sql_mode",
    "log_bin_trust_function_creators",
    "binlog_cache_size",
    "join_buffer_size",
    "innodb_log_file_size",
    "innodb_buffer_pool_size",
    "innodb_buffer_pool_instances",
    "group_concat_max_len",
    "max_connections",
    "max_allowed_packet",
    "max_binlog_size",
    "binlog_expire_logs_seconds",
];

pub struct MySqlService;

#[async_trait]
impl AppService for MySqlService {
    fn supported_types(&self) -> &'static [&'static str] {
        &["mysql:8.0", "mysql:8.4"]
    }

    fn validate(&self, name: &str, service: &ServiceConfig) -> Result<()> {
        validate_settings_keys(name, service, SETTINGS)
    }

    fn attach_info(&self, name: &str, _service: &ServiceConfig) -> serde_json::Value {
        serde_json::json!({
            "host": name,
            "port": "3306",
            "username": "root",
            "password": "",
            "database": "database",
            "url": format!("mysql://root@{name}:3306/database"),
            "go": format!("root:@tcp({name}:3306)/database"),
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

        body.image = Some(service.service_type.clone());
        body.env = Some(vec![
            "MYSQL_ALLOW_EMPTY_PASSWORD=yes".to_string(),
            "MYSQL_DATABASE=database".to_string(),
        ]);
        body.healthcheck = Some(HealthConfig {
            test: Some(vec![
                "CMD".to_string(),
                "mysqladmin".to_string(),
                "ping".to_string(),
                "-h".to_string(),
                "localhost".to_string(),
            ]),
            ..Default::default()
        });

        if let Some(host_config) = body.host_config.as_mut() {
            host_config.mounts = Some(vec![service_data_mount(deploy, name, "/var/lib/mysql")]);
        }

        let cmd = settings_args(&service.settings);
        body.cmd = Some(cmd.clone());

        if let Some(existing) = existing {
            // the entrypoint prepends mysqld to whatever we passed
            let mut running = existing_cmd(existing);
            if running.first().map(String::as_str) == Some("mysqld") {
                running.remove(0);
            }

            if running == cmd {
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
    fn test_attach_info_urls() {
        let service = ServiceConfig {
            service_type: "mysql:8.4".to_string(),
            settings: Default::default(),
        };

        let info = MySqlService.attach_info("database", &service);
        assert_eq!(info["url"], "mysql://root@database:3306/database");
        assert_eq!(info["go"], "root:@tcp(database:3306)/database");
    }

    #[test]
    fn test_settings_allow_list() {
        let service = ServiceConfig {
            service_type: "mysql:8.0".to_string(),
            settings: [("skip_networking".to_string(), "1".to_string())].into(),
        };

        assert!(MySqlService.validate("database", &service).is_err());
    }
}
