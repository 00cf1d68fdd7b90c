mod mysql;
mod postgres;
mod valkey;

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, EndpointSettings, HostConfig, Mount,
    MountTypeEnum, MountVolumeOptions, NetworkingConfig, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use tanjun_common::config::{ProjectConfig, ServiceConfig};
use tanjun_common::project::ProjectName;
use tracing::info;

pub use mysql::MySqlService;
pub use postgres::PostgresService;
pub use valkey::ValkeyService;

use super::deploy::DeployContext;
use super::helper::{list_labeled_containers, wait_for_healthy};
use super::{ensure_image, helper};

const SERVICE_HEALTH_TIMEOUT_SECS: u64 = 300;

/// The capability set every sidecar adapter provides. `deploy` must be
/// idempotent: when the existing container already runs the command line the
/// settings describe, it does nothing.
#[async_trait]
pub trait AppService: Send + Sync {
    fn supported_types(&self) -> &'static [&'static str];

    fn validate(&self, name: &str, service: &ServiceConfig) -> Result<()>;

    /// The object bound as `service.{name}` in the expression context.
    fn attach_info(&self, name: &str, service: &ServiceConfig) -> serde_json::Value;

    fn config_schema(&self, service_type: &str) -> serde_json::Value;

    async fn deploy(
        &self,
        docker: &Docker,
        name: &str,
        deploy: &DeployContext,
        existing: Option<&ContainerInspectResponse>,
    ) -> Result<()>;
}

/// Adapters register here; lookup is by exact type string.
pub static SERVICES: &[&(dyn AppService)] = &[&ValkeyService, &MySqlService, &PostgresService];

pub fn find_service(service_type: &str) -> Result<&'static dyn AppService> {
    SERVICES
        .iter()
        .copied()
        .find(|service| service.supported_types().contains(&service_type))
        .ok_or_else(|| anyhow!("service type {service_type} not supported"))
}

/// Turn the settings map into `--key=value` arguments, the command-line shape
/// every bundled adapter uses. Deterministic order so the diff against a
/// running container is stable.
pub(crate) fn settings_args(settings: &BTreeMap<String, String>) -> Vec<String> {
    settings
        .iter()
        .map(|(key, value)| format!("--{key}={value}"))
        .collect()
}

pub(crate) fn validate_settings_keys(
    name: &str,
    service: &ServiceConfig,
    allowed: &[&str],
) -> Result<()> {
    for key in service.settings.keys() {
        if !allowed.contains(&key.as_str()) {
            bail!(
                "service {name}: unsupported {} configuration key {key}",
                service.service_type
            );
        }
    }

    Ok(())
}

pub(crate) fn string_schema(properties: &[(&str, &str)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();

    for (key, description) in properties {
        map.insert(
            key.to_string(),
            serde_json::json!({"type": "string", "description": description}),
        );
    }

    serde_json::json!({"type": "object", "properties": map})
}

/// The shared scaffold: `{prefix}_{service}` name, project labels, an alias
/// on the project network, restart unless-stopped.
pub(crate) fn service_scaffold(deploy: &DeployContext, name: &str) -> (String, ContainerCreateBody) {
    let container_name = format!("{}_{name}", deploy.container_prefix());

    let mut labels = deploy.base_labels();
    labels.insert("tanjun.service".to_string(), name.to_string());
    labels.insert("com.docker.compose.service".to_string(), name.to_string());

    let body = ContainerCreateBody {
        env: Some(vec![]),
        labels: Some(labels),
        host_config: Some(HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            ..Default::default()
        }),
        networking_config: Some(NetworkingConfig {
            endpoints_config: Some(std::collections::HashMap::from([(
                deploy.network_name.clone(),
                EndpointSettings {
                    aliases: Some(vec![name.to_string()]),
                    ..Default::default()
                },
            )])),
        }),
        ..Default::default()
    };

    (container_name, body)
}

/// A labeled data volume mounted into the service container.
pub(crate) fn service_data_mount(deploy: &DeployContext, name: &str, target: &str) -> Mount {
    let mut labels = deploy.base_labels();
    labels.insert("tanjun.service".to_string(), name.to_string());

    Mount {
        typ: Some(MountTypeEnum::VOLUME),
        source: Some(format!("{}_{name}_data", deploy.container_prefix())),
        target: Some(target.to_string()),
        volume_options: Some(MountVolumeOptions {
            labels: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) async fn start_service(
    docker: &Docker,
    name: &str,
    container_name: String,
    body: ContainerCreateBody,
) -> Result<()> {
    let image = body.image.clone().unwrap_or_default();

    info!("Starting service {name}");

    ensure_image(docker, &image).await?;

    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: Some(container_name),
                ..Default::default()
            }),
            body,
        )
        .await
        .with_context(|| format!("creating service {name}"))?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
        .with_context(|| format!("starting service {name}"))?;

    wait_for_healthy(docker, &created.id, SERVICE_HEALTH_TIMEOUT_SECS)
        .await
        .with_context(|| format!("service {name} did not become healthy"))?;

    info!("Service {name} is healthy");

    Ok(())
}

pub(crate) async fn stop_and_remove_container(docker: &Docker, container_id: &str) -> Result<()> {
    docker
        .stop_container(container_id, None::<StopContainerOptions>)
        .await
        .with_context(|| format!("stopping container {container_id}"))?;

    docker
        .remove_container(container_id, None::<RemoveContainerOptions>)
        .await
        .with_context(|| format!("removing container {container_id}"))?;

    Ok(())
}

pub(crate) fn existing_cmd(existing: &ContainerInspectResponse) -> Vec<String> {
    existing
        .config
        .as_ref()
        .and_then(|config| config.cmd.clone())
        .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceStatus {
    pub status: String,
    pub existing: bool,
    pub dangling: bool,
}

/// The configured services joined with what is actually on the host. A
/// container whose service name left the config is dangling.
pub async fn project_list_services(
    docker: &Docker,
    config: &ProjectConfig,
    project: &ProjectName,
) -> Result<BTreeMap<String, ServiceStatus>> {
    let containers = list_labeled_containers(docker, project, &["tanjun.service"], true).await?;

    let mut services = BTreeMap::new();

    for container in containers {
        let Some(name) = container
            .labels
            .as_ref()
            .and_then(|labels| labels.get("tanjun.service"))
            .cloned()
        else {
            continue;
        };

        let status = container
            .state
            .map(|state| format!("{state:?}").to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());

        services.insert(
            name.clone(),
            ServiceStatus {
                status,
                existing: true,
                dangling: !config.services.contains_key(&name),
            },
        );
    }

    for name in config.services.keys() {
        services.entry(name.clone()).or_insert(ServiceStatus {
            status: "missing, not deployed yet".to_string(),
            existing: false,
            dangling: false,
        });
    }

    Ok(services)
}

pub async fn project_delete_service(
    docker: &Docker,
    project: &ProjectName,
    service_name: &str,
) -> Result<()> {
    let label = format!("tanjun.service={service_name}");
    let containers = list_labeled_containers(docker, project, &[&label], true).await?;

    helper::remove_containers(docker, &containers).await?;

    let options = bollard::query_parameters::ListVolumesOptions {
        filters: Some(std::collections::HashMap::from([(
            "label".to_string(),
            vec![format!("tanjun.project={project}"), label],
        )])),
    };

    let volumes = docker
        .list_volumes(Some(options))
        .await?
        .volumes
        .unwrap_or_default();

    for volume in volumes {
        docker
            .remove_volume(
                &volume.name,
                Some(bollard::query_parameters::RemoveVolumeOptions { force: true }),
            )
            .await
            .with_context(|| format!("removing volume {}", volume.name))?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn test_deploy_context(services_yaml: &str) -> DeployContext {
        let config: ProjectConfig = serde_yaml::from_str(&format!(
            r#"
name: hello
image: ghcr.io/u/hello
server:
  address: 192.168.0.10
proxy:
  host: hello.example.com
services:
{services_yaml}
"#
        ))
        .unwrap();

        DeployContext::new(config, "v1").unwrap()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::test_support::test_deploy_context;
    use super::*;

    #[test]
    fn test_lookup_is_by_exact_type_string() {
        assert!(find_service("valkey:7.2").is_ok());
        assert!(find_service("mysql:8.4").is_ok());
        assert!(find_service("postgres:16").is_ok());
        assert!(find_service("valkey:6.0").is_err());
        assert!(find_service("mongodb:7").is_err());
    }

    #[test]
    fn test_every_supported_type_resolves_to_one_adapter() {
        for service in SERVICES {
            for supported in service.supported_types() {
                let hits = SERVICES
                    .iter()
                    .filter(|other| other.supported_types().contains(supported))
                    .count();
                assert_eq!(hits, 1, "{supported} must resolve to exactly one adapter");
            }
        }
    }

    #[test]
    fn test_settings_args_are_deterministic() {
        let settings = BTreeMap::from([
            ("maxmemory".to_string(), "256mb".to_string()),
            ("appendonly".to_string(), "yes".to_string()),
        ]);

        assert_eq!(
            settings_args(&settings),
            vec!["--appendonly=yes".to_string(), "--maxmemory=256mb".to_string()]
        );
    }

    #[test]
    fn test_scaffold_shape() {
        let deploy = test_deploy_context("  cache:\n    type: valkey:7.2\n");
        let (name, body) = service_scaffold(&deploy, "cache");

        assert_eq!(name, "tanjun_hello_cache");

        let labels = body.labels.unwrap();
        assert_eq!(labels["tanjun"], "true");
        assert_eq!(labels["tanjun.project"], "hello");
        assert_eq!(labels["tanjun.service"], "cache");

        let endpoints = body.networking_config.unwrap().endpoints_config.unwrap();
        assert_eq!(
            endpoints["hello"].aliases,
            Some(vec!["cache".to_string()])
        );

        let restart = body.host_config.unwrap().restart_policy.unwrap();
        assert_eq!(restart.name, Some(RestartPolicyNameEnum::UNLESS_STOPPED));
    }
}
