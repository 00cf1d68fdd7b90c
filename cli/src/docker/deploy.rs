use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bollard::models::{
    ContainerCreateBody, ContainerSummary, EndpointSettings, HostConfig, Mount, MountTypeEnum,
    NetworkCreateRequest, NetworkingConfig, RestartPolicy, RestartPolicyNameEnum,
    VolumeCreateOptions,
};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListNetworksOptions, ListVolumesOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use rand::Rng;
use tanjun_common::config::ProjectConfig;
use tanjun_common::project::ProjectName;
use tanjun_common::PUBLIC_NETWORK;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::env::prepare_environment_variables;
use super::helper::{
    list_labeled_containers, remove_containers, select_app_port, start_containers,
    stop_containers, wait_for_healthy,
};
use super::kv::KvClient;
use super::{cronjob, detect_app_uid, ensure_image, hook, proxy, service, version, worker};

const CHOWN_IMAGE: &str = "alpine:latest";
const APP_HEALTH_TIMEOUT_SECS: u64 = 60;

/// Everything one deploy carries around: the parsed config, the resolved
/// image tag, and the env/service-info maps filled along the way.
#[derive(Clone)]
pub struct DeployContext {
    pub project: ProjectName,
    pub config: ProjectConfig,
    pub version: String,
    pub image: String,
    pub network_name: String,
    pub image_working_dir: String,
    pub env: HashMap<String, String>,
    pub service_info: HashMap<String, serde_json::Value>,
}

impl DeployContext {
    pub fn new(config: ProjectConfig, version: &str) -> Result<Self> {
        let project = config.project_name()?;
        let image = format!("{}:{version}", config.image);
        let network_name = project.as_str().to_string();

        Ok(Self {
            project,
            config,
            version: version.to_string(),
            image,
            network_name,
            image_working_dir: String::new(),
            env: HashMap::new(),
            service_info: HashMap::new(),
        })
    }

    pub fn container_prefix(&self) -> String {
        self.project.container_prefix()
    }

    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    pub fn base_labels(&self) -> HashMap<String, String> {
        HashMap::from([
            ("tanjun".to_string(), "true".to_string()),
            ("tanjun.project".to_string(), self.project.to_string()),
            (
                "com.docker.compose.project".to_string(),
                self.container_prefix(),
            ),
        ])
    }

    pub fn volume_name(&self, mount_name: &str) -> String {
        format!("{}_app_{mount_name}", self.container_prefix())
    }

    /// Relative mount paths land inside the image's working directory.
    pub fn resolve_mount_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            return path.to_string();
        }

        format!("{}/{path}", self.image_working_dir.trim_end_matches('/'))
    }

    pub fn app_mounts(&self) -> Vec<Mount> {
        self.config
            .app
            .mounts
            .iter()
            .filter(|mount| !mount.path.is_empty())
            .map(|mount| Mount {
                typ: Some(MountTypeEnum::VOLUME),
                source: Some(self.volume_name(&mount.name)),
                target: Some(self.resolve_mount_path(&mount.path)),
                ..Default::default()
            })
            .collect()
    }

    /// App-shaped containers join both the shared proxy network and the
    /// project's own network.
    pub fn app_networks(&self) -> NetworkingConfig {
        NetworkingConfig {
            endpoints_config: Some(HashMap::from([
                (PUBLIC_NETWORK.to_string(), EndpointSettings::default()),
                (self.network_name.clone(), EndpointSettings::default()),
            ])),
        }
    }

    fn app_body(&self) -> ContainerCreateBody {
        let mut labels = self.base_labels();
        labels.insert("tanjun.app".to_string(), "true".to_string());
        labels.insert("com.docker.compose.service".to_string(), "web".to_string());

        ContainerCreateBody {
            image: Some(self.image.clone()),
            env: Some(self.env_list()),
            labels: Some(labels),
            host_config: Some(HostConfig {
                mounts: Some(self.app_mounts()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            networking_config: Some(self.app_networks()),
            ..Default::default()
        }
    }
}

/// One full reconciliation: bring sidecars up, run hooks, start the new app
/// container, cut the proxy over, drain the old generation, start workers and
/// cronjobs, prune old versions. Each step is resumable on the next deploy
/// because all state lives in labels and the KV store.
pub async fn deploy(docker: &Docker, config: &ProjectConfig, version: &str) -> Result<()> {
    let mut deploy = DeployContext::new(config.clone(), version)?;

    // config-level problems are fatal before anything is touched
    for (name, service_config) in &config.services {
        let adapter = service::find_service(&service_config.service_type)?;
        adapter.validate(name, service_config)?;
    }

    ensure_image(docker, &deploy.image).await?;

    let image = docker.inspect_image(&deploy.image).await?;
    deploy.image_working_dir = image
        .config
        .and_then(|config| config.working_dir)
        .unwrap_or_default();

    let mut kv = KvClient::connect(docker).await?;
    let result = run_pipeline(docker, &mut deploy, &mut kv).await;
    kv.close().await;

    result
}

async fn run_pipeline(
    docker: &Docker,
    deploy: &mut DeployContext,
    kv: &mut KvClient,
) -> Result<()> {
    ensure_project_network(docker, deploy).await?;

    let before_apps =
        list_labeled_containers(docker, &deploy.project, &["tanjun.app=true"], false).await?;

    ensure_volumes(docker, deploy).await?;

    start_services(docker, deploy).await?;

    deploy.env =
        prepare_environment_variables(&deploy.config, &deploy.project, &deploy.service_info, kv)
            .await?;

    let before_workers =
        list_labeled_containers(docker, &deploy.project, &["tanjun.worker"], false).await?;
    let before_cronjobs =
        list_labeled_containers(docker, &deploy.project, &["tanjun.cronjob"], false).await?;

    if !before_workers.is_empty() {
        info!("Stopping old worker containers");
        stop_containers(docker, &before_workers).await?;
    }

    if !before_cronjobs.is_empty() {
        info!("Stopping old cronjob containers");
        stop_containers(docker, &before_cronjobs).await?;
    }

    let mut drained = before_workers.clone();
    drained.extend(before_cronjobs.iter().cloned());

    if kv.get(&deploy.project.setup_key()).await?.is_empty() {
        info!("First deploy of project {}", deploy.project);
        kv.set(&deploy.project.setup_key(), "true").await?;
    }

    if let Some(hook_command) = deploy.config.app.hooks.deploy.clone() {
        if let Err(err) = hook::run_hook_in_container(docker, deploy, &hook_command).await {
            restore_drained(docker, &drained).await;
            return Err(err.context("deploy hook failed"));
        }
    }

    let container_name = format!(
        "{}_app_{}",
        deploy.container_prefix(),
        rand::thread_rng().gen_range(0..1_000_000)
    );

    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: Some(container_name),
                ..Default::default()
            }),
            deploy.app_body(),
        )
        .await
        .context("creating the app container")?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
        .context("starting the app container")?;

    if let Err(err) = wait_for_healthy(docker, &created.id, APP_HEALTH_TIMEOUT_SECS).await {
        remove_new_app(docker, &created.id).await;
        restore_drained(docker, &drained).await;
        return Err(err.context("app container did not become healthy, keeping the old one"));
    }

    let inspect = docker
        .inspect_container(&created.id, None::<InspectContainerOptions>)
        .await?;

    let network_settings = inspect.network_settings.unwrap_or_default();
    let proxy_ip = network_settings
        .networks
        .as_ref()
        .and_then(|networks| networks.get(PUBLIC_NETWORK))
        .and_then(|endpoint| endpoint.ip_address.clone())
        .context("app container has no address on the public network")?;

    let exposed = network_settings
        .ports
        .map(|ports| ports.keys().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    let proxy_port = select_app_port(deploy.config.proxy.app_port, exposed);

    info!("Routing traffic to the new container");

    let command = proxy::deploy_command(&deploy.config, &deploy.project, &proxy_ip, proxy_port);

    if let Err(err) = proxy::run_proxy_command(docker, command).await {
        // compensating action: the old generation keeps serving
        remove_new_app(docker, &created.id).await;
        restore_drained(docker, &drained).await;
        return Err(err);
    }

    let mut old = before_apps;
    old.extend(before_workers);
    old.extend(before_cronjobs);
    remove_containers(docker, &old).await?;

    worker::start_workers(docker, deploy).await?;
    cronjob::start_cronjobs(docker, deploy).await?;

    if let Some(hook_command) = deploy.config.app.hooks.post_deploy.clone() {
        hook::run_hook_in_container(docker, deploy, &hook_command)
            .await
            .context("post-deploy hook failed (the new version is already serving traffic)")?;
    }

    version::prune(
        docker,
        &deploy.config.image,
        deploy.config.keep_versions,
        Some(&deploy.version),
    )
    .await
    .context("pruning old versions failed (the deploy itself succeeded)")?;

    Ok(())
}

async fn remove_new_app(docker: &Docker, container_id: &str) {
    if let Err(err) = docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        warn!("could not remove the failed app container: {err}");
    }
}

async fn restore_drained(docker: &Docker, drained: &[ContainerSummary]) {
    if drained.is_empty() {
        return;
    }

    info!("Restarting previous worker and cronjob containers");

    if let Err(err) = start_containers(docker, drained).await {
        warn!("could not restart previous containers: {err}");
    }
}

pub async fn ensure_project_network(docker: &Docker, deploy: &DeployContext) -> Result<()> {
    let options = ListNetworksOptions {
        filters: Some(HashMap::from([(
            "name".to_string(),
            vec![deploy.network_name.clone()],
        )])),
    };

    let networks = docker.list_networks(Some(options)).await?;

    if networks
        .iter()
        .any(|network| network.name.as_deref() == Some(deploy.network_name.as_str()))
    {
        return Ok(());
    }

    docker
        .create_network(NetworkCreateRequest {
            name: deploy.network_name.clone(),
            labels: Some(deploy.base_labels()),
            ..Default::default()
        })
        .await
        .context("creating the project network")?;

    Ok(())
}

/// Create any missing labeled volumes, then chown them to the uid the app
/// image runs as (a one-shot container does the chown).
async fn ensure_volumes(docker: &Docker, deploy: &DeployContext) -> Result<()> {
    if deploy.config.app.mounts.is_empty() {
        return Ok(());
    }

    ensure_image(docker, CHOWN_IMAGE).await?;

    let uid = detect_app_uid(docker, &deploy.image).await;

    let options = ListVolumesOptions {
        filters: Some(HashMap::from([(
            "label".to_string(),
            vec![format!("tanjun.project={}", deploy.project)],
        )])),
    };

    let known = docker
        .list_volumes(Some(options))
        .await?
        .volumes
        .unwrap_or_default();

    for mount in &deploy.config.app.mounts {
        let volume_name = deploy.volume_name(&mount.name);

        if known.iter().any(|volume| volume.name == volume_name) {
            continue;
        }

        docker
            .create_volume(VolumeCreateOptions {
                name: Some(volume_name.clone()),
                labels: Some(deploy.base_labels()),
                ..Default::default()
            })
            .await
            .with_context(|| format!("creating volume {volume_name}"))?;

        let body = ContainerCreateBody {
            image: Some(CHOWN_IMAGE.to_string()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("chown -R {uid}:{uid} /volume"),
            ]),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                mounts: Some(vec![Mount {
                    typ: Some(MountTypeEnum::VOLUME),
                    source: Some(volume_name.clone()),
                    target: Some("/volume".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let chown = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(format!("{volume_name}_chown")),
                    ..Default::default()
                }),
                body,
            )
            .await?;

        docker
            .start_container(&chown.id, None::<StartContainerOptions>)
            .await?;
    }

    Ok(())
}

/// Bring every configured service up, one task per service. The attach-info
/// map is written under a mutex because the expression context needs it
/// complete before env resolution starts.
async fn start_services(docker: &Docker, deploy: &mut DeployContext) -> Result<()> {
    if deploy.config.services.is_empty() {
        return Ok(());
    }

    let existing =
        list_labeled_containers(docker, &deploy.project, &["tanjun.service"], true).await?;

    let info = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
    let shared = Arc::new(deploy.clone());
    let mut set = JoinSet::new();

    for (name, service_config) in deploy.config.services.clone() {
        let docker = docker.clone();
        let info = Arc::clone(&info);
        let shared = Arc::clone(&shared);
        let existing_id = existing
            .iter()
            .find(|container| {
                container
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get("tanjun.service"))
                    .map(|value| value == &name)
                    .unwrap_or(false)
            })
            .and_then(|container| container.id.clone());

        set.spawn(async move {
            let adapter = service::find_service(&service_config.service_type)?;

            let attach = adapter.attach_info(&name, &service_config);
            info.lock().await.insert(name.clone(), attach);

            let existing = match existing_id {
                Some(id) => Some(
                    docker
                        .inspect_container(&id, None::<InspectContainerOptions>)
                        .await?,
                ),
                None => None,
            };

            adapter.deploy(&docker, &name, &shared, existing.as_ref()).await
        });
    }

    while let Some(result) = set.join_next().await {
        result.context("service task panicked")??;
    }

    deploy.service_info = info.lock().await.clone();

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn context() -> DeployContext {
        let config: ProjectConfig = serde_yaml::from_str(
            r#"
name: hello
image: ghcr.io/u/hello
server:
  address: 192.168.0.10
proxy:
  host: hello.example.com
app:
  mounts:
    - name: data
      path: var/data
    - name: files
      path: /files
"#,
        )
        .unwrap();

        let mut deploy = DeployContext::new(config, "gifted-banzai").unwrap();
        deploy.image_working_dir = "/var/www/html".to_string();
        deploy
    }

    #[test]
    fn test_image_reference() {
        assert_eq!(context().image, "ghcr.io/u/hello:gifted-banzai");
    }

    #[test]
    fn test_mount_paths_resolve_against_the_image_working_dir() {
        let deploy = context();

        assert_eq!(deploy.resolve_mount_path("var/data"), "/var/www/html/var/data");
        assert_eq!(deploy.resolve_mount_path("/files"), "/files");
    }

    #[test]
    fn test_app_body_labels_and_networks() {
        let deploy = context();
        let body = deploy.app_body();

        let labels = body.labels.unwrap();
        assert_eq!(labels["tanjun"], "true");
        assert_eq!(labels["tanjun.project"], "hello");
        assert_eq!(labels["tanjun.app"], "true");

        let networks = body
            .networking_config
            .unwrap()
            .endpoints_config
            .unwrap();
        assert!(networks.contains_key(PUBLIC_NETWORK));
        assert!(networks.contains_key("hello"));

        let restart = body.host_config.unwrap().restart_policy.unwrap();
        assert_eq!(restart.name, Some(RestartPolicyNameEnum::UNLESS_STOPPED));
    }

    #[test]
    fn test_app_mounts_carry_volume_names() {
        let deploy = context();
        let mounts = deploy.app_mounts();

        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].source.as_deref(), Some("tanjun_hello_app_data"));
        assert_eq!(
            mounts[0].target.as_deref(),
            Some("/var/www/html/var/data")
        );
        assert_eq!(mounts[1].target.as_deref(), Some("/files"));
    }

    #[test]
    fn test_env_list_format() {
        let mut deploy = context();
        deploy.env.insert("GREETING".to_string(), "hi".to_string());

        assert_eq!(deploy.env_list(), vec!["GREETING=hi".to_string()]);
    }
}
