use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use bollard::models::{ContainerSummary, HealthStatusEnum};
use bollard::query_parameters::{
    InspectContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::Docker;
use tanjun_common::project::ProjectName;
use tokio::task::JoinSet;

/// Ports never worth routing HTTP to: FPM, the proxy management port, https.
const SKIPPED_APP_PORTS: [u16; 3] = [9000, 2019, 443];
const DEFAULT_APP_PORT: u16 = 8000;

/// A label filter for this project, optionally narrowed further. The labels
/// are the only source of truth for what belongs to a project; container
/// names are advisory.
pub fn project_filter(project: &ProjectName, extra_labels: &[&str]) -> HashMap<String, Vec<String>> {
    let mut labels = vec![format!("tanjun.project={project}")];
    labels.extend(extra_labels.iter().map(ToString::to_string));

    HashMap::from([("label".to_string(), labels)])
}

pub async fn list_labeled_containers(
    docker: &Docker,
    project: &ProjectName,
    extra_labels: &[&str],
    all: bool,
) -> Result<Vec<ContainerSummary>> {
    let options = ListContainersOptions {
        all,
        filters: Some(project_filter(project, extra_labels)),
        ..Default::default()
    };

    docker
        .list_containers(Some(options))
        .await
        .context("listing containers")
}

pub async fn start_containers(docker: &Docker, containers: &[ContainerSummary]) -> Result<()> {
    let mut set = JoinSet::new();

    for container in containers {
        let docker = docker.clone();
        let id = container.id.clone().unwrap_or_default();

        set.spawn(async move {
            docker
                .start_container(&id, None::<StartContainerOptions>)
                .await
        });
    }

    join_all(set).await
}

/// Drain: stop without removing, so the containers can be restarted on a
/// failed rollout.
pub async fn stop_containers(docker: &Docker, containers: &[ContainerSummary]) -> Result<()> {
    let mut set = JoinSet::new();

    for container in containers {
        let docker = docker.clone();
        let id = container.id.clone().unwrap_or_default();

        set.spawn(async move {
            docker
                .stop_container(&id, None::<StopContainerOptions>)
                .await
        });
    }

    join_all(set).await
}

pub async fn remove_containers(docker: &Docker, containers: &[ContainerSummary]) -> Result<()> {
    let mut set = JoinSet::new();

    for container in containers {
        let docker = docker.clone();
        let id = container.id.clone().unwrap_or_default();

        set.spawn(async move {
            docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
        });
    }

    join_all(set).await
}

async fn join_all(mut set: JoinSet<Result<(), bollard::errors::Error>>) -> Result<()> {
    while let Some(result) = set.join_next().await {
        result.context("container task panicked")??;
    }

    Ok(())
}

/// Wait until the container reports healthy, or simply running when it has no
/// healthcheck. Polls once a second up to the timeout.
pub async fn wait_for_healthy(docker: &Docker, container_id: &str, timeout_secs: u64) -> Result<()> {
    for _ in 0..timeout_secs {
        let inspect = docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;

        if let Some(state) = inspect.state {
            let running = state.running.unwrap_or(false);
            let health = state.health.and_then(|health| health.status);

            let healthy = match health {
                None | Some(HealthStatusEnum::EMPTY) | Some(HealthStatusEnum::NONE) => running,
                Some(HealthStatusEnum::HEALTHY) => running,
                _ => false,
            };

            if healthy {
                return Ok(());
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    bail!("container did not become healthy within {timeout_secs} seconds")
}

/// Pick the port the proxy should route to. An explicit `proxy.app_port`
/// wins; otherwise the lowest exposed TCP port that is not on the skip list;
/// 8000 when nothing qualifies.
pub fn select_app_port<I>(configured: Option<u16>, exposed: I) -> u16
where
    I: IntoIterator<Item = String>,
{
    if let Some(port) = configured {
        return port;
    }

    let mut ports: Vec<u16> = exposed
        .into_iter()
        .filter_map(|spec| {
            let (port, proto) = spec.split_once('/').unwrap_or((spec.as_str(), "tcp"));

            if proto != "tcp" {
                return None;
            }

            port.parse().ok()
        })
        .collect();

    ports.sort_unstable();
    ports.dedup();

    ports
        .into_iter()
        .find(|port| !SKIPPED_APP_PORTS.contains(port))
        .unwrap_or(DEFAULT_APP_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(specs: &[&str]) -> Vec<String> {
        specs.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_configured_port_wins() {
        assert_eq!(select_app_port(Some(3000), ports(&["80/tcp"])), 3000);
    }

    #[test]
    fn test_lowest_non_reserved_port() {
        assert_eq!(
            select_app_port(
                None,
                ports(&["80/tcp", "443/tcp", "2019/tcp", "8000/tcp", "9000/tcp"])
            ),
            80
        );
    }

    #[test]
    fn test_reserved_ports_are_skipped() {
        assert_eq!(
            select_app_port(None, ports(&["443/tcp", "2019/tcp", "9000/tcp", "8000/tcp"])),
            8000
        );
    }

    #[test]
    fn test_udp_is_ignored_and_default_applies() {
        assert_eq!(select_app_port(None, ports(&["443/udp", "9000/tcp"])), 8000);
        assert_eq!(select_app_port(None, ports(&[])), 8000);
    }

    #[test]
    fn test_project_filter() {
        let project = ProjectName::from_human("hello").unwrap();
        let filter = project_filter(&project, &["tanjun.app=true"]);

        assert_eq!(
            filter["label"],
            vec!["tanjun.project=hello".to_string(), "tanjun.app=true".to_string()]
        );
    }
}
