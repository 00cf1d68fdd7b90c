use std::collections::HashMap;

use anyhow::{Context, Result};
use bollard::query_parameters::{
    KillContainerOptions, ListNetworksOptions, ListVolumesOptions, RemoveContainerOptions,
    RemoveVolumeOptions,
};
use bollard::Docker;
use tanjun_common::project::ProjectName;
use tracing::warn;

use super::helper::list_labeled_containers;
use super::kv::KvClient;
use super::proxy;

/// Tear a project down completely: every labeled container, volume and
/// network, the KV entries, and the proxy route.
pub async fn destroy_project(docker: &Docker, project: &ProjectName) -> Result<()> {
    let containers = list_labeled_containers(docker, project, &[], true).await?;

    for container in containers {
        let id = container.id.unwrap_or_default();

        if let Err(err) = docker
            .kill_container(
                &id,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
        {
            warn!("could not kill container {id}: {err}");
        }

        docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("removing container {id}"))?;
    }

    let label_filter = HashMap::from([(
        "label".to_string(),
        vec![format!("tanjun.project={project}")],
    )]);

    let volumes = docker
        .list_volumes(Some(ListVolumesOptions {
            filters: Some(label_filter.clone()),
        }))
        .await?
        .volumes
        .unwrap_or_default();

    for volume in volumes {
        docker
            .remove_volume(&volume.name, Some(RemoveVolumeOptions { force: true }))
            .await
            .with_context(|| format!("removing volume {}", volume.name))?;
    }

    let networks = docker
        .list_networks(Some(ListNetworksOptions {
            filters: Some(label_filter),
        }))
        .await?;

    for network in networks {
        let id = network.id.unwrap_or_default();
        docker
            .remove_network(&id)
            .await
            .with_context(|| format!("removing network {id}"))?;
    }

    let mut kv = KvClient::connect(docker).await?;
    let kv_result = async {
        kv.del(&project.secrets_key()).await?;
        kv.del(&project.setup_key()).await
    }
    .await;
    kv.close().await;
    kv_result?;

    if let Err(err) = proxy::run_proxy_command(docker, proxy::remove_command(project)).await {
        // a project that never deployed has no route
        if !err.to_string().contains("service not found") {
            return Err(err);
        }
    }

    Ok(())
}
