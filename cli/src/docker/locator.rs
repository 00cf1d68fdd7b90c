use anyhow::{bail, Result};
use bollard::Docker;
use tanjun_common::project::ProjectName;

use super::helper::list_labeled_containers;

/// Find the container a command targets: the app container by default, or a
/// named service's container.
pub async fn find_project_container(
    docker: &Docker,
    project: &ProjectName,
    service: Option<&str>,
) -> Result<String> {
    let label = match service {
        Some(service) => format!("tanjun.service={service}"),
        None => "tanjun.app=true".to_string(),
    };

    let containers = list_labeled_containers(docker, project, &[&label], false).await?;

    let Some(container) = containers.first() else {
        match service {
            Some(service) => bail!("no running container for service {service}"),
            None => bail!("no running app container for project {project}"),
        }
    };

    Ok(container.id.clone().unwrap_or_default())
}
