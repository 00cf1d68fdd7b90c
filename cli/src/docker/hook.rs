use std::time::Duration;

use anyhow::{bail, Context, Result};
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use rand::Rng;
use tokio::io::AsyncWriteExt;

use super::deploy::DeployContext;

const HOOK_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Run a user-supplied shell command in a one-shot container built from the
/// new image, with the deploy's full env and mounts, joined to both networks.
/// Output is streamed through; a non-zero exit or blowing the deadline fails
/// the deploy.
pub async fn run_hook_in_container(
    docker: &Docker,
    deploy: &DeployContext,
    hook: &str,
) -> Result<()> {
    let container_name = format!(
        "{}_{}_hook",
        deploy.container_prefix(),
        rand::thread_rng().gen_range(0..1_000_000)
    );

    let mut labels = deploy.base_labels();
    labels.insert("com.docker.compose.service".to_string(), "hook".to_string());

    let body = ContainerCreateBody {
        image: Some(deploy.image.clone()),
        env: Some(deploy.env_list()),
        entrypoint: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            hook.to_string(),
        ]),
        cmd: Some(vec![]),
        labels: Some(labels),
        host_config: Some(HostConfig {
            mounts: Some(deploy.app_mounts()),
            ..Default::default()
        }),
        networking_config: Some(deploy.app_networks()),
        ..Default::default()
    };

    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: Some(container_name),
                ..Default::default()
            }),
            body,
        )
        .await
        .context("creating the hook container")?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
        .context("starting the hook container")?;

    let result = tokio::time::timeout(HOOK_DEADLINE, stream_hook(docker, &created.id)).await;

    let removal = docker
        .remove_container(
            &created.id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await;

    let exit_code = match result {
        Ok(streamed) => streamed?,
        Err(_) => bail!("hook did not finish within 5 minutes"),
    };

    removal.context("removing the hook container")?;

    if exit_code != 0 {
        bail!("hook exited with code {exit_code}");
    }

    Ok(())
}

async fn stream_hook(docker: &Docker, container_id: &str) -> Result<i64> {
    let mut logs = docker.logs(
        container_id,
        Some(LogsOptions {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        }),
    );

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    while let Some(chunk) = logs.next().await {
        match chunk? {
            LogOutput::StdErr { message } => stderr.write_all(&message).await?,
            other => stdout.write_all(&other.into_bytes()).await?,
        }
    }
    stdout.flush().await?;
    stderr.flush().await?;

    let mut wait = docker.wait_container(container_id, None::<WaitContainerOptions>);

    while let Some(status) = wait.next().await {
        match status {
            Ok(response) => return Ok(response.status_code),
            Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                return Ok(code)
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(0)
}
