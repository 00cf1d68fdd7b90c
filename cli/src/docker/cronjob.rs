use anyhow::{bail, Context, Result};
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, Mount, MountTypeEnum, RestartPolicy, RestartPolicyNameEnum};
use bollard::query_parameters::{CreateContainerOptions, StartContainerOptions};
use bollard::Docker;
use futures::StreamExt;
use rand::Rng;
use tanjun_common::project::ProjectName;
use tanjun_common::scheduler::{SchedulerConfig, SchedulerJob, SCHEDULER_CONFIG_ENV};
use tokio::io::AsyncWriteExt;

use super::deploy::DeployContext;
use super::helper::list_labeled_containers;
use super::ensure_image;

pub const SCHEDULER_IMAGE: &str = "ghcr.io/tanjun-sh/tanjun/scheduler:v1";

/// Cronjobs get two containers: an idle app container the jobs exec into,
/// and the scheduler sidecar that fires them. Both are labeled so the next
/// deploy drains them.
pub async fn start_cronjobs(docker: &Docker, deploy: &DeployContext) -> Result<()> {
    if deploy.config.app.cronjobs.is_empty() {
        return Ok(());
    }

    let idle_id = start_idle_container(docker, deploy).await?;

    start_scheduler(docker, deploy, &idle_id).await
}

async fn start_idle_container(docker: &Docker, deploy: &DeployContext) -> Result<String> {
    let mut labels = deploy.base_labels();
    labels.insert("tanjun.cronjob".to_string(), "app".to_string());
    labels.insert(
        "com.docker.compose.service".to_string(),
        "cronjob".to_string(),
    );

    let body = ContainerCreateBody {
        image: Some(deploy.image.clone()),
        env: Some(deploy.env_list()),
        entrypoint: Some(vec!["sh".to_string()]),
        cmd: Some(vec![]),
        tty: Some(true),
        labels: Some(labels),
        host_config: Some(HostConfig {
            mounts: Some(deploy.app_mounts()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            ..Default::default()
        }),
        networking_config: Some(deploy.app_networks()),
        ..Default::default()
    };

    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: Some(format!(
                    "{}_cronjob_{}",
                    deploy.container_prefix(),
                    rand::thread_rng().gen_range(0..1_000_000)
                )),
                ..Default::default()
            }),
            body,
        )
        .await
        .context("creating the cronjob container")?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
        .context("starting the cronjob container")?;

    Ok(created.id)
}

pub(crate) fn scheduler_config(deploy: &DeployContext, idle_container_id: &str) -> SchedulerConfig {
    SchedulerConfig {
        container_id: idle_container_id.to_string(),
        jobs: deploy
            .config
            .app
            .cronjobs
            .iter()
            .map(|cronjob| SchedulerJob {
                name: cronjob.name.clone(),
                command: cronjob.command.clone(),
                schedule: cronjob.schedule.clone(),
            })
            .collect(),
    }
}

async fn start_scheduler(docker: &Docker, deploy: &DeployContext, idle_id: &str) -> Result<()> {
    ensure_image(docker, SCHEDULER_IMAGE).await?;

    let config = scheduler_config(deploy, idle_id);
    let encoded = serde_json::to_string(&config)?;

    let mut labels = deploy.base_labels();
    labels.insert("tanjun.cronjob".to_string(), "scheduler".to_string());
    labels.insert(
        "com.docker.compose.service".to_string(),
        "scheduler".to_string(),
    );

    let body = ContainerCreateBody {
        image: Some(SCHEDULER_IMAGE.to_string()),
        cmd: Some(vec!["server".to_string()]),
        env: Some(vec![format!("{SCHEDULER_CONFIG_ENV}={encoded}")]),
        labels: Some(labels),
        host_config: Some(HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            // the scheduler drives the host daemon to exec into the idle container
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some("/var/run/docker.sock".to_string()),
                target: Some("/var/run/docker.sock".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: Some(format!(
                    "{}_scheduler_{}",
                    deploy.container_prefix(),
                    rand::thread_rng().gen_range(0..1_000_000)
                )),
                ..Default::default()
            }),
            body,
        )
        .await
        .context("creating the scheduler container")?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
        .context("starting the scheduler container")
}

/// Delegate a `tanjun cronjob …` invocation to the scheduler sidecar's own
/// subcommands via exec, streaming its output through.
pub async fn run_scheduler_command(
    docker: &Docker,
    project: &ProjectName,
    args: Vec<String>,
) -> Result<()> {
    let containers =
        list_labeled_containers(docker, project, &["tanjun.cronjob=scheduler"], false).await?;

    let Some(container) = containers.first() else {
        bail!("no scheduler container found for project {project}, did you configure cronjobs?");
    };

    let mut cmd = vec!["/scheduler".to_string()];
    cmd.extend(args);

    let exec = docker
        .create_exec(
            container.id.as_deref().unwrap_or_default(),
            CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(cmd),
                ..Default::default()
            },
        )
        .await?;

    let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None::<StartExecOptions>)
        .await?
    else {
        bail!("scheduler exec was not attached");
    };

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    while let Some(chunk) = output.next().await {
        match chunk? {
            LogOutput::StdErr { message } => stderr.write_all(&message).await?,
            other => stdout.write_all(&other.into_bytes()).await?,
        }
    }
    stdout.flush().await?;
    stderr.flush().await?;

    let inspect = docker.inspect_exec(&exec.id).await?;

    if let Some(code) = inspect.exit_code {
        if code != 0 {
            bail!("scheduler command failed with exit code {code}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::docker::service::test_support::test_deploy_context;

    #[test]
    fn test_scheduler_config_embeds_idle_container_and_jobs() {
        let mut deploy = test_deploy_context("  {}\n");
        deploy.config.app.cronjobs = vec![tanjun_common::config::CronjobConfig {
            name: "tick".to_string(),
            schedule: "*/5 * * * *".to_string(),
            command: "bin/tick".to_string(),
        }];

        let config = scheduler_config(&deploy, "abc123");

        assert_eq!(config.container_id, "abc123");
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].schedule, "*/5 * * * *");

        let encoded = serde_json::to_string(&config).unwrap();
        assert!(encoded.contains("\"container_id\":\"abc123\""));
    }
}
