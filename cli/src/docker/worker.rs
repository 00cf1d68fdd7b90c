use anyhow::{Context, Result};
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{CreateContainerOptions, StartContainerOptions};
use bollard::Docker;
use rand::Rng;
use tanjun_common::config::WorkerConfig;
use tokio::task::JoinSet;

use super::deploy::DeployContext;

/// Start every configured worker, one task per worker, one task per replica
/// inside that. Workers share the app scaffold but run their own command.
pub async fn start_workers(docker: &Docker, deploy: &DeployContext) -> Result<()> {
    let mut set = JoinSet::new();

    for (name, worker) in deploy.config.app.workers.clone() {
        let docker = docker.clone();
        let deploy = deploy.clone();

        set.spawn(async move { start_worker(&docker, &deploy, &name, &worker).await });
    }

    while let Some(result) = set.join_next().await {
        result.context("worker task panicked")??;
    }

    Ok(())
}

pub(crate) fn worker_body(deploy: &DeployContext, name: &str, worker: &WorkerConfig) -> ContainerCreateBody {
    let mut body = ContainerCreateBody {
        image: Some(deploy.image.clone()),
        env: Some(deploy.env_list()),
        entrypoint: Some(vec!["sh".to_string(), "-c".to_string()]),
        cmd: Some(vec![worker.command.clone()]),
        networking_config: Some(deploy.app_networks()),
        ..Default::default()
    };

    let mut labels = deploy.base_labels();
    labels.insert("tanjun.worker".to_string(), name.to_string());
    labels.insert("com.docker.compose.service".to_string(), name.to_string());
    body.labels = Some(labels);

    body.host_config = Some(bollard::models::HostConfig {
        mounts: Some(deploy.app_mounts()),
        restart_policy: Some(bollard::models::RestartPolicy {
            name: Some(bollard::models::RestartPolicyNameEnum::UNLESS_STOPPED),
            ..Default::default()
        }),
        ..Default::default()
    });

    body
}

async fn start_worker(
    docker: &Docker,
    deploy: &DeployContext,
    name: &str,
    worker: &WorkerConfig,
) -> Result<()> {
    let replicas = worker.replicas.max(1);
    let mut set = JoinSet::new();

    for replica in 0..replicas {
        let docker = docker.clone();
        let body = worker_body(deploy, name, worker);
        let container_name = format!(
            "{}_{name}_{replica}_{}",
            deploy.container_prefix(),
            rand::thread_rng().gen_range(0..1_000_000)
        );

        set.spawn(async move {
            let created = docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: Some(container_name),
                        ..Default::default()
                    }),
                    body,
                )
                .await?;

            docker
                .start_container(&created.id, None::<StartContainerOptions>)
                .await
        });
    }

    while let Some(result) = set.join_next().await {
        result
            .context("worker replica task panicked")?
            .with_context(|| format!("starting worker {name}"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::docker::service::test_support::test_deploy_context;

    #[test]
    fn test_worker_body_shape() {
        let deploy = test_deploy_context("  {}\n");
        let worker = WorkerConfig {
            command: "bin/work".to_string(),
            replicas: 3,
        };

        let body = worker_body(&deploy, "jobs", &worker);

        assert_eq!(
            body.entrypoint,
            Some(vec!["sh".to_string(), "-c".to_string()])
        );
        assert_eq!(body.cmd, Some(vec!["bin/work".to_string()]));

        let labels = body.labels.unwrap();
        assert_eq!(labels["tanjun.worker"], "jobs");
        assert_eq!(labels["tanjun.project"], "hello");

        let restart = body.host_config.unwrap().restart_policy.unwrap();
        assert_eq!(
            restart.name,
            Some(bollard::models::RestartPolicyNameEnum::UNLESS_STOPPED)
        );
    }
}
