use std::collections::HashMap;

use anyhow::{Context, Result};
use bollard::models::{
    ContainerCreateBody, HostConfig, Mount, MountTypeEnum, NetworkCreateRequest, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, ListContainersOptions, ListNetworksOptions, StartContainerOptions,
};
use bollard::Docker;
use tanjun_common::{KV_CONTAINER, MANAGED_LABEL, PROXY_CONTAINER, PUBLIC_NETWORK};
use tracing::info;

use crate::docker::ensure_image;

const PROXY_IMAGE: &str = "basecamp/kamal-proxy:latest";
const KV_IMAGE: &str = "ghcr.io/tanjun-sh/tanjun/kv-store:v1";
const PROXY_CERT_VOLUME: &str = "tanjun-proxy-certs";

/// Everything a fresh host needs before the first deploy: the shared public
/// network, the reverse proxy with its certificate volume, the key-value
/// store, and the sysctl that lets the proxy bind low ports. Known-hosts
/// bootstrap and installing Docker itself happen outside this tool.
pub async fn setup(docker: &Docker) -> Result<()> {
    ensure_public_network(docker).await?;
    ensure_unprivileged_ports(docker).await?;
    ensure_proxy(docker).await?;
    ensure_kv(docker).await?;

    info!("Server is ready, deploy with `tanjun deploy`");

    Ok(())
}

async fn ensure_public_network(docker: &Docker) -> Result<()> {
    let options = ListNetworksOptions {
        filters: Some(HashMap::from([(
            "name".to_string(),
            vec![PUBLIC_NETWORK.to_string()],
        )])),
    };

    let networks = docker.list_networks(Some(options)).await?;

    if networks
        .iter()
        .any(|network| network.name.as_deref() == Some(PUBLIC_NETWORK))
    {
        return Ok(());
    }

    info!("Creating network {PUBLIC_NETWORK}");

    docker
        .create_network(NetworkCreateRequest {
            name: PUBLIC_NETWORK.to_string(),
            labels: Some(managed_labels()),
            ..Default::default()
        })
        .await
        .context("creating the public network")?;

    Ok(())
}

/// One-shot privileged helper so kamal-proxy can bind 80/443 as non-root.
async fn ensure_unprivileged_ports(docker: &Docker) -> Result<()> {
    ensure_image(docker, "alpine:latest").await?;

    let body = ContainerCreateBody {
        image: Some("alpine:latest".to_string()),
        cmd: Some(vec![
            "sysctl".to_string(),
            "-w".to_string(),
            "net.ipv4.ip_unprivileged_port_start=0".to_string(),
        ]),
        host_config: Some(HostConfig {
            auto_remove: Some(true),
            privileged: Some(true),
            network_mode: Some("host".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let created = docker.create_container(None::<CreateContainerOptions>, body).await?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
        .context("adjusting ip_unprivileged_port_start")?;

    Ok(())
}

async fn container_exists(docker: &Docker, name: &str) -> Result<bool> {
    let options = ListContainersOptions {
        all: true,
        filters: Some(HashMap::from([(
            "name".to_string(),
            vec![name.to_string()],
        )])),
        ..Default::default()
    };

    Ok(!docker.list_containers(Some(options)).await?.is_empty())
}

async fn ensure_proxy(docker: &Docker) -> Result<()> {
    if container_exists(docker, PROXY_CONTAINER).await? {
        return Ok(());
    }

    info!("Starting proxy container {PROXY_CONTAINER}");

    ensure_image(docker, PROXY_IMAGE).await?;

    let ports: HashMap<String, Option<Vec<PortBinding>>> = [
        ("80/tcp", "80"),
        ("443/tcp", "443"),
        ("443/udp", "443"),
    ]
    .into_iter()
    .map(|(container_port, host_port)| {
        (
            container_port.to_string(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        )
    })
    .collect();

    let body = ContainerCreateBody {
        image: Some(PROXY_IMAGE.to_string()),
        labels: Some(managed_labels()),
        exposed_ports: Some(
            ports
                .keys()
                .map(|port| (port.clone(), HashMap::new()))
                .collect(),
        ),
        host_config: Some(HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                ..Default::default()
            }),
            port_bindings: Some(ports),
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::VOLUME),
                source: Some(PROXY_CERT_VOLUME.to_string()),
                target: Some("/home/kamal-proxy/.config/kamal-proxy".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        networking_config: Some(bollard::models::NetworkingConfig {
            endpoints_config: Some(HashMap::from([(
                PUBLIC_NETWORK.to_string(),
                Default::default(),
            )])),
        }),
        ..Default::default()
    };

    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: Some(PROXY_CONTAINER.to_string()),
                ..Default::default()
            }),
            body,
        )
        .await
        .context("creating the proxy container")?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
        .context("starting the proxy container")?;

    Ok(())
}

async fn ensure_kv(docker: &Docker) -> Result<()> {
    if container_exists(docker, KV_CONTAINER).await? {
        return Ok(());
    }

    info!("Starting key-value container {KV_CONTAINER}");

    ensure_image(docker, KV_IMAGE).await?;

    let body = ContainerCreateBody {
        image: Some(KV_IMAGE.to_string()),
        labels: Some(managed_labels()),
        // the main process reads stdin, keep it open so the container idles
        open_stdin: Some(true),
        host_config: Some(HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let created = docker
        .create_container(
            Some(CreateContainerOptions {
                name: Some(KV_CONTAINER.to_string()),
                ..Default::default()
            }),
            body,
        )
        .await
        .context("creating the kv container")?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
        .context("starting the kv container")?;

    Ok(())
}

fn managed_labels() -> HashMap<String, String> {
    HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])
}
