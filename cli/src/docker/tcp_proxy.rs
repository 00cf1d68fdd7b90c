use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bollard::models::{ContainerCreateBody, EndpointSettings, HostConfig, NetworkingConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, KillContainerOptions, StartContainerOptions,
};
use bollard::Docker;
use tanjun_common::mtls::{self, TunnelPki};
use tracing::warn;

use super::ensure_image;

pub const TCP_PROXY_IMAGE: &str = "ghcr.io/tanjun-sh/tanjun/tcp-proxy:v1";
const TUNNEL_PORT: &str = "6879/tcp";

/// A forwarder container next to the target, plus the session PKI the local
/// side needs to dial it.
pub struct TcpProxy {
    pub container_id: String,
    pub listen_port: String,
    pub pki: TunnelPki,
}

/// Place the mTLS forwarder on the target container's network. Docker picks
/// the host-bound port; it is read back from the inspect result.
pub async fn create_tcp_proxy(
    docker: &Docker,
    project: &tanjun_common::project::ProjectName,
    external_host: &str,
    container_id: &str,
    port: u16,
) -> Result<TcpProxy> {
    let pki = mtls::generate(external_host).context("generating tunnel certificates")?;

    ensure_image(docker, TCP_PROXY_IMAGE).await?;

    let inspect = docker
        .inspect_container(container_id, None::<InspectContainerOptions>)
        .await?;

    let networks = inspect
        .network_settings
        .and_then(|settings| settings.networks)
        .unwrap_or_default();

    let Some((network_name, endpoint)) = networks.into_iter().next() else {
        bail!("target container is not attached to any network");
    };

    let target_ip = endpoint
        .ip_address
        .filter(|ip| !ip.is_empty())
        .context("target container has no IP address")?;

    let body = ContainerCreateBody {
        image: Some(TCP_PROXY_IMAGE.to_string()),
        cmd: Some(vec![
            format!("{target_ip}:{port}"),
            "6879".to_string(),
        ]),
        env: Some(vec![
            format!("TLS_CA_CERT={}", BASE64.encode(&pki.ca_cert)),
            format!("TLS_SERVER_CERT={}", BASE64.encode(&pki.server_cert)),
            format!("TLS_SERVER_KEY={}", BASE64.encode(&pki.server_key)),
        ]),
        exposed_ports: Some(HashMap::from([(
            TUNNEL_PORT.to_string(),
            HashMap::new(),
        )])),
        labels: Some(HashMap::from([
            ("tanjun".to_string(), "true".to_string()),
            ("tanjun.project".to_string(), project.to_string()),
        ])),
        host_config: Some(HostConfig {
            auto_remove: Some(true),
            port_bindings: Some(HashMap::from([(
                TUNNEL_PORT.to_string(),
                Some(vec![PortBinding::default()]),
            )])),
            ..Default::default()
        }),
        networking_config: Some(NetworkingConfig {
            endpoints_config: Some(HashMap::from([(
                network_name,
                EndpointSettings::default(),
            )])),
        }),
        ..Default::default()
    };

    let created = docker
        .create_container(None::<CreateContainerOptions>, body)
        .await
        .context("creating the tunnel container")?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await
        .context("starting the tunnel container")?;

    let inspect = docker
        .inspect_container(&created.id, None::<InspectContainerOptions>)
        .await?;

    let listen_port = inspect
        .network_settings
        .and_then(|settings| settings.ports)
        .and_then(|ports| {
            ports
                .into_values()
                .flatten()
                .flatten()
                .find_map(|binding| binding.host_port)
        })
        .context("tunnel container has no host-bound port")?;

    Ok(TcpProxy {
        container_id: created.id,
        listen_port,
        pki,
    })
}

/// Always runs on exit, including on interrupt: the forwarder must not
/// outlive the CLI.
pub async fn remove_tcp_proxy(docker: &Docker, container_id: &str) {
    if let Err(err) = docker
        .kill_container(
            container_id,
            Some(KillContainerOptions {
                signal: "SIGKILL".to_string(),
            }),
        )
        .await
    {
        warn!("could not kill the tunnel container: {err}");
    }
}
