use std::sync::Arc;

use anyhow::{Context, Result};
use bollard::Docker;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tanjun_common::config::ProjectConfig;
use tanjun_common::mtls::TunnelPki;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

use crate::docker::locator::find_project_container;
use crate::docker::tcp_proxy::{create_tcp_proxy, remove_tcp_proxy};

fn client_config(pki: &TunnelPki) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pki.ca_cert.as_bytes()) {
        roots.add(cert.context("unreadable CA certificate")?)?;
    }

    let certs = rustls_pemfile::certs(&mut pki.client_cert.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("unreadable client certificate")?;
    let key = rustls_pemfile::private_key(&mut pki.client_key.as_bytes())
        .context("unreadable client key")?
        .context("no client key generated")?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;

    Ok(config)
}

/// Forward a backend port to localhost: place the mTLS forwarder next to the
/// target container, then pipe every local connection through it. The
/// forwarder is removed on exit, Ctrl-C included.
pub async fn forward(
    docker: &Docker,
    config: &ProjectConfig,
    service: &str,
    port: u16,
    local_port: Option<u16>,
) -> Result<()> {
    let project = config.project_name()?;
    let container_id = find_project_container(docker, &project, Some(service)).await?;

    let proxy =
        create_tcp_proxy(docker, &project, &config.server.address, &container_id, port).await?;

    let result = serve_local(config, &proxy, local_port).await;

    remove_tcp_proxy(docker, &proxy.container_id).await;

    result
}

async fn serve_local(
    config: &ProjectConfig,
    proxy: &crate::docker::tcp_proxy::TcpProxy,
    local_port: Option<u16>,
) -> Result<()> {
    let connector = TlsConnector::from(Arc::new(client_config(&proxy.pki)?));
    let remote_addr = format!("{}:{}", config.server.address, proxy.listen_port);
    let server_name = ServerName::try_from(config.server.address.clone())
        .context("server address is not a valid TLS name")?;

    let listener = TcpListener::bind(("127.0.0.1", local_port.unwrap_or(0)))
        .await
        .context("binding the local port")?;

    info!(
        "Forwarding localhost:{} to {remote_addr}",
        listener.local_addr()?.port()
    );

    loop {
        let (mut inbound, _) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Closing the tunnel");
                return Ok(());
            }
        };

        let connector = connector.clone();
        let remote_addr = remote_addr.clone();
        let server_name = server_name.clone();

        tokio::spawn(async move {
            let tcp = match TcpStream::connect(&remote_addr).await {
                Ok(tcp) => tcp,
                Err(err) => {
                    error!("could not reach the forward service: {err}");
                    return;
                }
            };

            let mut outbound = match connector.connect(server_name, tcp).await {
                Ok(stream) => stream,
                Err(err) => {
                    error!("TLS handshake with the forward service failed: {err}");
                    return;
                }
            };

            if let Err(err) = copy_bidirectional(&mut inbound, &mut outbound).await {
                warn!("tunnel connection ended: {err}");
            }
        });
    }
}
