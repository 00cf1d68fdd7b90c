use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

fn pem_from_env(name: &str) -> Result<Vec<u8>, anyhow::Error> {
    let encoded = env::var(name).with_context(|| format!("{name} env var is required"))?;

    BASE64
        .decode(encoded)
        .with_context(|| format!("{name} is not valid base64"))
}

/// TLS 1.3 only, and every client must present a certificate signed by the
/// session CA. Anything else on the port is dropped at the handshake.
fn server_config(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<ServerConfig, anyhow::Error> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &*ca_pem) {
        roots.add(cert.context("unreadable CA certificate")?)?;
    }

    let certs = rustls_pemfile::certs(&mut &*cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .context("unreadable server certificate")?;
    let key = rustls_pemfile::private_key(&mut &*key_pem)
        .context("unreadable server key")?
        .context("no private key in TLS_SERVER_KEY")?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("building client verifier")?;

    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(config)
}

async fn handle_client(tls: TlsAcceptor, inbound: TcpStream, target: String) {
    let mut inbound = match tls.accept(inbound).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("rejected connection: {err}");
            return;
        }
    };

    let mut outbound = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(err) => {
            error!("could not reach forward target {target}: {err}");
            return;
        }
    };

    if let Err(err) = copy_bidirectional(&mut inbound, &mut outbound).await {
        warn!("connection to {target} ended: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    let [_, target, external_port] = args.as_slice() else {
        bail!("usage: tcp-proxy <container-ip:container-port> <external-port>");
    };

    let config = server_config(
        &pem_from_env("TLS_CA_CERT")?,
        &pem_from_env("TLS_SERVER_CERT")?,
        &pem_from_env("TLS_SERVER_KEY")?,
    )?;
    let tls = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind(format!("0.0.0.0:{external_port}")).await?;
    info!("listening on port {external_port}, forwarding to {target}");

    loop {
        let (inbound, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };

        tracing::debug!("accepted connection from {peer}");
        tokio::spawn(handle_client(tls.clone(), inbound, target.clone()));
    }
}

#[cfg(test)]
mod tests {
    use rustls::pki_types::ServerName;
    use rustls::ClientConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    use super::*;

    fn client_config(pki: &tanjun_common::mtls::TunnelPki, with_cert: bool) -> ClientConfig {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pki.ca_cert.as_bytes()) {
            roots.add(cert.unwrap()).unwrap();
        }

        let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_root_certificates(roots);

        if with_cert {
            let certs = rustls_pemfile::certs(&mut pki.client_cert.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .unwrap();
            let key = rustls_pemfile::private_key(&mut pki.client_key.as_bytes())
                .unwrap()
                .unwrap();
            builder.with_client_auth_cert(certs, key).unwrap()
        } else {
            builder.with_no_client_auth()
        }
    }

    #[tokio::test]
    async fn test_pipes_bytes_for_authenticated_clients() {
        let pki = tanjun_common::mtls::generate("127.0.0.1").unwrap();

        // stand-in for the target container: echoes one payload back
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let config = server_config(
            pki.ca_cert.as_bytes(),
            pki.server_cert.as_bytes(),
            pki.server_key.as_bytes(),
        )
        .unwrap();
        let tls = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (inbound, _) = listener.accept().await.unwrap();
            handle_client(tls, inbound, echo_addr.to_string()).await;
        });

        let connector = TlsConnector::from(Arc::new(client_config(&pki, true)));
        let tcp = TcpStream::connect(listen_addr).await.unwrap();
        let mut stream = connector
            .connect(ServerName::try_from("127.0.0.1").unwrap(), tcp)
            .await
            .unwrap();

        stream.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");
    }

    #[tokio::test]
    async fn test_rejects_clients_without_certificates() {
        let pki = tanjun_common::mtls::generate("127.0.0.1").unwrap();

        let config = server_config(
            pki.ca_cert.as_bytes(),
            pki.server_cert.as_bytes(),
            pki.server_key.as_bytes(),
        )
        .unwrap();
        let tls = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (inbound, _) = listener.accept().await.unwrap();
            handle_client(tls, inbound, "127.0.0.1:9".to_string()).await;
        });

        let connector = TlsConnector::from(Arc::new(client_config(&pki, false)));
        let tcp = TcpStream::connect(listen_addr).await.unwrap();
        let mut stream = connector
            .connect(ServerName::try_from("127.0.0.1").unwrap(), tcp)
            .await
            .unwrap();

        // the server aborts the handshake once the certificate request goes
        // unanswered, which surfaces on the first read
        let mut buf = [0u8; 1];
        assert!(stream.read_exact(&mut buf).await.is_err());
    }
}
