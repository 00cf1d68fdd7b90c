pub mod cronjob;
pub mod deploy;
pub mod destroy;
pub mod env;
pub mod helper;
pub mod hook;
pub mod kv;
pub mod locator;
pub mod proxy;
pub mod secrets;
pub mod service;
pub mod tcp_proxy;
pub mod version;
pub mod worker;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bollard::auth::DockerCredentials;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, ListImagesOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tanjun_common::config::ServerConfig;
use tracing::{debug, warn};

const SSH_CONNECT_TIMEOUT_SECS: u64 = 120;

/// Connect to the project's Docker daemon: the local one for loopback
/// addresses, otherwise over an SSH tunnel.
pub fn connect(server: &ServerConfig) -> Result<Docker> {
    let docker = if is_loopback(&server.address) {
        Docker::connect_with_local_defaults()?
    } else {
        let host = format!(
            "ssh://{}@{}:{}",
            server.username, server.address, server.port
        );
        debug!("connecting to docker via {host}");
        Docker::connect_with_ssh(&host, SSH_CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
    };

    Ok(docker)
}

/// The build daemon on the operator's machine, used unless `remote_build`.
pub fn connect_local() -> Result<Docker> {
    Ok(Docker::connect_with_local_defaults()?)
}

fn is_loopback(address: &str) -> bool {
    address == "localhost"
        || address
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerConfigAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

fn docker_config_path() -> Option<PathBuf> {
    std::env::var_os("DOCKER_CONFIG")
        .map(|dir| PathBuf::from(dir).join("config.json"))
        .or_else(|| dirs::home_dir().map(|home| home.join(".docker").join("config.json")))
}

fn load_docker_config() -> DockerConfigFile {
    let Some(path) = docker_config_path() else {
        return DockerConfigFile::default();
    };

    let Ok(raw) = std::fs::read_to_string(&path) else {
        return DockerConfigFile::default();
    };

    serde_json::from_str(&raw).unwrap_or_else(|err| {
        warn!("could not parse {}: {err}", path.display());
        DockerConfigFile::default()
    })
}

fn credentials_for(config: &DockerConfigFile, registry: &str) -> Option<DockerCredentials> {
    let auth = config.auths.get(registry)?;

    let (username, password) = match (&auth.username, &auth.password) {
        (Some(username), Some(password)) => (username.clone(), password.clone()),
        _ => {
            let decoded = BASE64.decode(auth.auth.as_deref()?).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            (username.to_string(), password.to_string())
        }
    };

    Some(DockerCredentials {
        username: Some(username),
        password: Some(password),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    })
}

/// Registry prefix of an image reference: everything before the first slash.
pub fn registry_of(image: &str) -> Option<&str> {
    image.contains('/').then(|| image.split('/').next().unwrap())
}

/// Pull credentials for one image, from the operator's docker config.
pub fn registry_auth(image: &str) -> Option<DockerCredentials> {
    let registry = registry_of(image)?;
    credentials_for(&load_docker_config(), registry)
}

/// Credentials for every registry the operator is logged in to, keyed by
/// registry host. The BuildKit session wants the full map.
pub fn all_registry_auth() -> HashMap<String, DockerCredentials> {
    let config = load_docker_config();

    config
        .auths
        .keys()
        .filter_map(|registry| {
            credentials_for(&config, registry).map(|creds| (registry.clone(), creds))
        })
        .collect()
}

/// Pull an image only when the daemon does not already have it, surfacing
/// progress on a spinner and the first daemon-reported error as the failure.
pub async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    let images = docker
        .list_images(None::<ListImagesOptions>)
        .await
        .context("listing images")?;

    let present = images
        .iter()
        .any(|summary| summary.repo_tags.iter().any(|tag| tag == image));

    if present {
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    spinner.set_message(format!("Pulling image {image}"));

    let options = CreateImageOptions {
        from_image: Some(image.to_string()),
        ..Default::default()
    };

    let mut stream = docker.create_image(Some(options), None, registry_auth(image));

    while let Some(message) = stream.next().await {
        let message = message.with_context(|| format!("pulling {image}"))?;

        if let Some(error) = message
            .error
            .or(message.error_detail.and_then(|detail| detail.message))
        {
            spinner.finish_and_clear();
            return Err(anyhow!("docker error: {error}"));
        }

        if let Some(status) = message.status {
            match (message.id, message.progress) {
                (Some(id), Some(progress)) => {
                    spinner.set_message(format!("{status} :: {id} :: {progress}"))
                }
                (Some(id), None) => spinner.set_message(format!("{status} :: {id}")),
                _ => spinner.set_message(status),
            }
        }

        spinner.tick();
    }

    spinner.finish_and_clear();

    Ok(())
}

/// Find out which UID the app image runs as, by letting a one-shot container
/// print `id -u`. Falls back to 1000 when anything goes sideways.
pub async fn detect_app_uid(docker: &Docker, image: &str) -> String {
    match app_uid(docker, image).await {
        Ok(uid) if !uid.is_empty() => uid,
        Ok(_) => "1000".to_string(),
        Err(err) => {
            warn!("could not determine app container uid, falling back to 1000: {err}");
            "1000".to_string()
        }
    }
}

async fn app_uid(docker: &Docker, image: &str) -> Result<String> {
    let body = ContainerCreateBody {
        image: Some(image.to_string()),
        entrypoint: Some(vec!["id".to_string(), "-u".to_string()]),
        cmd: Some(vec![]),
        host_config: Some(HostConfig::default()),
        ..Default::default()
    };

    let created = docker.create_container(None::<CreateContainerOptions>, body).await?;

    docker
        .start_container(&created.id, None::<StartContainerOptions>)
        .await?;

    let mut wait = docker.wait_container(&created.id, None::<WaitContainerOptions>);
    while let Some(status) = wait.next().await {
        match status {
            Ok(_) => {}
            // a non-zero exit still carries usable output, keep going
            Err(bollard::errors::Error::DockerContainerWaitError { .. }) => break,
            Err(err) => return Err(err.into()),
        }
    }

    let mut logs = docker.logs(
        &created.id,
        Some(LogsOptions {
            stdout: true,
            ..Default::default()
        }),
    );

    let mut first_line = String::new();
    while let Some(chunk) = logs.next().await {
        let chunk = chunk?;
        first_line.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        if first_line.contains('\n') {
            break;
        }
    }

    docker
        .remove_container(
            &created.id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await?;

    Ok(first_line
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("localhost"));
        assert!(!is_loopback("192.168.0.10"));
        assert!(!is_loopback("example.com"));
    }

    #[test]
    fn test_registry_prefix() {
        assert_eq!(registry_of("ghcr.io/u/hello"), Some("ghcr.io"));
        assert_eq!(registry_of("alpine"), None);
    }

    #[test]
    fn test_credentials_decoding() {
        let config: DockerConfigFile = serde_json::from_str(
            r#"{"auths":{"ghcr.io":{"auth":"dXNlcjpzM2NyM3Q="}}}"#,
        )
        .unwrap();

        let creds = credentials_for(&config, "ghcr.io").unwrap();
        assert_eq!(creds.username.as_deref(), Some("user"));
        assert_eq!(creds.password.as_deref(), Some("s3cr3t"));

        assert!(credentials_for(&config, "docker.io").is_none());
    }
}
