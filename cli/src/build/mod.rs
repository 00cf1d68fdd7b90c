pub mod dockerfile;
pub mod secrets;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use bollard::auth::DockerCredentials;
use bollard::grpc::build::{
    ImageBuildFrontendOptions, ImageBuildFrontendOptionsBuilder, ImageBuildLoadInput,
    ImageBuildPlatform,
};
use bollard::grpc::driver::docker_container::DockerContainerBuilder;
use bollard::grpc::driver::{Export, Image, ImageExporterEnum};
use bollard::grpc::export::ImageExporterOutputBuilder;
use bollard::grpc::registry::ImageRegistryOutputBuilder;
use bollard::query_parameters::{ImportImageOptions, RemoveContainerOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::TryStreamExt;
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use tanjun_common::config::ProjectConfig;
use tracing::{debug, info, warn};

use crate::docker;

/// Everything the build pipeline threads around, instead of hiding it in
/// context values: the config, the source root, and both daemon handles.
pub struct BuildSession {
    pub config: ProjectConfig,
    pub root: std::path::PathBuf,
    pub remote: Docker,
    pub build_daemon: Docker,
    pub architecture: String,
}

impl BuildSession {
    pub async fn open(config: &ProjectConfig, root: &Path) -> Result<Self> {
        let remote = docker::connect(&config.server)?;

        let info = remote.info().await.context("reading remote daemon info")?;
        let architecture = normalize_architecture(info.architecture.as_deref().unwrap_or("amd64"));

        let build_daemon = if config.build.remote_build {
            remote.clone()
        } else {
            docker::connect_local()?
        };

        Ok(Self {
            config: config.clone(),
            root: root.to_path_buf(),
            remote,
            build_daemon,
            architecture,
        })
    }
}

fn normalize_architecture(architecture: &str) -> String {
    match architecture {
        "aarch64" => "arm64".to_string(),
        "x86_64" => "amd64".to_string(),
        other => other.to_string(),
    }
}

/// Build one image version and get its tag back. The version name is random
/// and human-friendly; pushing (local build) or loading into the remote
/// daemon (remote build) has completed when this returns.
pub async fn build_image(config: &ProjectConfig, root: &Path) -> Result<String> {
    let session = BuildSession::open(config, root).await?;
    let project = config.project_name()?;

    let version = names::Generator::default()
        .next()
        .context("generating a version name")?;
    let image_ref = format!("{}:{version}", config.image);

    info!(
        "Building {image_ref} for linux/{}",
        session.architecture
    );

    let (dockerfile_text, ignore_patterns) = dockerfile::materialize(config, root)?;
    let context_tar = build_context_tar(root, &dockerfile_text, &ignore_patterns)?;
    debug!("build context is {} bytes", context_tar.len());

    let mut build_secrets = secrets::resolve_build_secrets(&session.remote, config, &project).await?;

    if config.build.ssh_passthrough {
        warn!("build.ssh_passthrough is not supported by this build driver, ignoring it");
    }

    let frontend = frontend_options(config, &session.architecture, &mut build_secrets);
    let load_input = ImageBuildLoadInput::Upload(Bytes::from(context_tar));

    let auth = docker::all_registry_auth();
    let credentials: HashMap<&str, DockerCredentials> = auth
        .iter()
        .map(|(registry, creds)| (registry.as_str(), creds.clone()))
        .collect();

    let mut builder = DockerContainerBuilder::new(&session.build_daemon);
    builder.network("host");
    let driver = builder.bootstrap().await.context("starting buildkitd")?;
    let buildkit_container = driver.name().to_string();

    let result = tokio::select! {
        result = solve(&session, driver, &image_ref, frontend, load_input, credentials) => result,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("build interrupted")),
    };

    // the buildkit container never outlives the build, success or not
    if let Err(err) = session
        .build_daemon
        .remove_container(
            &buildkit_container,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        warn!("could not remove buildkit container {buildkit_container}: {err}");
    }

    result?;

    Ok(version)
}

fn frontend_options(
    config: &ProjectConfig,
    architecture: &str,
    build_secrets: &mut HashMap<String, String>,
) -> ImageBuildFrontendOptions {
    let mut builder = ImageBuildFrontendOptionsBuilder::new().pull(true);

    for (key, value) in &config.build.args {
        builder = builder.buildarg(key, value);
    }

    // bollard's driver does not expose buildkit's secrets attachable, so the
    // resolved build secrets travel as build args
    for (key, value) in build_secrets.drain() {
        builder = builder.buildarg(&key, &value);
    }

    for (key, value) in &config.build.labels {
        builder = builder.label(key, value);
    }

    builder = builder.platforms(&ImageBuildPlatform {
        architecture: architecture.to_string(),
        os: "linux".to_string(),
        variant: None,
    });

    builder.build()
}

async fn solve(
    session: &BuildSession,
    driver: bollard::grpc::driver::docker_container::DockerContainer,
    image_ref: &str,
    frontend: ImageBuildFrontendOptions,
    load_input: ImageBuildLoadInput,
    credentials: HashMap<&str, DockerCredentials>,
) -> Result<()> {
    if session.config.build.remote_build {
        // export a docker tarball, then stream it into the remote daemon
        let scratch = tempdir()?;
        let tar_path = scratch.path().join("image.tar");

        let exporter = ImageExporterOutputBuilder::new(image_ref)
            .dest(&tar_path);

        driver
            .export(
                ImageExporterEnum::Docker(exporter),
                frontend,
                load_input,
                Some(credentials),
            )
            .await
            .context("solving the build")?;

        let tarball = tokio::fs::read(&tar_path).await.context("reading the exported image")?;

        session
            .remote
            .import_image(
                ImportImageOptions::default(),
                bollard::body_full(Bytes::from(tarball)),
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .context("loading the image into the remote daemon")?;

        Ok(())
    } else {
        let output = ImageRegistryOutputBuilder::new(image_ref).consume();

        driver
            .registry(output, frontend, load_input, Some(credentials))
            .await
            .context("solving and pushing the build")?;

        Ok(())
    }
}

fn tempdir() -> Result<tempfile::TempDir> {
    tempfile::tempdir().context("creating a scratch directory")
}

/// Tar up the source tree, minus the ignore patterns, with the materialized
/// Dockerfile injected at the root (it may be buildpack-generated).
fn build_context_tar(root: &Path, dockerfile_text: &str, ignore_patterns: &[String]) -> Result<Vec<u8>> {
    let mut overrides = OverrideBuilder::new(root);
    for pattern in ignore_patterns {
        // an override starting with ! excludes the match
        overrides
            .add(&format!("!{pattern}"))
            .with_context(|| format!("bad ignore pattern {pattern:?}"))?;
    }

    let walker = WalkBuilder::new(root)
        .overrides(overrides.build()?)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build();

    let mut builder = tar::Builder::new(Vec::new());

    for entry in walker {
        let entry = entry?;
        let path = entry.path();

        if path == root {
            continue;
        }

        let relative = path.strip_prefix(root)?;

        if relative == Path::new("Dockerfile") {
            continue;
        }

        let file_type = entry.file_type();

        if file_type.map(|t| t.is_dir()).unwrap_or(false) {
            builder.append_dir(relative, path)?;
        } else if file_type.map(|t| t.is_file()).unwrap_or(false) {
            builder.append_path_with_name(path, relative)?;
        }
    }

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile_text.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", dockerfile_text.as_bytes())?;

    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_architecture_normalization() {
        assert_eq!(normalize_architecture("aarch64"), "arm64");
        assert_eq!(normalize_architecture("x86_64"), "amd64");
        assert_eq!(normalize_architecture("arm64"), "arm64");
    }

    #[test]
    fn test_context_tar_honors_ignores_and_injects_the_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "print('hi')\n").unwrap();
        std::fs::write(dir.path().join(".tanjun.yml"), "name: hello\n").unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules").join("big.js"), "x").unwrap();

        let tar_bytes = build_context_tar(
            dir.path(),
            "FROM alpine\n",
            &["node_modules".to_string(), ".tanjun.yml".to_string()],
        )
        .unwrap();

        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        assert!(names.contains(&"app.py".to_string()));
        assert!(names.contains(&"Dockerfile".to_string()));
        assert!(!names.iter().any(|name| name.contains("node_modules")));
        assert!(!names.contains(&".tanjun.yml".to_string()));
    }

    #[test]
    fn test_user_dockerfile_on_disk_is_replaced_by_the_materialized_one() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM old\n").unwrap();

        let tar_bytes = build_context_tar(dir.path(), "FROM new\n", &[]).unwrap();

        // exactly one Dockerfile entry, carrying the materialized text
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let dockerfiles: Vec<String> = archive
            .entries()
            .unwrap()
            .filter_map(|entry| {
                let mut entry = entry.unwrap();
                if entry.path().unwrap() == Path::new("Dockerfile") {
                    use std::io::Read;
                    let mut text = String::new();
                    entry.read_to_string(&mut text).unwrap();
                    Some(text)
                } else {
                    None
                }
            })
            .collect();

        assert_eq!(dockerfiles, vec!["FROM new\n".to_string()]);
    }
}
