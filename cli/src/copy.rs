use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use bollard::query_parameters::{DownloadFromContainerOptions, UploadToContainerOptions};
use bollard::Docker;
use bytes::Bytes;
use futures::TryStreamExt;
use tanjun_common::project::ProjectName;
use tracing::warn;

use crate::docker::locator::find_project_container;

/// `tanjun cp` addresses: `app:/path` or `{service}:/path` on the container
/// side, anything else is local.
pub enum CopyTarget {
    Local(PathBuf),
    Container { service: Option<String>, path: String },
}

pub fn parse_target(raw: &str) -> CopyTarget {
    match raw.split_once(':') {
        Some((service, path)) => {
            let service = if service == "app" || service == "application" {
                None
            } else {
                Some(service.to_string())
            };

            CopyTarget::Container {
                service,
                path: path.to_string(),
            }
        }
        None => CopyTarget::Local(PathBuf::from(raw)),
    }
}

pub async fn copy(
    docker: &Docker,
    project: &ProjectName,
    source: &str,
    destination: &str,
) -> Result<()> {
    match (parse_target(source), parse_target(destination)) {
        (CopyTarget::Container { service, path }, CopyTarget::Local(local)) => {
            let container = find_project_container(docker, project, service.as_deref()).await?;
            download_from_container(docker, &container, &path, &local).await
        }
        (CopyTarget::Local(local), CopyTarget::Container { service, path }) => {
            let container = find_project_container(docker, project, service.as_deref()).await?;
            upload_to_container(docker, &container, &local, &path).await
        }
        _ => bail!(
            "one side must be a container path, for example: tanjun cp app:/var/www/html/file ."
        ),
    }
}

async fn upload_to_container(
    docker: &Docker,
    container_id: &str,
    local: &Path,
    remote: &str,
) -> Result<()> {
    let mut builder = tar::Builder::new(Vec::new());

    let metadata = std::fs::metadata(local)
        .with_context(|| format!("reading {}", local.display()))?;

    if metadata.is_dir() {
        builder.append_dir_all(".", local)?;
    } else {
        let name = local
            .file_name()
            .context("source has no file name")?
            .to_string_lossy()
            .into_owned();
        let mut file = std::fs::File::open(local)?;
        builder.append_file(&name, &mut file)?;
    }

    let archive = builder.into_inner()?;

    docker
        .upload_to_container(
            container_id,
            Some(UploadToContainerOptions {
                path: remote.to_string(),
                ..Default::default()
            }),
            bollard::body_full(Bytes::from(archive)),
        )
        .await
        .context("uploading to the container")
}

async fn download_from_container(
    docker: &Docker,
    container_id: &str,
    remote: &str,
    local: &Path,
) -> Result<()> {
    let stream = docker.download_from_container(
        container_id,
        Some(DownloadFromContainerOptions {
            path: remote.to_string(),
        }),
    );

    let bytes = stream
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .context("downloading from the container")?;

    extract_archive(&mut tar::Archive::new(bytes.as_slice()), local)
}

/// Unpack a container-produced tar stream without trusting it: entries that
/// traverse upwards, absolute symlinks, and symlinks escaping the extraction
/// root are skipped with a warning.
pub fn extract_archive<R: Read>(archive: &mut tar::Archive<R>, destination: &Path) -> Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry.context("reading tar entry")?;

        let name = entry.path()?.into_owned();

        if name
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            warn!("skipping potentially unsafe file path: {}", name.display());
            continue;
        }

        let target_path = destination.join(&name);
        let entry_type = entry.header().entry_type();

        match entry_type {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target_path)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = target_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let mut file = std::fs::File::create(&target_path)
                    .with_context(|| format!("creating {}", target_path.display()))?;
                std::io::copy(&mut entry, &mut file)?;
            }
            tar::EntryType::Symlink => {
                let Some(link_target) = entry.link_name()? else {
                    warn!("skipping symlink without a target: {}", name.display());
                    continue;
                };

                if link_target.is_absolute() {
                    warn!(
                        "skipping absolute symlink: {} -> {}",
                        name.display(),
                        link_target.display()
                    );
                    continue;
                }

                let link_parent = target_path.parent().unwrap_or(destination);
                let resolved = clean_path(&link_parent.join(&link_target));

                if !resolved.starts_with(destination) {
                    warn!(
                        "skipping symlink that escapes the extraction directory: {} -> {}",
                        name.display(),
                        link_target.display()
                    );
                    continue;
                }

                if let Some(parent) = target_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                #[cfg(unix)]
                std::os::unix::fs::symlink(&link_target, &target_path)?;
                #[cfg(not(unix))]
                warn!("skipping symlink on this platform: {}", name.display());
            }
            other => {
                warn!("unknown tar entry type {other:?} in {}", name.display());
            }
        }
    }

    Ok(())
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }

    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_with(entries: &[(&str, tar::EntryType, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        for (name, entry_type, link, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(*entry_type);
            header.set_mode(0o644);

            match entry_type {
                tar::EntryType::Symlink => {
                    header.set_size(0);
                    builder
                        .append_link(&mut header, name, link.unwrap())
                        .unwrap();
                }
                _ => {
                    header.set_size(data.len() as u64);
                    header.set_cksum();
                    builder.append_data(&mut header, name, *data).unwrap();
                }
            }
        }

        builder.into_inner().unwrap()
    }

    #[test]
    fn test_parse_targets() {
        assert!(matches!(parse_target("./file"), CopyTarget::Local(_)));
        assert!(matches!(
            parse_target("app:/var/www"),
            CopyTarget::Container { service: None, .. }
        ));
        assert!(matches!(
            parse_target("cache:/data"),
            CopyTarget::Container { service: Some(service), .. } if service == "cache"
        ));
    }

    #[test]
    fn test_regular_files_extract() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = archive_with(&[("hello.txt", tar::EntryType::Regular, None, b"hi")]);

        extract_archive(&mut tar::Archive::new(bytes.as_slice()), dir.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
            "hi"
        );
    }

    #[test]
    fn test_parent_traversal_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = archive_with(&[("../evil.txt", tar::EntryType::Regular, None, b"x")]);

        extract_archive(&mut tar::Archive::new(bytes.as_slice()), dir.path()).unwrap();

        assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_absolute_symlink_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = archive_with(&[("link", tar::EntryType::Symlink, Some("/etc/passwd"), b"")]);

        extract_archive(&mut tar::Archive::new(bytes.as_slice()), dir.path()).unwrap();

        assert!(!dir.path().join("link").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_escaping_relative_symlink_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = archive_with(&[(
            "link",
            tar::EntryType::Symlink,
            Some("sub/../../outside"),
            b"",
        )]);

        extract_archive(&mut tar::Archive::new(bytes.as_slice()), dir.path()).unwrap();

        assert!(std::fs::symlink_metadata(dir.path().join("link")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_inside_symlink_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = archive_with(&[
            ("data.txt", tar::EntryType::Regular, None, b"x"),
            ("link", tar::EntryType::Symlink, Some("data.txt"), b""),
        ]);

        extract_archive(&mut tar::Archive::new(bytes.as_slice()), dir.path()).unwrap();

        assert!(std::fs::symlink_metadata(dir.path().join("link")).is_ok());
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(
            clean_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(clean_path(Path::new("/a/../..")), PathBuf::from("/"));
    }
}
