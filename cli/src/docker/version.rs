use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use bollard::query_parameters::{ListImagesOptions, RemoveImageOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use tanjun_common::project::ProjectName;

use super::helper::list_labeled_containers;

/// One image tag produced by a build. The first tag names the version, any
/// further tags on the same digest are aliases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Version {
    pub name: String,
    pub aliases: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Versions of the project's image, newest first.
pub async fn list(docker: &Docker, image: &str) -> Result<Vec<Version>> {
    let options = ListImagesOptions {
        all: true,
        filters: Some(HashMap::from([(
            "reference".to_string(),
            vec![image.to_string()],
        )])),
        ..Default::default()
    };

    let images = docker
        .list_images(Some(options))
        .await
        .context("listing image versions")?;

    let mut versions: Vec<Version> = images
        .into_iter()
        .filter(|summary| !summary.repo_tags.is_empty())
        .map(|summary| {
            let mut tags = summary
                .repo_tags
                .iter()
                .map(|tag| tag.trim_start_matches(&format!("{image}:")).to_string());

            Version {
                name: tags.next().unwrap_or_default(),
                aliases: tags.collect(),
                created_at: DateTime::from_timestamp(summary.created, 0).unwrap_or_default(),
            }
        })
        .collect();

    sort_versions(&mut versions);

    Ok(versions)
}

fn sort_versions(versions: &mut [Version]) {
    versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Which versions fall out of the retention window. The active version is
/// never selected, no matter how old it is.
pub fn prune_candidates<'a>(
    versions: &'a [Version],
    keep: usize,
    active: Option<&str>,
) -> Vec<&'a Version> {
    if versions.len() <= keep {
        return Vec::new();
    }

    versions[keep..]
        .iter()
        .filter(|version| {
            let Some(active) = active else { return true };

            version.name != active && !version.aliases.iter().any(|alias| alias == active)
        })
        .collect()
}

/// Delete all versions beyond the `keep` most recent ones.
pub async fn prune(docker: &Docker, image: &str, keep: usize, active: Option<&str>) -> Result<()> {
    let versions = list(docker, image).await?;

    for version in prune_candidates(&versions, keep, active) {
        for tag in version.aliases.iter().chain(std::iter::once(&version.name)) {
            docker
                .remove_image(
                    &format!("{image}:{tag}"),
                    Some(RemoveImageOptions {
                        ..Default::default()
                    }),
                    None,
                )
                .await
                .with_context(|| format!("removing image {image}:{tag}"))?;
        }
    }

    Ok(())
}

/// The tag the current app container runs, read from its image reference.
pub async fn currently_active(docker: &Docker, project: &ProjectName) -> Result<String> {
    let containers = list_labeled_containers(docker, project, &["tanjun.app=true"], false).await?;

    let Some(container) = containers.first() else {
        bail!("there is no deployment yet for project {project}");
    };

    let image = container.image.clone().unwrap_or_default();

    match image.split_once(':') {
        Some((_, tag)) => Ok(tag.to_string()),
        None => bail!("app container image {image:?} carries no tag"),
    }
}

/// The version a `--rollback` deploy selects: the first one older than the
/// currently active version.
pub fn rollback_target<'a>(versions: &'a [Version], active: &str) -> Option<&'a str> {
    let mut found_active = false;

    for version in versions {
        let is_active =
            version.name == active || version.aliases.iter().any(|alias| alias == active);

        if is_active {
            found_active = true;
            continue;
        }

        if found_active {
            return Some(&version.name);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn version(name: &str, created_at: i64) -> Version {
        Version {
            name: name.to_string(),
            aliases: Vec::new(),
            created_at: DateTime::from_timestamp(created_at, 0).unwrap(),
        }
    }

    fn versions() -> Vec<Version> {
        // intentionally unsorted
        let mut versions = vec![
            version("a", 100),
            version("c", 300),
            version("b", 200),
            version("d", 400),
        ];
        sort_versions(&mut versions);
        versions
    }

    #[test]
    fn test_ordering_is_newest_first() {
        let versions = versions();
        let names: Vec<&str> = versions.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["d", "c", "b", "a"]);
    }

    #[test]
    fn test_prune_keeps_the_newest_n() {
        let versions = versions();
        let candidates = prune_candidates(&versions, 2, None);

        let names: Vec<&str> = candidates.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_prune_never_selects_the_active_version() {
        let versions = versions();
        let candidates = prune_candidates(&versions, 1, Some("b"));

        let names: Vec<&str> = candidates.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a"]);
    }

    #[test]
    fn test_prune_within_retention_is_a_noop() {
        let versions = versions();
        assert!(prune_candidates(&versions, 4, None).is_empty());
        assert!(prune_candidates(&versions, 9, None).is_empty());
    }

    #[test]
    fn test_rollback_selects_the_next_older_version() {
        let versions = versions();

        assert_eq!(rollback_target(&versions, "d"), Some("c"));
        assert_eq!(rollback_target(&versions, "c"), Some("b"));
        assert_eq!(rollback_target(&versions, "a"), None);
        assert_eq!(rollback_target(&versions, "unknown"), None);
    }

    #[test]
    fn test_rollback_honors_aliases() {
        let mut versions = versions();
        versions[0].aliases.push("latest".to_string());

        assert_eq!(rollback_target(&versions, "latest"), Some("c"));
    }
}
