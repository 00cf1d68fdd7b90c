use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tanjun_common::config::ProjectConfig;

/// Buildpacks emit a Dockerfile and an ignore list for a language ecosystem.
/// The emitters themselves live outside this crate; this is the seam they
/// plug into.
pub trait DockerfileEmitter: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(&self, config: &ProjectConfig, root: &Path) -> Result<(String, Vec<String>)>;
}

static EMITTERS: &[&(dyn DockerfileEmitter)] = &[];

fn emitter_for(name: &str) -> Result<&'static dyn DockerfileEmitter> {
    EMITTERS
        .iter()
        .copied()
        .find(|emitter| emitter.name() == name)
        .with_context(|| format!("no dockerfile emitter registered for buildpack {name:?}"))
}

/// The Dockerfile text and ignore patterns for this build: generated by a
/// buildpack when one is configured, read from disk otherwise. The project
/// config file itself is never shipped into the build context.
pub fn materialize(config: &ProjectConfig, root: &Path) -> Result<(String, Vec<String>)> {
    let (dockerfile, mut ignore) = match &config.build.buildpack {
        Some(buildpack) => emitter_for(&buildpack.name)?.generate(config, root)?,
        None => {
            let path = root.join(
                config
                    .build
                    .dockerfile
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("Dockerfile")),
            );

            if !path.exists() {
                bail!(
                    "no Dockerfile at {} (set build.dockerfile or configure a buildpack)",
                    path.display()
                );
            }

            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;

            (text, read_dockerignore(root))
        }
    };

    ignore.push(tanjun_common::config::CONFIG_FILE.to_string());

    Ok((dockerfile, ignore))
}

fn read_dockerignore(root: &Path) -> Vec<String> {
    let Ok(raw) = std::fs::read_to_string(root.join(".dockerignore")) else {
        return Vec::new();
    };

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(build: &str) -> ProjectConfig {
        serde_yaml::from_str(&format!(
            r#"
name: hello
image: ghcr.io/u/hello
server:
  address: 192.168.0.10
proxy:
  host: hello.example.com
{build}
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_reads_dockerfile_and_ignore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        std::fs::write(dir.path().join(".dockerignore"), "# cache\nnode_modules\n\n.git\n")
            .unwrap();

        let (dockerfile, ignore) = materialize(&config(""), dir.path()).unwrap();

        assert_eq!(dockerfile, "FROM alpine\n");
        assert_eq!(ignore, vec!["node_modules", ".git", ".tanjun.yml"]);
    }

    #[test]
    fn test_config_file_is_always_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();

        let (_, ignore) = materialize(&config(""), dir.path()).unwrap();

        assert_eq!(ignore, vec![".tanjun.yml"]);
    }

    #[test]
    fn test_missing_dockerfile_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        assert!(materialize(&config(""), dir.path()).is_err());
    }

    #[test]
    fn test_unknown_buildpack_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config("build:\n  buildpack:\n    name: cobol\n");

        let err = materialize(&config, dir.path()).unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }
}
