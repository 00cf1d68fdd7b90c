use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::project::ProjectName;

pub const CONFIG_FILE: &str = ".tanjun.yml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {0} does not exist")]
    NotFound(PathBuf),
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid project name {0:?}: must slugify to ^[a-z0-9]([a-z0-9-]{{0,61}}[a-z0-9])?$")]
    InvalidProjectName(String),
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("cronjob {name:?}: invalid schedule {schedule:?}: {source}")]
    InvalidCronSchedule {
        name: String,
        schedule: String,
        source: cron::error::Error,
    },
    #[error("cronjob name {0:?} is used more than once")]
    DuplicateCronjobName(String),
    #[error("worker {0:?} has an empty command")]
    EmptyWorkerCommand(String),
    #[error("env {0:?} must set exactly one of `value` or `expr`")]
    AmbiguousEnv(String),
}

/// The parsed `.tanjun.yml`. Also serialized back into the expression
/// context, so every field the user wrote is reachable as `config.*`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,
    pub image: String,
    #[serde(default = "default_keep_versions")]
    pub keep_versions: usize,
    #[serde(default)]
    pub include: Vec<PathBuf>,
    #[serde(default)]
    pub build: BuildConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,
    #[serde(default)]
    pub buildpack: Option<BuildpackConfig>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub ssh_passthrough: bool,
    #[serde(default)]
    pub secrets: BuildSecrets,
    #[serde(default)]
    pub remote_build: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BuildpackConfig {
    pub name: String,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSecrets {
    #[serde(default)]
    pub from_env: BTreeMap<String, String>,
    #[serde(default)]
    pub from_stored: BTreeMap<String, String>,
    #[serde(default)]
    pub onepassword: OnePasswordConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub address: String,
    #[serde(default = "default_server_username")]
    pub username: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub app_port: Option<u16>,
    #[serde(default)]
    pub healthcheck: ProxyHealthcheck,
    #[serde(default = "default_response_timeout")]
    pub response_timeout: u64,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub buffering: ProxyBuffering,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            app_port: None,
            healthcheck: ProxyHealthcheck::default(),
            response_timeout: default_response_timeout(),
            ssl: false,
            buffering: ProxyBuffering::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyHealthcheck {
    #[serde(default = "default_healthcheck_interval")]
    pub interval: u64,
    #[serde(default = "default_healthcheck_timeout")]
    pub timeout: u64,
    #[serde(default = "default_healthcheck_path")]
    pub path: String,
}

impl Default for ProxyHealthcheck {
    fn default() -> Self {
        Self {
            interval: default_healthcheck_interval(),
            timeout: default_healthcheck_timeout(),
            path: default_healthcheck_path(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyBuffering {
    #[serde(default)]
    pub requests: bool,
    #[serde(default)]
    pub responses: bool,
    #[serde(default)]
    pub max_request_body: u64,
    #[serde(default)]
    pub max_response_body: u64,
    #[serde(default)]
    pub memory: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub initial_secrets: BTreeMap<String, InitialSecret>,
    #[serde(default)]
    pub secrets: RuntimeSecrets,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,
    #[serde(default)]
    pub cronjobs: Vec<CronjobConfig>,
    #[serde(default)]
    pub hooks: HooksConfig,
}

/// `env.KEY.value` is injected verbatim, `env.KEY.expr` is evaluated against
/// the expression context at deploy time.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EnvValue {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub expr: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InitialSecret {
    pub expr: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSecrets {
    #[serde(default)]
    pub from_env: BTreeMap<String, String>,
    #[serde(default)]
    pub from_env_file: Vec<PathBuf>,
    #[serde(default)]
    pub from_stored: BTreeMap<String, String>,
    #[serde(default)]
    pub onepassword: OnePasswordConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OnePasswordConfig {
    #[serde(default)]
    pub items: Vec<OnePasswordItem>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OnePasswordItem {
    pub name: String,
    pub vault: String,
    #[serde(default)]
    pub omit_fields: Vec<String>,
    #[serde(default)]
    pub remap_fields: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    pub name: String,
    pub path: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub command: String,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CronjobConfig {
    pub name: String,
    pub schedule: String,
    pub command: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HooksConfig {
    #[serde(default)]
    pub deploy: Option<String>,
    #[serde(default)]
    pub post_deploy: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl ProjectConfig {
    /// Load `.tanjun.yml` (or another file), merging `include`d files first
    /// and re-applying the main file on top as the override.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let main = read_yaml(path)?;

        let includes = main
            .get("include")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(PathBuf::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut merged = Value::Mapping(Default::default());

        for include in &includes {
            let include_path = base_dir.join(include);
            merge_yaml(&mut merged, read_yaml(&include_path)?);
        }

        merge_yaml(&mut merged, main);

        let config: Self = serde_yaml::from_value(merged).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;

        Ok(config)
    }

    pub fn project_name(&self) -> Result<ProjectName, ConfigError> {
        ProjectName::from_human(&self.name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingField("project name"));
        }

        self.project_name()?;

        if self.image.is_empty() {
            return Err(ConfigError::MissingField("image name"));
        }

        if self.server.address.is_empty() {
            return Err(ConfigError::MissingField("server address"));
        }

        if self.proxy.host.is_empty() {
            return Err(ConfigError::MissingField("proxy host"));
        }

        for (key, env) in &self.app.env {
            if env.value.is_some() == env.expr.is_some() {
                return Err(ConfigError::AmbiguousEnv(key.clone()));
            }
        }

        for (name, worker) in &self.app.workers {
            if worker.command.is_empty() {
                return Err(ConfigError::EmptyWorkerCommand(name.clone()));
            }
        }

        let mut seen = std::collections::BTreeSet::new();

        for cronjob in &self.app.cronjobs {
            if !seen.insert(cronjob.name.as_str()) {
                return Err(ConfigError::DuplicateCronjobName(cronjob.name.clone()));
            }

            parse_standard_cron(&cronjob.schedule).map_err(|source| {
                ConfigError::InvalidCronSchedule {
                    name: cronjob.name.clone(),
                    schedule: cronjob.schedule.clone(),
                    source,
                }
            })?;
        }

        Ok(())
    }
}

/// Parse a standard 5-field cron expression. The `cron` crate wants a seconds
/// field, so one is prepended.
pub fn parse_standard_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    cron::Schedule::from_str(&format!("0 {}", expr.trim()))
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_yaml::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Deep-merge `overlay` into `base`. Mappings merge key-wise, everything else
/// is replaced by the overlay.
fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn default_keep_versions() -> usize {
    5
}

fn default_server_username() -> String {
    "root".to_string()
}

fn default_server_port() -> u16 {
    22
}

fn default_response_timeout() -> u64 {
    30
}

fn default_healthcheck_interval() -> u64 {
    1
}

fn default_healthcheck_timeout() -> u64 {
    5
}

fn default_healthcheck_path() -> String {
    "/".to_string()
}

fn default_replicas() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write_config(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    const MINIMAL: &str = r#"
name: hello
image: ghcr.io/u/hello
server:
  address: 192.168.0.10
proxy:
  host: hello.example.com
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), CONFIG_FILE, MINIMAL);

        let config = ProjectConfig::load(&path).unwrap();

        assert_eq!(config.keep_versions, 5);
        assert_eq!(config.server.username, "root");
        assert_eq!(config.server.port, 22);
        assert_eq!(config.proxy.healthcheck.path, "/");
        assert_eq!(config.proxy.healthcheck.interval, 1);
        assert_eq!(config.proxy.healthcheck.timeout, 5);
        assert_eq!(config.proxy.response_timeout, 30);
        assert_eq!(config.project_name().unwrap().as_str(), "hello");
    }

    #[test]
    fn test_include_merge_main_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "base.yml",
            r#"
keep_versions: 9
app:
  env:
    GREETING:
      value: base
    EXTRA:
      value: kept
"#,
        );
        let path = write_config(
            dir.path(),
            CONFIG_FILE,
            r#"
name: hello
image: ghcr.io/u/hello
include:
  - base.yml
server:
  address: 192.168.0.10
proxy:
  host: hello.example.com
app:
  env:
    GREETING:
      value: hi
"#,
        );

        let config = ProjectConfig::load(&path).unwrap();

        assert_eq!(config.keep_versions, 9);
        assert_eq!(config.app.env["GREETING"].value.as_deref(), Some("hi"));
        assert_eq!(config.app.env["EXTRA"].value.as_deref(), Some("kept"));
    }

    #[test]
    fn test_missing_required_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), CONFIG_FILE, "name: hello\nimage: x\nserver:\n  address: ''\nproxy:\n  host: h\n");

        assert!(matches!(
            ProjectConfig::load(&path),
            Err(ConfigError::MissingField("server address"))
        ));
    }

    #[test]
    fn test_cronjob_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            CONFIG_FILE,
            &format!(
                "{MINIMAL}app:\n  cronjobs:\n    - name: tick\n      schedule: 'not cron'\n      command: date\n"
            ),
        );

        assert!(matches!(
            ProjectConfig::load(&path),
            Err(ConfigError::InvalidCronSchedule { .. })
        ));

        let path = write_config(
            dir.path(),
            "dup.yml",
            &format!(
                "{MINIMAL}app:\n  cronjobs:\n    - name: tick\n      schedule: '* * * * *'\n      command: date\n    - name: tick\n      schedule: '0 0 * * *'\n      command: date\n"
            ),
        );

        assert!(matches!(
            ProjectConfig::load(&path),
            Err(ConfigError::DuplicateCronjobName(name)) if name == "tick"
        ));
    }

    #[test]
    fn test_five_field_cron_is_accepted() {
        assert!(parse_standard_cron("*/5 * * * *").is_ok());
        assert!(parse_standard_cron("0 3 * * 1-5").is_ok());
        assert!(parse_standard_cron("often").is_err());
    }

    #[test]
    fn test_env_requires_exactly_one_of_value_and_expr() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            CONFIG_FILE,
            &format!("{MINIMAL}app:\n  env:\n    BAD: {{}}\n"),
        );

        assert!(matches!(
            ProjectConfig::load(&path),
            Err(ConfigError::AmbiguousEnv(key)) if key == "BAD"
        ));
    }
}
