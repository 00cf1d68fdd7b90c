use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::query_parameters::ListContainersOptions;
use bollard::Docker;
use futures::StreamExt;
use tanjun_common::config::ProjectConfig;
use tanjun_common::project::ProjectName;
use tanjun_common::PROXY_CONTAINER;

/// The command vector installing (or replacing) this project's route. The
/// route is keyed by the project slug.
pub fn deploy_command(
    config: &ProjectConfig,
    project: &ProjectName,
    target_ip: &str,
    target_port: u16,
) -> Vec<String> {
    let mut command = vec![
        "kamal-proxy".to_string(),
        "deploy".to_string(),
        "--host".to_string(),
        config.proxy.host.clone(),
        "--forward-headers".to_string(),
        "--health-check-path".to_string(),
        config.proxy.healthcheck.path.clone(),
        "--health-check-interval".to_string(),
        format!("{}s", config.proxy.healthcheck.interval),
        "--health-check-timeout".to_string(),
        format!("{}s", config.proxy.healthcheck.timeout),
        "--target".to_string(),
        format!("{target_ip}:{target_port}"),
        project.to_string(),
        "--target-timeout".to_string(),
        format!("{}s", config.proxy.response_timeout),
    ];

    if config.proxy.ssl {
        command.push("--tls".to_string());
    }

    if config.proxy.buffering.requests {
        command.push("--buffer-requests".to_string());
    }

    if config.proxy.buffering.responses {
        command.push("--buffer-responses".to_string());
    }

    if config.proxy.buffering.max_request_body > 0 {
        command.push("--max-request-body".to_string());
        command.push(config.proxy.buffering.max_request_body.to_string());
    }

    if config.proxy.buffering.max_response_body > 0 {
        command.push("--max-response-body".to_string());
        command.push(config.proxy.buffering.max_response_body.to_string());
    }

    if config.proxy.buffering.memory > 0 {
        command.push("--buffer-memory".to_string());
        command.push(config.proxy.buffering.memory.to_string());
    }

    command
}

pub fn remove_command(project: &ProjectName) -> Vec<String> {
    vec![
        "kamal-proxy".to_string(),
        "remove".to_string(),
        project.to_string(),
    ]
}

/// Exec a kamal-proxy command inside the shared proxy container. The proxy
/// prints nothing on success; a non-empty first line is the failure message.
pub async fn run_proxy_command(docker: &Docker, command: Vec<String>) -> Result<()> {
    let options = ListContainersOptions {
        filters: Some(HashMap::from([(
            "name".to_string(),
            vec![PROXY_CONTAINER.to_string()],
        )])),
        ..Default::default()
    };

    let containers = docker.list_containers(Some(options)).await?;

    let Some(container) = containers.first() else {
        bail!("proxy container not found (did you run `tanjun setup`?)");
    };

    let exec = docker
        .create_exec(
            container.id.as_deref().unwrap_or_default(),
            CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(command),
                ..Default::default()
            },
        )
        .await
        .context("creating proxy exec")?;

    let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None::<StartExecOptions>)
        .await
        .context("running proxy command")?
    else {
        bail!("proxy exec was not attached");
    };

    let mut collected = String::new();

    while let Some(chunk) = output.next().await {
        let bytes = match chunk {
            Ok(LogOutput::StdErr { message }) => message,
            Ok(other) => other.into_bytes(),
            Err(_) => break,
        };

        collected.push_str(&String::from_utf8_lossy(&bytes));

        if collected.contains('\n') {
            break;
        }
    }

    let first_line = collected.lines().next().unwrap_or_default().trim();

    if !first_line.is_empty() {
        bail!("proxy command failed: {first_line}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(extra: &str) -> (ProjectConfig, ProjectName) {
        let config: ProjectConfig = serde_yaml::from_str(&format!(
            r#"
name: hello
image: ghcr.io/u/hello
server:
  address: 192.168.0.10
proxy:
  host: hello.example.com
{extra}
"#
        ))
        .unwrap();
        let project = config.project_name().unwrap();

        (config, project)
    }

    #[test]
    fn test_deploy_command_defaults() {
        let (config, project) = config("");
        let command = deploy_command(&config, &project, "10.0.0.5", 8000);

        assert_eq!(
            command,
            vec![
                "kamal-proxy",
                "deploy",
                "--host",
                "hello.example.com",
                "--forward-headers",
                "--health-check-path",
                "/",
                "--health-check-interval",
                "1s",
                "--health-check-timeout",
                "5s",
                "--target",
                "10.0.0.5:8000",
                "hello",
                "--target-timeout",
                "30s",
            ]
        );
    }

    #[test]
    fn test_deploy_command_tls_and_buffering() {
        let (config, project) = config(
            "  ssl: true\n  buffering:\n    requests: true\n    max_request_body: 1048576\n",
        );
        let command = deploy_command(&config, &project, "10.0.0.5", 80);

        assert!(command.contains(&"--tls".to_string()));
        assert!(command.contains(&"--buffer-requests".to_string()));

        let index = command
            .iter()
            .position(|arg| arg == "--max-request-body")
            .unwrap();
        assert_eq!(command[index + 1], "1048576");
    }

    #[test]
    fn test_remove_command_uses_the_route_key() {
        let (_, project) = config("");
        assert_eq!(remove_command(&project), vec!["kamal-proxy", "remove", "hello"]);
    }
}
