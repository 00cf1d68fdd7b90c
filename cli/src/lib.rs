pub mod args;
mod build;
mod copy;
mod docker;
mod forward;
mod init;
mod onepassword;
mod server;
mod shell;

use anyhow::{bail, Context, Result};
use bollard::container::LogOutput;
use bollard::query_parameters::LogsOptions;
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, ContentArrangement, Table,
};
use futures::StreamExt;
use tanjun_common::config::ProjectConfig;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::args::{
    Args, Command, CronjobCommand, DeployArgs, SecretCommand, ServiceCommand, VersionCommand,
};
use crate::docker::kv::KvClient;

pub async fn run(args: Args) -> Result<()> {
    if let Command::Init = args.cmd {
        return init::init(&std::env::current_dir()?);
    }

    let config = ProjectConfig::load(&args.config)?;
    let docker = docker::connect(&config.server)?;

    match args.cmd {
        Command::Init => unreachable!("handled above"),
        Command::Setup => server::setup(&docker).await,
        Command::Deploy(deploy_args) => deploy(&docker, &config, deploy_args).await,
        Command::Destroy => {
            docker::destroy::destroy_project(&docker, &config.project_name()?).await
        }
        Command::Logs { service, follow } => {
            logs(&docker, &config, service.as_deref(), follow).await
        }
        Command::Shell { service, command } => {
            let project = config.project_name()?;
            let container =
                docker::locator::find_project_container(&docker, &project, service.as_deref())
                    .await?;
            shell::shell(&docker, &container, &command).await
        }
        Command::Cp {
            source,
            destination,
        } => copy::copy(&docker, &config.project_name()?, &source, &destination).await,
        Command::Forward {
            service,
            port,
            local_port,
        } => forward::forward(&docker, &config, &service, port, local_port).await,
        Command::Secret(command) => secret(&docker, &config, command).await,
        Command::Service(command) => service(&docker, &config, command).await,
        Command::Version(command) => version(&docker, &config, command).await,
        Command::Cronjob(command) => {
            let args = match command {
                CronjobCommand::List => vec!["list".to_string()],
                CronjobCommand::History { name } => vec!["history".to_string(), name],
                CronjobCommand::Logs { id } => vec!["logs".to_string(), id.to_string()],
                CronjobCommand::Run { name } => vec!["run".to_string(), name],
            };

            docker::cronjob::run_scheduler_command(&docker, &config.project_name()?, args).await
        }
    }
}

async fn deploy(docker: &bollard::Docker, config: &ProjectConfig, args: DeployArgs) -> Result<()> {
    let project = config.project_name()?;

    let version = if args.rollback {
        let active = docker::version::currently_active(docker, &project).await?;
        info!("Current version is {active}");

        let versions = docker::version::list(docker, &config.image).await?;
        let target = docker::version::rollback_target(&versions, &active)
            .context("no version to rollback to")?
            .to_string();

        info!("Rolling back to version {target}");
        target
    } else if let Some(version) = args.version {
        if version == "current" {
            docker::version::currently_active(docker, &project).await?
        } else {
            version
        }
    } else {
        let root = std::env::current_dir()?;
        let version = build::build_image(config, &root).await?;
        info!("Built version {version}");
        version
    };

    docker::deploy::deploy(docker, config, &version).await?;

    let services = docker::service::project_list_services(docker, config, &project).await?;
    if services.values().any(|service| service.dangling) {
        warn!(
            "There are dangling services, run `tanjun service list` to see them and `tanjun service rm <name>` to remove them"
        );
    }

    Ok(())
}

async fn logs(
    docker: &bollard::Docker,
    config: &ProjectConfig,
    service: Option<&str>,
    follow: bool,
) -> Result<()> {
    let project = config.project_name()?;
    let container = docker::locator::find_project_container(docker, &project, service).await?;

    let mut stream = docker.logs(
        &container,
        Some(LogsOptions {
            stdout: true,
            stderr: true,
            follow,
            ..Default::default()
        }),
    );

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    while let Some(chunk) = stream.next().await {
        match chunk? {
            LogOutput::StdErr { message } => {
                stderr.write_all(&message).await?;
                stderr.flush().await?;
            }
            other => {
                stdout.write_all(&other.into_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }

    Ok(())
}

fn table(columns: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            columns
                .iter()
                .map(|column| Cell::new(column).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        );
    table
}

async fn secret(
    docker: &bollard::Docker,
    config: &ProjectConfig,
    command: SecretCommand,
) -> Result<()> {
    let project = config.project_name()?;
    let mut kv = KvClient::connect(docker).await?;

    let result = async {
        match command {
            SecretCommand::Set { pairs } => {
                let mut secrets = docker::secrets::list_project_secrets(&mut kv, &project).await?;

                for pair in pairs {
                    let Some((key, value)) = pair.split_once('=') else {
                        bail!("secrets are set as KEY=VALUE, got {pair:?}");
                    };

                    secrets.insert(key.to_string(), value.to_string());
                }

                docker::secrets::set_project_secrets(&mut kv, &project, &secrets).await?;
                info!("Stored secrets, they apply with the next deploy");
            }
            SecretCommand::Del { key } => {
                let mut secrets = docker::secrets::list_project_secrets(&mut kv, &project).await?;

                if secrets.remove(&key).is_none() {
                    warn!("secret {key} was not set");
                }

                docker::secrets::set_project_secrets(&mut kv, &project, &secrets).await?;
            }
            SecretCommand::List => {
                let secrets = docker::secrets::list_project_secrets(&mut kv, &project).await?;

                let mut output = table(&["Key", "Value"]);
                let mut keys: Vec<_> = secrets.keys().collect();
                keys.sort();

                for key in keys {
                    output.add_row(vec![key.clone(), secrets[key].clone()]);
                }

                println!("{output}");
            }
        }

        Ok(())
    }
    .await;

    kv.close().await;

    result
}

async fn service(
    docker: &bollard::Docker,
    config: &ProjectConfig,
    command: ServiceCommand,
) -> Result<()> {
    let project = config.project_name()?;

    match command {
        ServiceCommand::List => {
            let services = docker::service::project_list_services(docker, config, &project).await?;

            let mut output = table(&["Name", "Status", "Dangling"]);

            for (name, status) in services {
                output.add_row(vec![
                    name,
                    status.status,
                    if status.dangling { "yes" } else { "" }.to_string(),
                ]);
            }

            println!("{output}");

            Ok(())
        }
        ServiceCommand::Rm { name, force } => {
            if config.services.contains_key(&name) && !force {
                bail!("service {name} is still configured, pass --force to remove it anyway");
            }

            docker::service::project_delete_service(docker, &project, &name).await
        }
    }
}

async fn version(
    docker: &bollard::Docker,
    config: &ProjectConfig,
    command: VersionCommand,
) -> Result<()> {
    let project = config.project_name()?;

    match command {
        VersionCommand::List => {
            let versions = docker::version::list(docker, &config.image).await?;
            let active = docker::version::currently_active(docker, &project)
                .await
                .unwrap_or_default();

            let mut output = table(&["Name", "Aliases", "Created At", "Active"]);

            for version in versions {
                let is_active = version.name == active
                    || version.aliases.iter().any(|alias| alias == &active);

                output.add_row(vec![
                    version.name,
                    version.aliases.join(", "),
                    version.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    if is_active { "yes" } else { "" }.to_string(),
                ]);
            }

            println!("{output}");

            Ok(())
        }
        VersionCommand::Prune => {
            let active = docker::version::currently_active(docker, &project)
                .await
                .ok();

            docker::version::prune(
                docker,
                &config.image,
                config.keep_versions,
                active.as_deref(),
            )
            .await
        }
    }
}
