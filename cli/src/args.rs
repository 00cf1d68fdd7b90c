use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tanjun", version, about = "Deploy containerized projects to your own server")]
pub struct Args {
    /// Path to the project configuration
    #[arg(global = true, long, default_value = tanjun_common::config::CONFIG_FILE)]
    pub config: PathBuf,
    /// Log debug output as well
    #[arg(global = true, long, short)]
    pub verbose: bool,
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a .tanjun.yml for this project
    Init,
    /// Prepare the server: shared network, proxy and key-value store
    Setup,
    /// Build an image and roll it out behind the proxy
    Deploy(DeployArgs),
    /// Remove every object belonging to this project from the server
    Destroy,
    /// Stream logs of the app or a service container
    Logs {
        /// Tail a service container instead of the app
        #[arg(long)]
        service: Option<String>,
        /// Follow log output
        #[arg(long, short)]
        follow: bool,
    },
    /// Open a shell (or run a command) inside the app or a service container
    Shell {
        /// Target a service container instead of the app
        #[arg(long)]
        service: Option<String>,
        /// Command to run instead of an interactive shell
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Copy files between the local machine and a container (`app:/path` addresses the app)
    Cp {
        source: String,
        destination: String,
    },
    /// Forward a service port to localhost through an mTLS tunnel
    Forward {
        service: String,
        port: u16,
        /// Local port to listen on (random when omitted)
        #[arg(long)]
        local_port: Option<u16>,
    },
    /// Manage the project's stored secrets
    #[command(subcommand)]
    Secret(SecretCommand),
    /// Inspect or remove the project's sidecar services
    #[command(subcommand)]
    Service(ServiceCommand),
    /// Inspect or prune the project's image versions
    #[command(subcommand)]
    Version(VersionCommand),
    /// Talk to the cronjob scheduler running next to the app
    #[command(subcommand)]
    Cronjob(CronjobCommand),
}

#[derive(Parser)]
pub struct DeployArgs {
    /// Deploy this version instead of building a new one
    #[arg(long)]
    pub version: Option<String>,
    /// Deploy the version preceding the currently active one
    #[arg(long)]
    pub rollback: bool,
}

#[derive(Subcommand)]
pub enum SecretCommand {
    /// Store one or more KEY=VALUE pairs
    Set {
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Delete a stored secret
    Del { key: String },
    /// List the stored secrets
    List,
}

#[derive(Subcommand)]
pub enum ServiceCommand {
    /// Show the configured and deployed services
    List,
    /// Remove a service container and its volumes
    Rm {
        name: String,
        /// Also remove services that are still in the configuration
        #[arg(long, short)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum VersionCommand {
    /// List the image versions on the server
    List,
    /// Delete versions beyond keep_versions
    Prune,
}

#[derive(Subcommand)]
pub enum CronjobCommand {
    /// List the scheduled jobs
    List,
    /// Show past runs of a job
    History { name: String },
    /// Print the captured output of one run
    Logs { id: i64 },
    /// Execute a job right now
    Run { name: String },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args_parse() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_deploy_flags() {
        let args = Args::parse_from(["tanjun", "deploy", "--rollback"]);
        match args.cmd {
            Command::Deploy(deploy) => {
                assert!(deploy.rollback);
                assert!(deploy.version.is_none());
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn test_shell_trailing_command() {
        let args = Args::parse_from(["tanjun", "shell", "--service", "cache", "redis-cli", "info"]);
        match args.cmd {
            Command::Shell { service, command } => {
                assert_eq!(service.as_deref(), Some("cache"));
                assert_eq!(command, vec!["redis-cli", "info"]);
            }
            _ => panic!("expected shell"),
        }
    }
}
