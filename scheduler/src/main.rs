mod persistence;
mod server;

use std::env;

use anyhow::{bail, Context};
use bollard::Docker;
use clap::{Parser, Subcommand};
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, ContentArrangement, Table,
};
use tanjun_common::scheduler::{SchedulerConfig, SCHEDULER_CONFIG_ENV};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::persistence::Persistence;

const DB_PATH: &str = "database.db";

#[derive(Parser)]
#[command(name = "scheduler", about = "Schedule jobs inside a tanjun project")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon
    Server,
    /// List the configured jobs
    List,
    /// Show past runs of a job
    History { name: String },
    /// Print the captured output of one run
    Logs { id: i64 },
    /// Execute a job right now, without recording it
    Run { name: String },
}

fn load_scheduler_config() -> Result<SchedulerConfig, anyhow::Error> {
    let raw = env::var(SCHEDULER_CONFIG_ENV)
        .with_context(|| format!("no scheduler config found in {SCHEDULER_CONFIG_ENV}"))?;

    serde_json::from_str(&raw).context("cannot parse scheduler config")
}

fn header(columns: &[&str]) -> Table {
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

async fn list(persistence: &Persistence) -> Result<(), anyhow::Error> {
    let mut table = header(&["Name", "Schedule", "Last Execution", "Next Execution", "Exit Code"]);

    for job in persistence.list_jobs().await? {
        table.add_row(vec![
            job.name,
            job.schedule,
            job.last_execution.unwrap_or_else(|| "never".to_string()),
            job.next_execution,
            job.last_exit_code
                .map(|code| code.to_string())
                .unwrap_or_default(),
        ]);
    }

    println!("{table}");

    Ok(())
}

async fn history(persistence: &Persistence, name: &str) -> Result<(), anyhow::Error> {
    let mut table = header(&["ID", "Run At", "Exit Code", "Duration (ms)"]);

    for run in persistence.history(name).await? {
        table.add_row(vec![
            run.id.to_string(),
            run.run_at,
            run.exit_code.to_string(),
            run.execution_time.to_string(),
        ]);
    }

    println!("{table}");

    Ok(())
}

async fn logs(persistence: &Persistence, id: i64) -> Result<(), anyhow::Error> {
    match persistence.run_log(id).await? {
        Some(log) => {
            print!("{log}");
            Ok(())
        }
        None => bail!("no run with id {id}"),
    }
}

async fn run_once(name: &str) -> Result<(), anyhow::Error> {
    let config = load_scheduler_config()?;
    let job = config
        .jobs
        .iter()
        .find(|job| job.name == name)
        .with_context(|| format!("no job named {name:?}"))?;

    let docker = Docker::connect_with_defaults()?;
    let outcome = server::execute_job(&docker, &config.container_id, job).await?;

    print!("{}", outcome.log);

    if outcome.exit_code != 0 {
        bail!("job {name} exited with code {}", outcome.exit_code);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let persistence = Persistence::open(DB_PATH).await?;

    match args.command {
        Command::Server => {
            let docker = Docker::connect_with_defaults()?;
            docker.ping().await?;

            server::serve(docker, persistence, load_scheduler_config()?).await
        }
        Command::List => list(&persistence).await,
        Command::History { name } => history(&persistence, &name).await,
        Command::Logs { id } => logs(&persistence, id).await,
        Command::Run { name } => run_once(&name).await,
    }
}
