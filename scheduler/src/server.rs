use std::time::{Duration, Instant};

use anyhow::Context;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use chrono::Utc;
use cron::Schedule;
use futures::StreamExt;
use tanjun_common::config::parse_standard_cron;
use tanjun_common::scheduler::{SchedulerConfig, SchedulerJob};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::persistence::Persistence;

const ACTIVITY_RETENTION_DAYS: i64 = 7;

pub struct JobOutcome {
    pub exit_code: i64,
    pub log: String,
    pub execution_time_ms: i64,
}

/// Run one job by exec-ing `sh -c {command}` inside the idle app container,
/// capturing interleaved stdout+stderr.
pub async fn execute_job(
    docker: &Docker,
    container_id: &str,
    job: &SchedulerJob,
) -> Result<JobOutcome, anyhow::Error> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    job.command.clone(),
                ]),
                ..Default::default()
            },
        )
        .await
        .context("creating exec")?;

    let started = Instant::now();
    let mut log = String::new();

    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None)
        .await
        .context("attaching to exec")?
    {
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(chunk) => {
                    let text = String::from_utf8_lossy(&chunk.into_bytes()).into_owned();
                    for line in text.lines() {
                        info!("job {}: {}", job.name, line);
                    }
                    log.push_str(&text);
                }
                Err(err) => {
                    warn!("job {}: output stream ended: {err}", job.name);
                    break;
                }
            }
        }
    }

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .context("inspecting exec")?;

    Ok(JobOutcome {
        exit_code: inspect.exit_code.unwrap_or(-1),
        log,
        execution_time_ms: started.elapsed().as_millis() as i64,
    })
}

async fn run_job_loop(
    docker: Docker,
    persistence: Persistence,
    container_id: String,
    job: SchedulerJob,
    schedule: Schedule,
) {
    loop {
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            warn!("job {} has no future run times, stopping it", job.name);
            return;
        };

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        let run_at = Utc::now();

        match execute_job(&docker, &container_id, &job).await {
            Ok(outcome) => {
                if outcome.exit_code != 0 {
                    error!("job {} exited with code {}", job.name, outcome.exit_code);
                }

                let next = schedule.after(&Utc::now()).next();
                if let Err(err) = persistence
                    .record_run(
                        &job.name,
                        run_at,
                        next,
                        outcome.exit_code,
                        outcome.execution_time_ms,
                        &outcome.log,
                    )
                    .await
                {
                    error!("could not record run of {}: {err}", job.name);
                }
            }
            Err(err) => error!("job {} failed to execute: {err}", job.name),
        }
    }
}

async fn run_retention_loop(persistence: Persistence) {
    loop {
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;

        let cutoff = Utc::now() - chrono::Duration::days(ACTIVITY_RETENTION_DAYS);
        match persistence.purge_activity_before(cutoff).await {
            Ok(0) => {}
            Ok(deleted) => info!("purged {deleted} old activity rows"),
            Err(err) => error!("could not purge old activity: {err}"),
        }
    }
}

/// The `server` subcommand: rebuild the jobs table from the config, then run
/// every job on its schedule until terminated.
pub async fn serve(
    docker: Docker,
    persistence: Persistence,
    config: SchedulerConfig,
) -> Result<(), anyhow::Error> {
    persistence.reset_jobs().await?;

    let mut set = JoinSet::new();

    for job in config.jobs {
        let schedule = parse_standard_cron(&job.schedule)
            .with_context(|| format!("job {} has an invalid schedule", job.name))?;

        let next = schedule
            .after(&Utc::now())
            .next()
            .with_context(|| format!("job {} never runs", job.name))?;
        persistence.insert_job(&job.name, &job.schedule, next).await?;
        info!("added job: {}", job.name);

        set.spawn(run_job_loop(
            docker.clone(),
            persistence.clone(),
            config.container_id.clone(),
            job,
            schedule,
        ));
    }

    set.spawn(run_retention_loop(persistence));

    tokio::signal::ctrl_c().await?;
    info!("stopping scheduler");

    set.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_five_field_schedules_produce_next_times() {
        let schedule = parse_standard_cron("*/5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 10, 2, 30).unwrap();

        let next = schedule.after(&now).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 1, 10, 5, 0).unwrap());
    }
}
