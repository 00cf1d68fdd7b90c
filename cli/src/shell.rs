use anyhow::{bail, Context, Result};
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use crossterm::terminal;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

/// Exec into a container. With a command this behaves like `sh -c`, without
/// one it opens an interactive `sh` with the local terminal in raw mode and
/// window resizes forwarded.
pub async fn shell(docker: &Docker, container_id: &str, command: &[String]) -> Result<()> {
    let interactive = command.is_empty() && crossterm::tty::IsTty::is_tty(&std::io::stdin());

    let cmd = if command.is_empty() {
        vec!["sh".to_string()]
    } else {
        vec!["sh".to_string(), "-c".to_string(), command.join(" ")]
    };

    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(interactive),
                cmd: Some(cmd),
                ..Default::default()
            },
        )
        .await
        .context("creating exec")?;

    let StartExecResults::Attached { mut output, mut input } = docker
        .start_exec(
            &exec.id,
            Some(StartExecOptions {
                tty: interactive,
                ..Default::default()
            }),
        )
        .await
        .context("attaching to exec")?
    else {
        bail!("exec was not attached");
    };

    if interactive {
        terminal::enable_raw_mode().context("entering raw mode")?;
        resize_to_terminal(docker, &exec.id).await;

        #[cfg(unix)]
        let mut winch = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
            .context("installing the resize handler")?;

        // local stdin feeds the exec until it closes
        let stdin_task = tokio::spawn({
            let docker = docker.clone();
            let exec_id = exec.id.clone();
            async move {
                let mut stdin = tokio::io::stdin();
                let mut buffer = [0u8; 1024];

                loop {
                    #[cfg(unix)]
                    let read = tokio::select! {
                        read = stdin.read(&mut buffer) => read,
                        _ = winch.recv() => {
                            resize_to_terminal(&docker, &exec_id).await;
                            continue;
                        }
                    };
                    #[cfg(not(unix))]
                    let read = stdin.read(&mut buffer).await;

                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if input.write_all(&buffer[..n]).await.is_err() {
                                break;
                            }
                            let _ = input.flush().await;
                        }
                    }
                }
            }
        });

        let stream_result = stream_output(&mut output).await;

        terminal::disable_raw_mode().context("leaving raw mode")?;
        stdin_task.abort();
        stream_result?;
    } else {
        stream_output(&mut output).await?;
    }

    let inspect = docker.inspect_exec(&exec.id).await?;

    match inspect.exit_code {
        Some(0) | None => Ok(()),
        Some(code) => bail!("exit code {code}"),
    }
}

async fn stream_output(
    output: &mut (impl StreamExt<Item = Result<LogOutput, bollard::errors::Error>> + Unpin),
) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    while let Some(chunk) = output.next().await {
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

async fn resize_to_terminal(docker: &Docker, exec_id: &str) {
    let Ok((width, height)) = terminal::size() else {
        return;
    };

    if let Err(err) = docker
        .resize_exec(
            exec_id,
            bollard::query_parameters::ResizeExecOptions {
                h: height as i32,
                w: width as i32,
            },
        )
        .await
    {
        warn!("could not resize the remote terminal: {err}");
    }
}
