use std::collections::HashMap;
use std::pin::Pin;

use anyhow::{anyhow, bail, Context, Result};
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::query_parameters::ListContainersOptions;
use bollard::Docker;
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tanjun_common::KV_CONTAINER;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const KV_BINARY: &str = "/kv-store";

#[derive(Debug, Serialize)]
struct KvRequest<'a> {
    operation: &'static str,
    key: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct KvResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    error_message: String,
}

type OutputStream = Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>;

/// Client for the per-host `tanjun-kv` container. Requests and responses are
/// newline-delimited JSON over a single attached exec stream, so every call
/// takes `&mut self`: the borrow checker enforces the one-at-a-time use the
/// protocol requires.
pub struct KvClient {
    input: Pin<Box<dyn AsyncWrite + Send>>,
    output: OutputStream,
    buffer: BytesMut,
}

impl KvClient {
    pub async fn connect(docker: &Docker) -> Result<Self> {
        let options = ListContainersOptions {
            filters: Some(HashMap::from([(
                "name".to_string(),
                vec![KV_CONTAINER.to_string()],
            )])),
            ..Default::default()
        };

        let containers = docker
            .list_containers(Some(options))
            .await
            .context("looking for the kv container")?;

        let [container] = containers.as_slice() else {
            bail!(
                "expected 1 kv container, got {} (did you run `tanjun setup`?)",
                containers.len()
            );
        };
        let container_id = container.id.clone().unwrap_or_default();

        let exec = docker
            .create_exec(
                &container_id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec![KV_BINARY.to_string()]),
                    ..Default::default()
                },
            )
            .await
            .context("creating kv exec")?;

        let StartExecResults::Attached { output, input } = docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .context("attaching kv exec")?
        else {
            bail!("kv exec was not attached");
        };

        Ok(Self {
            input,
            output,
            buffer: BytesMut::new(),
        })
    }

    pub async fn get(&mut self, key: &str) -> Result<String> {
        let response = self
            .round_trip(KvRequest {
                operation: "get",
                key,
                value: "",
            })
            .await?;

        Ok(response.value)
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.round_trip(KvRequest {
            operation: "set",
            key,
            value,
        })
        .await
        .map(|_| ())
    }

    pub async fn del(&mut self, key: &str) -> Result<()> {
        self.round_trip(KvRequest {
            operation: "del",
            key,
            value: "",
        })
        .await
        .map(|_| ())
    }

    pub async fn close(mut self) {
        let _ = self.input.shutdown().await;
    }

    async fn round_trip(&mut self, request: KvRequest<'_>) -> Result<KvResponse> {
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        self.input
            .write_all(&line)
            .await
            .context("writing to the kv store")?;
        self.input.flush().await.context("flushing the kv store")?;

        let line = self.read_line().await?;
        let response: KvResponse =
            serde_json::from_str(&line).context("undecodable kv response")?;

        if response.kind != "success" {
            bail!("kv store error: {}", response.error_message);
        }

        Ok(response)
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(line) = take_line(&mut self.buffer) {
                return Ok(line);
            }

            let chunk = self
                .output
                .next()
                .await
                .ok_or_else(|| anyhow!("kv store closed the stream"))??;

            // stderr carries the daemon's own logging, not protocol data
            match chunk {
                LogOutput::StdErr { .. } => {}
                other => self.buffer.extend_from_slice(&other.into_bytes()),
            }
        }
    }
}

fn take_line(buffer: &mut BytesMut) -> Option<String> {
    let newline = buffer.iter().position(|byte| *byte == b'\n')?;
    let line = buffer.split_to(newline + 1);

    Some(String::from_utf8_lossy(&line[..newline]).into_owned())
}
