mod store;

use std::io::Write;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::store::Store;

const DB_PATH: &str = "kv.db";

#[derive(Debug, Deserialize)]
struct Request {
    operation: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Serialize)]
struct Response {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    value: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    error_message: String,
}

impl Response {
    fn success(value: String) -> Self {
        Self {
            kind: "success",
            value,
            error_message: String::new(),
        }
    }

    fn error(message: impl ToString) -> Self {
        Self {
            kind: "error",
            value: String::new(),
            error_message: message.to_string(),
        }
    }
}

async fn handle(store: &Store, request: Request) -> Response {
    let result = match request.operation.as_str() {
        "get" => store.get(&request.key).await.map(Response::success),
        "set" => store
            .set(&request.key, &request.value)
            .await
            .map(|()| Response::success(String::new())),
        "del" => store
            .del(&request.key)
            .await
            .map(|()| Response::success(String::new())),
        other => return Response::error(format!("unknown operation {other:?}")),
    };

    result.unwrap_or_else(Response::error)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    // stdout carries the protocol, so logging goes to stderr.
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let store = Store::open(DB_PATH).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle(&store, request).await,
            Err(err) => Response::error(err),
        };

        serde_json::to_writer(&mut stdout, &response)?;
        // one response per line, flushed immediately: the exec stream is a pipe
        writeln!(stdout)?;
        stdout.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_cycle() {
        let store = Store::open(":memory:").await.unwrap();

        let set: Request =
            serde_json::from_str(r#"{"operation":"set","key":"a","value":"1"}"#).unwrap();
        let response = handle(&store, set).await;
        assert_eq!(response.kind, "success");

        let get: Request = serde_json::from_str(r#"{"operation":"get","key":"a"}"#).unwrap();
        let response = handle(&store, get).await;
        assert_eq!(response.value, "1");

        let unknown: Request = serde_json::from_str(r#"{"operation":"flush","key":"a"}"#).unwrap();
        let response = handle(&store, unknown).await;
        assert_eq!(response.kind, "error");
    }

    #[test]
    fn test_empty_fields_are_omitted_on_the_wire() {
        let encoded = serde_json::to_string(&Response::success(String::new())).unwrap();
        assert_eq!(encoded, r#"{"type":"success"}"#);

        let encoded = serde_json::to_string(&Response::error("boom")).unwrap();
        assert_eq!(encoded, r#"{"type":"error","error_message":"boom"}"#);
    }
}
