//! Newline-delimited JSON-RPC over stdin/stdout, for clients that spawn the
//! gateway as a child process.

use crate::runtime::CoreRuntime;
use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

pub async fn run(runtime: Arc<CoreRuntime>) -> Result<()> {
    runtime.sync_backend_tools().await;
    info!("stdio transport ready");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = super::rpc::handle_frame(&runtime, "local:stdio", line.as_bytes()).await;
        let rendered = serde_json::to_string(&response)?;
        stdout.write_all(rendered.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    info!("stdin closed, stdio transport exiting");
    Ok(())
}
