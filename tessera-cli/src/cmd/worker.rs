//! `tessera worker` -- JSON-lines host channel.
//!
//! Every stdin line is one inbound task message; every stdout line is one
//! outbound message. The process exits once stdin closes and in-flight
//! tasks have posted their last message.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tessera_core::{DispatchSettings, Outbox, ResourceCache, TaskDispatcher, WorkerConfig};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub async fn execute(config: WorkerConfig) -> Result<()> {
    let cache = super::resource_cache(&config)?;
    tracing::info!(tasks = config.sources.len(), "worker ready, reading stdin");
    pump(
        cache,
        DispatchSettings::from(&config),
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Feed `input` lines to a dispatcher and write its messages to `output`.
pub async fn pump<R, W>(
    cache: Arc<ResourceCache>,
    settings: DispatchSettings,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (outbox, mut outgoing) = Outbox::channel();
    let dispatcher = Arc::new(TaskDispatcher::new(cache, outbox, settings));
    let (inbox, incoming) = mpsc::channel(settings.stream_buffer.max(1));

    let read = async move {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(message) => {
                    if inbox.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed input line"),
            }
        }
        tracing::debug!("input closed");
        Ok::<_, anyhow::Error>(())
    };

    let serve = async move {
        dispatcher.serve(incoming).await;
        Ok::<_, anyhow::Error>(())
    };

    let write = async {
        while let Some(message) = outgoing.recv().await {
            let mut line = serde_json::to_vec(&message)?;
            line.push(b'\n');
            output.write_all(&line).await?;
            output.flush().await?;
        }
        Ok::<_, anyhow::Error>(())
    };

    tokio::try_join!(read, serve, write)?;
    Ok(())
}
