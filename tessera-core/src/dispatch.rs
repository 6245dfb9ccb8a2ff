//! Routes host messages to task pipelines and posts results back.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::WorkerConfig;
use crate::pipelines::Pipeline;
use crate::resources::{LoadProgress, ResourceCache};
use crate::task::{TaskKind, TaskOutput, TaskRequest};

/// A message posted to the host. Never acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Download {
        task: TaskKind,
        data: LoadProgress,
    },
    Update {
        target: Option<String>,
        data: String,
    },
    Result {
        task: TaskKind,
        target: Option<String>,
        #[serde(rename = "targetType", skip_serializing_if = "Option::is_none")]
        target_type: Option<String>,
        data: TaskOutput,
    },
    Error {
        task: TaskKind,
        target: Option<String>,
        data: String,
    },
}

/// Sending half of the host channel.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Fire and forget. A host that went away is not an error.
    pub fn post(&self, message: OutboundMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("host channel closed, dropping message");
        }
    }
}

/// Dispatcher knobs taken from [`WorkerConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub stream_buffer: usize,
    pub default_max_new_tokens: usize,
    pub report_failures: bool,
}

impl From<&WorkerConfig> for DispatchSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            stream_buffer: config.stream_buffer,
            default_max_new_tokens: config.default_max_new_tokens,
            report_failures: config.report_failures,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

pub struct TaskDispatcher {
    cache: Arc<ResourceCache>,
    outbox: Outbox,
    settings: DispatchSettings,
}

impl TaskDispatcher {
    pub fn new(cache: Arc<ResourceCache>, outbox: Outbox, settings: DispatchSettings) -> Self {
        Self {
            cache,
            outbox,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Handle one raw host message. Messages naming no known task are
    /// dropped without a reply.
    pub async fn dispatch(&self, message: Value) {
        let Some(task) = message
            .get("task")
            .and_then(Value::as_str)
            .and_then(|name| name.parse::<TaskKind>().ok())
        else {
            tracing::debug!(task = ?message.get("task"), "ignoring message without a known task");
            return;
        };

        let target = message
            .get("elementIdToUpdate")
            .and_then(Value::as_str)
            .map(str::to_string);
        match serde_json::from_value::<TaskRequest>(message) {
            Ok(request) => self.handle(request).await,
            Err(e) => self.fail(task, target, anyhow::Error::new(e).context("malformed request")),
        }
    }

    /// Run a parsed request and post its terminal message.
    pub async fn handle(&self, mut request: TaskRequest) {
        let task = request.task;
        let target = request.element_id_to_update.clone();
        request
            .generation
            .max_new_tokens
            .get_or_insert(self.settings.default_max_new_tokens);

        tracing::info!(%task, target = ?target, "task started");
        match self.run(&request).await {
            Ok(data) => {
                tracing::info!(%task, "task finished");
                self.outbox.post(OutboundMessage::Result {
                    task,
                    target,
                    target_type: request.target_type,
                    data,
                });
            }
            Err(e) => self.fail(task, target, e),
        }
    }

    async fn run(&self, request: &TaskRequest) -> Result<TaskOutput> {
        let task = request.task;
        let outbox = self.outbox.clone();
        let progress = move |data: LoadProgress| {
            outbox.post(OutboundMessage::Download { task, data });
        };
        let resource = self.cache.get_instance(task, &progress).await?;

        Pipeline::new(
            &resource,
            &self.outbox,
            request.element_id_to_update.as_deref(),
            self.settings.stream_buffer,
        )
        .run(request)
        .await
    }

    fn fail(&self, task: TaskKind, target: Option<String>, error: anyhow::Error) {
        tracing::warn!(%task, error = %format!("{error:#}"), "task failed");
        if self.settings.report_failures {
            self.outbox.post(OutboundMessage::Error {
                task,
                target,
                data: format!("{error:#}"),
            });
        }
    }

    /// Consume `inbox` until it closes, running every message as its own
    /// task, then wait for the in-flight ones.
    pub async fn serve(self: Arc<Self>, mut inbox: mpsc::Receiver<Value>) {
        let mut running = JoinSet::new();
        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => {
                        let dispatcher = Arc::clone(&self);
                        running.spawn(async move { dispatcher.dispatch(message).await });
                    }
                    None => break,
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "task panicked");
                    }
                }
            }
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "task panicked");
            }
        }
        tracing::debug!("inbox closed, dispatcher stopped");
    }
}
