//! Per-task model resources, built lazily and at most once per process.
//!
//! Each [`TaskKind`] owns one [`OnceCell`] slot. The first request for a
//! kind runs the [`ResourceLoader`]; concurrent requests for the same kind
//! await that construction instead of starting their own. A failed load
//! leaves the slot empty so a later request can try again.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::WorkerError;
use crate::model::LanguageModel;
use crate::task::TaskKind;
use crate::tokenizer::TextTokenizer;

/// Load progress, forwarded to the host as `download` messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LoadProgress {
    Initiate { name: String, file: String },
    Done { name: String, file: String },
    Ready { name: String },
}

/// Where a task's tokenizer and weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    /// HuggingFace repo id, or a local `.gguf` path.
    pub repo: String,
    /// Weight file inside `repo`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Repo holding `tokenizer.json`, when it differs from `repo`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl ModelSource {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            file: None,
            tokenizer_repo: None,
            revision: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_tokenizer_repo(mut self, repo: impl Into<String>) -> Self {
        self.tokenizer_repo = Some(repo.into());
        self
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{file}", self.repo),
            None => f.write_str(&self.repo),
        }
    }
}

/// Parses `repo[:file]`.
impl FromStr for ModelSource {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // A Windows drive prefix (`C:\`) belongs to the path, not the separator.
        let skip = if has_drive_prefix(s) { 2 } else { 0 };
        let (repo, file) = match s[skip..].find(':') {
            Some(at) => (s[..skip + at].trim(), Some(s[skip + at + 1..].trim())),
            None => (s, None),
        };
        if repo.is_empty() || file.is_some_and(str::is_empty) {
            return Err(WorkerError::InvalidConfig {
                field: "source",
                reason: format!("expected repo[:file], got '{s}'"),
            });
        }
        let source = Self::new(repo);
        Ok(match file {
            Some(file) => source.with_file(file),
            None => source,
        })
    }
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'\\' | b'/')
}

/// The tokenizer/model pair serving one task kind.
pub struct ModelResource {
    pub tokenizer: Arc<dyn TextTokenizer>,
    pub model: Arc<dyn LanguageModel>,
    pub source: ModelSource,
}

impl fmt::Debug for ModelResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelResource")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Fetches and builds tokenizers and models.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load_tokenizer(&self, source: &ModelSource) -> Result<Arc<dyn TextTokenizer>>;

    async fn load_model(
        &self,
        task: TaskKind,
        source: &ModelSource,
        progress: &(dyn Fn(LoadProgress) + Send + Sync),
    ) -> Result<Arc<dyn LanguageModel>>;
}

/// Memoizes one [`ModelResource`] per task kind.
///
/// Sources are registered up front, before the cache is shared.
pub struct ResourceCache {
    loader: Arc<dyn ResourceLoader>,
    sources: HashMap<TaskKind, ModelSource>,
    slots: [OnceCell<Arc<ModelResource>>; TaskKind::ALL.len()],
}

impl ResourceCache {
    pub fn new(loader: Arc<dyn ResourceLoader>) -> Self {
        Self {
            loader,
            sources: HashMap::new(),
            slots: std::array::from_fn(|_| OnceCell::new()),
        }
    }

    pub fn with_sources(
        loader: Arc<dyn ResourceLoader>,
        sources: impl IntoIterator<Item = (TaskKind, ModelSource)>,
    ) -> Self {
        let mut cache = Self::new(loader);
        for (task, source) in sources {
            cache.register(task, source);
        }
        cache
    }

    /// Set the source for `task`. Has no effect on an already built slot.
    pub fn register(&mut self, task: TaskKind, source: ModelSource) {
        self.sources.insert(task, source);
    }

    pub fn source(&self, task: TaskKind) -> Option<&ModelSource> {
        self.sources.get(&task)
    }

    pub fn is_loaded(&self, task: TaskKind) -> bool {
        self.slots[task.index()].initialized()
    }

    /// Return the resources for `task`, building them on first use.
    ///
    /// Only the caller that starts construction has `progress` invoked.
    pub async fn get_instance(
        &self,
        task: TaskKind,
        progress: &(dyn Fn(LoadProgress) + Send + Sync),
    ) -> Result<Arc<ModelResource>> {
        let source = self
            .sources
            .get(&task)
            .ok_or(WorkerError::UnregisteredSource(task))?;

        let resource = self.slots[task.index()]
            .get_or_try_init(|| async {
                tracing::info!(%task, %source, "constructing model resources");
                let (tokenizer, model) = tokio::try_join!(
                    self.loader.load_tokenizer(source),
                    self.loader.load_model(task, source, progress),
                )?;
                Ok::<_, anyhow::Error>(Arc::new(ModelResource {
                    tokenizer,
                    model,
                    source: source.clone(),
                }))
            })
            .await
            .map_err(|e| {
                tracing::warn!(%task, error = %e, "model construction failed");
                e
            })?;

        Ok(Arc::clone(resource))
    }
}
