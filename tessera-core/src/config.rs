//! Worker settings, loaded from JSON.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::generation::DEFAULT_MAX_NEW_TOKENS;
use crate::resources::ModelSource;
use crate::task::TaskKind;

const DEFAULT_CHAT_REPO: &str = "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF";
const DEFAULT_CHAT_FILE: &str = "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf";
const DEFAULT_CHAT_TOKENIZER: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
const DEFAULT_FILL_MASK_REPO: &str = "google-bert/bert-base-cased";
const DEFAULT_SENTIMENT_REPO: &str = "nlptown/bert-base-multilingual-uncased-sentiment";
const DEFAULT_SENTIMENT_TOKENIZER: &str = "Xenova/bert-base-multilingual-uncased-sentiment";
const DEFAULT_QA_REPO: &str = "distilbert/distilbert-base-uncased-distilled-squad";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Model source per task. Generative tasks take GGUF sources, the others
    /// BERT-family encoder checkpoints. Tasks without an entry are rejected.
    pub sources: BTreeMap<TaskKind, ModelSource>,
    /// Capacity of the per-request step update channel.
    pub stream_buffer: usize,
    /// Step budget for requests that do not set `maxNewTokens`.
    pub default_max_new_tokens: usize,
    /// Post an `error` message when a request fails instead of staying silent.
    pub report_failures: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let chat = ModelSource::new(DEFAULT_CHAT_REPO)
            .with_file(DEFAULT_CHAT_FILE)
            .with_tokenizer_repo(DEFAULT_CHAT_TOKENIZER);
        let mut sources: BTreeMap<TaskKind, ModelSource> = TaskKind::ALL
            .into_iter()
            .filter(|task| task.is_generative())
            .map(|task| (task, chat.clone()))
            .collect();
        sources.insert(
            TaskKind::MaskedLanguageModelling,
            ModelSource::new(DEFAULT_FILL_MASK_REPO),
        );
        sources.insert(
            TaskKind::SequenceClassification,
            ModelSource::new(DEFAULT_SENTIMENT_REPO).with_tokenizer_repo(DEFAULT_SENTIMENT_TOKENIZER),
        );
        sources.insert(TaskKind::QuestionAnswering, ModelSource::new(DEFAULT_QA_REPO));
        Self {
            sources,
            stream_buffer: 16,
            default_max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            report_failures: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_buffer == 0 {
            anyhow::bail!("stream_buffer must be at least 1");
        }
        if self.default_max_new_tokens == 0 {
            anyhow::bail!("default_max_new_tokens must be at least 1");
        }
        Ok(())
    }

    /// Apply a `task=repo[:file]` override.
    pub fn apply_override(&mut self, entry: &str) -> Result<()> {
        let (task, source) = entry
            .split_once('=')
            .with_context(|| format!("expected task=repo[:file], got '{entry}'"))?;
        let task: TaskKind = task.trim().parse()?;
        let source: ModelSource = source.parse()?;
        self.sources.insert(task, source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_task() {
        let config = WorkerConfig::default();
        for task in TaskKind::ALL {
            let source = &config.sources[&task];
            // GGUF repos need an explicit file; encoder repos find their weights.
            assert_eq!(source.file.is_some(), task.is_generative());
        }
        assert_eq!(
            config.sources[&TaskKind::SequenceClassification]
                .tokenizer_repo
                .as_deref(),
            Some(DEFAULT_SENTIMENT_TOKENIZER)
        );
        assert_eq!(config.stream_buffer, 16);
        assert!(!config.report_failures);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{
                "report_failures": true,
                "sources": {
                    "question-answering": { "repo": "org/qa", "tokenizer_repo": "org/qa-tok" }
                }
            }"#,
        )
        .unwrap();
        assert!(config.report_failures);
        assert_eq!(config.default_max_new_tokens, DEFAULT_MAX_NEW_TOKENS);
        assert_eq!(config.sources.len(), 1);
        let qa = &config.sources[&TaskKind::QuestionAnswering];
        assert_eq!(qa.tokenizer_repo.as_deref(), Some("org/qa-tok"));
    }

    #[test]
    fn overrides_replace_one_task() {
        let mut config = WorkerConfig::default();
        config
            .apply_override("summarization=./models/sum.gguf")
            .unwrap();
        assert_eq!(
            config.sources[&TaskKind::Summarization].repo,
            "./models/sum.gguf"
        );
        assert_eq!(
            config.sources[&TaskKind::Translation].repo,
            DEFAULT_CHAT_REPO
        );
        assert!(config.apply_override("poetry=org/x").is_err());
        assert!(config.apply_override("translation").is_err());
    }
}
