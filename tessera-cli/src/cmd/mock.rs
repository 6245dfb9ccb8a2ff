//! Canned tokenizer, model and loader so host surfaces run without weights.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tessera_core::{
    LanguageModel, LoadProgress, LogitsView, ModelSource, ResourceCache, ResourceLoader,
    StopPolicy, TaskKind, TextTokenizer,
};

/// Vocabulary shared by the mock tokenizer and model.
pub const WORDS: &[&str] = &[
    "</s>", "translate", "en", "to", "fr:", "hello", "world", "bonjour", "le", "monde",
];

/// Whitespace tokenizer over [`WORDS`]; id 0 is special.
pub struct MockTokenizer;

impl TextTokenizer for MockTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.split_whitespace()
            .map(|w| {
                WORDS
                    .iter()
                    .position(|v| *v == w)
                    .map(|i| i as u32)
                    .ok_or_else(|| anyhow!("word '{w}' not in vocabulary"))
            })
            .collect()
    }

    fn encode_pair(&self, first: &str, second: &str) -> Result<Vec<u32>> {
        let mut ids = self.encode(first)?;
        ids.extend(self.encode(second)?);
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String> {
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| !(skip_special && id == 0))
            .map(|&id| {
                WORDS
                    .get(id as usize)
                    .copied()
                    .ok_or_else(|| anyhow!("id {id} not in vocabulary"))
            })
            .collect::<Result<_>>()?;
        Ok(words.join(" "))
    }

    fn mask_token_id(&self) -> Option<u32> {
        None
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(0)
    }
}

/// Always answers "bonjour le monde", then end of sequence.
pub struct MockModel;

#[async_trait]
impl LanguageModel for MockModel {
    async fn forward(&self, _input_ids: &[u32], output_ids: &[u32]) -> Result<LogitsView> {
        let next = [7, 8, 9].get(output_ids.len()).copied().unwrap_or(0);
        let mut scores = vec![0.0; WORDS.len()];
        scores[next] = 5.0;
        Ok(LogitsView::from_scores(scores)?)
    }

    fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            eos_token_id: Some(0),
            max_new_tokens: 64,
            max_sequence_len: 512,
            decoder_start_ids: Vec::new(),
        }
    }
}

pub struct MockLoader;

#[async_trait]
impl ResourceLoader for MockLoader {
    async fn load_tokenizer(&self, _source: &ModelSource) -> Result<Arc<dyn TextTokenizer>> {
        Ok(Arc::new(MockTokenizer))
    }

    async fn load_model(
        &self,
        _task: TaskKind,
        source: &ModelSource,
        progress: &(dyn Fn(LoadProgress) + Send + Sync),
    ) -> Result<Arc<dyn LanguageModel>> {
        progress(LoadProgress::Ready {
            name: source.repo.clone(),
        });
        Ok(Arc::new(MockModel))
    }
}

/// Cache serving translation from the mock loader.
pub fn cache() -> Arc<ResourceCache> {
    Arc::new(ResourceCache::with_sources(
        Arc::new(MockLoader),
        [(TaskKind::Translation, ModelSource::new("mock/translator"))],
    ))
}
