//! In-memory tokenizer, model and loader doubles for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::logits::LogitsView;
use crate::model::{LanguageModel, StopPolicy};
use crate::resources::{LoadProgress, ModelSource, ResourceLoader};
use crate::task::TaskKind;
use crate::tokenizer::TextTokenizer;

type ForwardFn = dyn Fn(&[u32], &[u32]) -> Result<LogitsView> + Send + Sync;

/// A model whose forward pass is a plain closure.
pub struct FnModel {
    forward: Box<ForwardFn>,
    policy: StopPolicy,
    labels: Vec<String>,
}

impl FnModel {
    pub fn new(
        forward: impl Fn(&[u32], &[u32]) -> Result<LogitsView> + Send + Sync + 'static,
    ) -> Self {
        Self {
            forward: Box::new(forward),
            policy: StopPolicy {
                eos_token_id: None,
                max_new_tokens: 1024,
                max_sequence_len: usize::MAX,
                decoder_start_ids: Vec::new(),
            },
            labels: Vec::new(),
        }
    }

    /// Emits `script` one token per step, then `eos` forever.
    pub fn scripted(vocab: usize, script: Vec<u32>, eos: u32) -> Self {
        Self::new(move |_, output| {
            let next = script.get(output.len()).copied().unwrap_or(eos);
            let mut scores = vec![0.0; vocab];
            scores[next as usize] = 5.0;
            Ok(LogitsView::from_scores(scores)?)
        })
        .with_eos(eos)
    }

    pub fn with_eos(mut self, eos: u32) -> Self {
        self.policy.eos_token_id = Some(eos);
        self
    }

    pub fn without_eos(mut self) -> Self {
        self.policy.eos_token_id = None;
        self
    }

    pub fn with_max_new_tokens(mut self, n: usize) -> Self {
        self.policy.max_new_tokens = n;
        self
    }

    pub fn with_max_sequence_len(mut self, n: usize) -> Self {
        self.policy.max_sequence_len = n;
        self
    }

    /// Seed the decoder; the scripted positions shift past the start ids.
    pub fn with_decoder_start(mut self, ids: Vec<u32>) -> Self {
        let offset = ids.len();
        let inner = self.forward;
        self.forward = Box::new(move |input: &[u32], output: &[u32]| {
            inner(input, &output[offset.min(output.len())..])
        });
        self.policy.decoder_start_ids = ids;
        self
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }
}

#[async_trait]
impl LanguageModel for FnModel {
    async fn forward(&self, input_ids: &[u32], output_ids: &[u32]) -> Result<LogitsView> {
        tokio::task::yield_now().await;
        (self.forward)(input_ids, output_ids)
    }

    fn stop_policy(&self) -> StopPolicy {
        self.policy.clone()
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// Whitespace tokenizer over a fixed word list. Ids below `special` count
/// as special tokens and are dropped by `decode(.., true)`.
pub struct WordTokenizer {
    words: Vec<String>,
    special: u32,
    mask: Option<u32>,
}

impl WordTokenizer {
    pub fn new(words: &[&str], special: u32) -> Self {
        Self {
            words: words.iter().map(|w| w.to_string()).collect(),
            special,
            mask: None,
        }
    }

    pub fn with_mask(mut self, word: &str) -> Self {
        self.mask = self.id(word);
        self
    }

    pub fn id(&self, word: &str) -> Option<u32> {
        self.words.iter().position(|w| w == word).map(|i| i as u32)
    }
}

impl TextTokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.split_whitespace()
            .map(|w| {
                self.id(w)
                    .ok_or_else(|| anyhow::anyhow!("word '{w}' not in vocabulary"))
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
            .filter(|&&id| !(skip_special && id < self.special))
            .map(|&id| {
                self.words
                    .get(id as usize)
                    .map(String::as_str)
                    .ok_or_else(|| anyhow::anyhow!("id {id} not in vocabulary"))
            })
            .collect::<Result<_>>()?;
        Ok(words.join(" "))
    }

    fn mask_token_id(&self) -> Option<u32> {
        self.mask
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(0)
    }
}

/// Hands out the same tokenizer/model pair for every task, after a short
/// delay so racing callers overlap with the load.
pub struct StaticLoader {
    pub tokenizer: Arc<dyn TextTokenizer>,
    pub model: Arc<dyn LanguageModel>,
    pub model_loads: AtomicUsize,
    pub failures_left: AtomicUsize,
}

impl StaticLoader {
    pub fn new(tokenizer: impl TextTokenizer + 'static, model: impl LanguageModel + 'static) -> Self {
        Self {
            tokenizer: Arc::new(tokenizer),
            model: Arc::new(model),
            model_loads: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` model loads.
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl ResourceLoader for StaticLoader {
    async fn load_tokenizer(&self, _source: &ModelSource) -> Result<Arc<dyn TextTokenizer>> {
        Ok(Arc::clone(&self.tokenizer))
    }

    async fn load_model(
        &self,
        task: TaskKind,
        source: &ModelSource,
        progress: &(dyn Fn(LoadProgress) + Send + Sync),
    ) -> Result<Arc<dyn LanguageModel>> {
        self.model_loads.fetch_add(1, Ordering::SeqCst);
        progress(LoadProgress::Initiate {
            name: source.repo.clone(),
            file: "model.gguf".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("simulated download failure for {task}");
        }
        progress(LoadProgress::Ready {
            name: source.repo.clone(),
        });
        Ok(Arc::clone(&self.model))
    }
}
