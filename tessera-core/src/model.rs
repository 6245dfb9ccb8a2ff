//! The forward-pass contract and a GGUF causal LM that satisfies it.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;

use crate::logits::LogitsView;

/// When decoding must stop, as dictated by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopPolicy {
    pub eos_token_id: Option<u32>,
    /// Most tokens the model can append in one call.
    pub max_new_tokens: usize,
    /// Longest prompt plus output sequence the model accepts.
    pub max_sequence_len: usize,
    /// Initial decoder sequence. Empty for decoder-only models.
    pub decoder_start_ids: Vec<u32>,
}

/// A loaded model head.
///
/// Generative models score the next token after `input_ids` followed by
/// `output_ids`. Single-pass heads are called with empty `output_ids` and
/// return one row per input position; question-answering heads put
/// `(start, end)` scores on the last axis.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn forward(&self, input_ids: &[u32], output_ids: &[u32]) -> Result<LogitsView>;

    fn stop_policy(&self) -> StopPolicy;

    /// Class names for classification heads, indexed by output position.
    fn labels(&self) -> &[String] {
        &[]
    }
}

/// A GGUF-quantized Llama-family model.
pub struct GgufCausalLm {
    weights: Arc<Mutex<ModelWeights>>,
    device: Device,
    max_seq_len: usize,
    eos_token_id: Option<u32>,
}

impl GgufCausalLm {
    /// Load weights, context length and EOS id from a GGUF file.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut file = BufReader::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        );
        let content = gguf_file::Content::read(&mut file).context("failed to parse GGUF file")?;

        let max_seq_len = content
            .metadata
            .get("llama.context_length")
            .and_then(|v| v.to_u32().ok())
            .map(|v| v as usize)
            .unwrap_or(4096);
        let eos_token_id = ["tokenizer.ggml.eos_token_id", "general.eos_token_id"]
            .iter()
            .find_map(|key| content.metadata.get(*key).and_then(|v| v.to_u32().ok()));

        let weights = ModelWeights::from_gguf(content, &mut file, device)
            .context("failed to load quantized llama weights from GGUF")?;
        tracing::info!(path = %path.display(), max_seq_len, ?eos_token_id, "GGUF model loaded");

        Ok(Self {
            weights: Arc::new(Mutex::new(weights)),
            device: device.clone(),
            max_seq_len,
            eos_token_id,
        })
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
}

#[async_trait]
impl LanguageModel for GgufCausalLm {
    async fn forward(&self, input_ids: &[u32], output_ids: &[u32]) -> Result<LogitsView> {
        let tokens: Vec<u32> = input_ids.iter().chain(output_ids).copied().collect();
        if tokens.is_empty() {
            bail!("forward pass needs at least one token");
        }
        if tokens.len() > self.max_seq_len {
            bail!(
                "sequence of {} tokens exceeds context length {}",
                tokens.len(),
                self.max_seq_len
            );
        }

        let weights = Arc::clone(&self.weights);
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || {
            let mut weights = weights.lock().map_err(|e| anyhow::anyhow!("lock: {e}"))?;
            let input = Tensor::new(tokens.as_slice(), &device)?.unsqueeze(0)?;
            // Position 0 rebuilds the KV cache from the full sequence.
            let logits = weights
                .forward(&input, 0)
                .context("quantized llama forward pass")?;
            LogitsView::from_tensor(&logits)
        })
        .await
        .context("forward pass task panicked")?
    }

    fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            eos_token_id: self.eos_token_id,
            max_new_tokens: self.max_seq_len,
            max_sequence_len: self.max_seq_len,
            decoder_start_ids: Vec::new(),
        }
    }
}
