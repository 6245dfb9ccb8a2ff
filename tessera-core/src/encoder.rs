//! BERT-family encoders with the single-pass heads the worker serves:
//! masked-LM vocabulary scores, sequence classification and QA span scores.
//!
//! Checkpoints are HF `config.json` plus safetensors (or a PyTorch `.bin`).
//! Both `bert` and `distilbert` backbones are supported, with or without
//! the `bert.`/`distilbert.` weight prefix.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};
use candle_transformers::models::{bert, distilbert};
use serde::Deserialize;

use crate::logits::LogitsView;
use crate::model::{LanguageModel, StopPolicy};
use crate::task::TaskKind;

fn default_layer_norm_eps() -> f64 {
    1e-12
}

/// The `config.json` fields the heads need, shared by both backbones.
#[derive(Debug, Deserialize)]
struct HeadConfig {
    #[serde(default)]
    model_type: Option<String>,
    #[serde(alias = "dim")]
    hidden_size: usize,
    vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    layer_norm_eps: f64,
    max_position_embeddings: usize,
    #[serde(default)]
    id2label: BTreeMap<String, String>,
    #[serde(default)]
    num_labels: Option<usize>,
}

impl HeadConfig {
    /// Class names ordered by their numeric id.
    fn labels(&self) -> Vec<String> {
        let mut labels: Vec<(usize, &String)> = self
            .id2label
            .iter()
            .filter_map(|(id, label)| id.parse().ok().map(|id| (id, label)))
            .collect();
        labels.sort_by_key(|&(id, _)| id);
        labels.into_iter().map(|(_, label)| label.clone()).collect()
    }
}

enum Backbone {
    Bert(bert::BertModel),
    DistilBert(distilbert::DistilBertModel),
}

impl Backbone {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Bert(model) => model.forward(input, &input.zeros_like()?, None),
            Self::DistilBert(model) => {
                // Nonzero entries are masked out; a single unpadded sequence masks nothing.
                let len = input.dim(1)?;
                let mask = Tensor::zeros((len, len), DType::U8, input.device())?;
                model.forward(input, &mask)
            }
        }
    }
}

enum Head {
    MaskedLm {
        transform: Linear,
        norm: LayerNorm,
        decoder: Linear,
    },
    Classifier {
        pre: Linear,
        tanh: bool,
        classifier: Linear,
    },
    Span {
        qa_outputs: Linear,
    },
}

impl Head {
    fn forward(&self, hidden: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::MaskedLm {
                transform,
                norm,
                decoder,
            } => {
                let hidden = norm.forward(&transform.forward(hidden)?.gelu_erf()?)?;
                decoder.forward(&hidden)
            }
            Self::Classifier {
                pre,
                tanh,
                classifier,
            } => {
                // Classify from the first ([CLS]) position only.
                let pooled = pre.forward(&hidden.narrow(1, 0, 1)?)?;
                let pooled = if *tanh { pooled.tanh()? } else { pooled.relu()? };
                classifier.forward(&pooled)
            }
            Self::Span { qa_outputs } => qa_outputs.forward(hidden),
        }
    }
}

struct Network {
    backbone: Backbone,
    head: Head,
}

/// The first candidate tensor the checkpoint holds. Tied weights such as
/// the MLM decoder are often stored only under the embedding name.
fn tied(shape: impl Into<candle_core::Shape>, candidates: &[(&VarBuilder, &str)]) -> Result<Tensor> {
    let Some(&(vb, name)) = candidates
        .iter()
        .find(|(vb, name)| vb.contains_tensor(name))
        .or_else(|| candidates.first())
    else {
        bail!("no tensor candidates given");
    };
    Ok(vb.get(shape, name)?)
}

/// The builder rooted at the backbone, whether or not weights carry `prefix.`.
fn backbone_root<'a>(vb: &VarBuilder<'a>, prefix: &str) -> VarBuilder<'a> {
    if vb.contains_tensor(&format!("{prefix}.embeddings.word_embeddings.weight")) {
        vb.pp(prefix)
    } else {
        vb.clone()
    }
}

/// A BERT or DistilBERT encoder with one task head.
pub struct EncoderModel {
    network: Arc<Network>,
    device: Device,
    labels: Vec<String>,
    max_sequence_len: usize,
}

impl EncoderModel {
    /// Load `config.json` and weights for the head `task` needs.
    pub fn load(task: TaskKind, config: &Path, weights: &Path, device: &Device) -> Result<Self> {
        let raw = std::fs::read_to_string(config)
            .with_context(|| format!("cannot read {}", config.display()))?;
        let vb = if weights.extension().map_or(false, |e| e == "bin" || e == "pt") {
            VarBuilder::from_pth(weights, DType::F32, device)?
        } else {
            // SAFETY: the file is mapped read-only and not modified while loaded.
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? }
        };
        let model = Self::from_parts(task, &raw, vb, device)
            .with_context(|| format!("failed to load encoder from {}", weights.display()))?;
        tracing::info!(
            %task,
            path = %weights.display(),
            labels = model.labels.len(),
            "encoder model loaded"
        );
        Ok(model)
    }

    fn from_parts(task: TaskKind, raw_config: &str, vb: VarBuilder, device: &Device) -> Result<Self> {
        let config: HeadConfig = serde_json::from_str(raw_config).context("invalid config.json")?;
        let labels = config.labels();
        let hidden = config.hidden_size;
        let distil = match config.model_type.as_deref() {
            Some("distilbert") => true,
            Some("bert") | None => false,
            Some(other) => bail!("unsupported encoder architecture '{other}'"),
        };

        let root = backbone_root(&vb, if distil { "distilbert" } else { "bert" });
        let backbone = if distil {
            let backbone_config: distilbert::Config = serde_json::from_str(raw_config)?;
            Backbone::DistilBert(distilbert::DistilBertModel::load(root.clone(), &backbone_config)?)
        } else {
            let backbone_config: bert::Config = serde_json::from_str(raw_config)?;
            Backbone::Bert(bert::BertModel::load(root.clone(), &backbone_config)?)
        };

        let embeddings = "embeddings.word_embeddings.weight";
        let head = match task {
            TaskKind::MaskedLanguageModelling if distil => Head::MaskedLm {
                transform: linear(hidden, hidden, vb.pp("vocab_transform"))?,
                norm: layer_norm(hidden, 1e-12, vb.pp("vocab_layer_norm"))?,
                decoder: Linear::new(
                    tied(
                        (config.vocab_size, hidden),
                        &[(&vb, "vocab_projector.weight"), (&root, embeddings)],
                    )?,
                    Some(vb.get(config.vocab_size, "vocab_projector.bias")?),
                ),
            },
            TaskKind::MaskedLanguageModelling => {
                let predictions = vb.pp("cls").pp("predictions");
                Head::MaskedLm {
                    transform: linear(hidden, hidden, predictions.pp("transform").pp("dense"))?,
                    norm: layer_norm(
                        hidden,
                        config.layer_norm_eps,
                        predictions.pp("transform").pp("LayerNorm"),
                    )?,
                    decoder: Linear::new(
                        tied(
                            (config.vocab_size, hidden),
                            &[(&predictions, "decoder.weight"), (&root, embeddings)],
                        )?,
                        Some(tied(
                            config.vocab_size,
                            &[(&predictions, "bias"), (&predictions, "decoder.bias")],
                        )?),
                    ),
                }
            }
            TaskKind::SequenceClassification => {
                let classes = if labels.is_empty() {
                    config.num_labels.unwrap_or(2)
                } else {
                    labels.len()
                };
                let pre = if distil {
                    linear(hidden, hidden, vb.pp("pre_classifier"))?
                } else {
                    linear(hidden, hidden, root.pp("pooler").pp("dense"))?
                };
                Head::Classifier {
                    pre,
                    tanh: !distil,
                    classifier: linear(hidden, classes, vb.pp("classifier"))?,
                }
            }
            TaskKind::QuestionAnswering => Head::Span {
                qa_outputs: linear(hidden, 2, vb.pp("qa_outputs"))?,
            },
            TaskKind::Translation | TaskKind::TextGeneration | TaskKind::Summarization => {
                bail!("'{task}' needs a generative model, not an encoder")
            }
        };

        Ok(Self {
            network: Arc::new(Network { backbone, head }),
            device: device.clone(),
            labels,
            max_sequence_len: config.max_position_embeddings,
        })
    }
}

#[async_trait]
impl LanguageModel for EncoderModel {
    async fn forward(&self, input_ids: &[u32], output_ids: &[u32]) -> Result<LogitsView> {
        if !output_ids.is_empty() {
            bail!("encoder heads score the input in a single pass");
        }
        if input_ids.is_empty() {
            bail!("forward pass needs at least one token");
        }
        if input_ids.len() > self.max_sequence_len {
            bail!(
                "sequence of {} tokens exceeds the encoder limit of {}",
                input_ids.len(),
                self.max_sequence_len
            );
        }

        let network = Arc::clone(&self.network);
        let device = self.device.clone();
        let ids = input_ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let input = Tensor::new(ids.as_slice(), &device)?.unsqueeze(0)?;
            let hidden = network.backbone.forward(&input)?;
            let logits = network.head.forward(&hidden)?;
            LogitsView::from_tensor(&logits)
        })
        .await
        .context("encoder forward task panicked")?
    }

    fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            eos_token_id: None,
            max_new_tokens: 0,
            max_sequence_len: self.max_sequence_len,
            decoder_start_ids: Vec::new(),
        }
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }
}
