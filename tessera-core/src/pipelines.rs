//! Per-task pipelines: prompt building, decoding and result shaping.

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use crate::dispatch::{OutboundMessage, Outbox};
use crate::error::WorkerError;
use crate::generation::GenerationLoop;
use crate::resources::ModelResource;
use crate::sampling::{softmax, GenerationConfig, Sampler};
use crate::task::{LabelScore, TaskKind, TaskOutput, TaskRequest};

/// Longest answer span, in tokens, considered for question answering.
const MAX_ANSWER_TOKENS: usize = 30;

/// Runs one request against resolved resources, posting updates on the way.
pub(crate) struct Pipeline<'a> {
    resource: &'a ModelResource,
    outbox: &'a Outbox,
    target: Option<&'a str>,
    stream_buffer: usize,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(
        resource: &'a ModelResource,
        outbox: &'a Outbox,
        target: Option<&'a str>,
        stream_buffer: usize,
    ) -> Self {
        Self {
            resource,
            outbox,
            target,
            stream_buffer: stream_buffer.max(1),
        }
    }

    pub(crate) async fn run(&self, request: &TaskRequest) -> Result<TaskOutput> {
        match request.task {
            TaskKind::Translation => self.translate(request).await,
            TaskKind::TextGeneration => self.text_generation(request).await,
            TaskKind::Summarization => self.summarize(request).await,
            TaskKind::MaskedLanguageModelling => self.fill_mask(request).await,
            TaskKind::SequenceClassification => self.classify(request).await,
            TaskKind::QuestionAnswering => self.answer(request).await,
        }
    }

    async fn translate(&self, request: &TaskRequest) -> Result<TaskOutput> {
        let from = request.require("languageFrom", &request.language_from)?;
        let to = request.require("languageTo", &request.language_to)?;
        let text = request.require("text", &request.text)?;
        let prompt = format!("translate {from} to {to}: {text}");
        let output = self
            .generate_streaming(&prompt, &request.generation, |decoded| decoded.to_string())
            .await?;
        Ok(TaskOutput::Text(output))
    }

    async fn text_generation(&self, request: &TaskRequest) -> Result<TaskOutput> {
        let prompt = request.require("text", &request.text)?.trim();
        let output = self
            .generate_streaming(prompt, &request.generation, |decoded| {
                join_continuation(prompt, decoded)
            })
            .await?;
        Ok(TaskOutput::Text(output))
    }

    async fn summarize(&self, request: &TaskRequest) -> Result<TaskOutput> {
        let text = request.require("text", &request.text)?;
        let output = self
            .generate_streaming(text, &request.generation, |decoded| {
                decoded.trim().to_string()
            })
            .await?;
        Ok(TaskOutput::Text(output))
    }

    /// Decode after `prompt`, posting `render(decoded)` for every step.
    ///
    /// The loop and the update consumer run side by side; the loop waits
    /// whenever `stream_buffer` snapshots are pending.
    async fn generate_streaming(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        render: impl Fn(&str) -> String,
    ) -> Result<String> {
        let tokenizer = self.resource.tokenizer.as_ref();
        let input_ids = tokenizer.encode(prompt)?;
        let generation = GenerationLoop::new(self.resource.model.as_ref(), config)?
            .with_eos_fallback(tokenizer.eos_token_id());
        tracing::debug!(
            prompt_tokens = input_ids.len(),
            max_steps = generation.max_steps(),
            sampler = ?generation.sampler(),
            "starting generation"
        );

        let (tx, mut rx) = mpsc::channel(self.stream_buffer);
        let produce = async move { generation.run(&input_ids, Some(&tx)).await };
        let consume = async {
            while let Some(update) = rx.recv().await {
                let decoded = tokenizer.decode(&update.token_ids, true)?;
                self.post_update(render(&decoded));
            }
            Ok::<_, anyhow::Error>(())
        };
        let (output_ids, ()) = tokio::try_join!(produce, consume)?;

        let decoded = tokenizer.decode(&output_ids, true)?;
        Ok(render(&decoded))
    }

    async fn fill_mask(&self, request: &TaskRequest) -> Result<TaskOutput> {
        let text = request.require("text", &request.text)?;
        let tokenizer = self.resource.tokenizer.as_ref();
        let mask_id = tokenizer.mask_token_id().ok_or(WorkerError::NoMaskToken)?;
        let mut input_ids = tokenizer.encode(text)?;
        let position = input_ids
            .iter()
            .position(|&id| id == mask_id)
            .ok_or(WorkerError::MaskNotFound)?;

        request.generation.sampler.validate()?;
        let sampler = Sampler::from_config(&request.generation.sampler);
        let logits = self.resource.model.forward(&input_ids, &[]).await?;
        let candidates = sampler.sample(&logits, Some(position), &mut request.generation.rng())?;

        let mut samples = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            input_ids[position] = candidate.token_id;
            samples.push(tokenizer.decode(&input_ids, true)?);
        }
        self.post_update(samples.join("\n"));
        Ok(TaskOutput::Samples(samples))
    }

    async fn classify(&self, request: &TaskRequest) -> Result<TaskOutput> {
        let text = request.require("text", &request.text)?;
        let input_ids = self.resource.tokenizer.encode(text)?;
        let logits = self.resource.model.forward(&input_ids, &[]).await?;
        let probs = softmax(logits.row(None)?);

        let names = self.resource.model.labels();
        let mut labels: Vec<LabelScore> = probs
            .into_iter()
            .enumerate()
            .map(|(i, score)| LabelScore {
                label: names
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("LABEL_{i}")),
                score,
            })
            .collect();
        labels.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(TaskOutput::Labels(labels))
    }

    async fn answer(&self, request: &TaskRequest) -> Result<TaskOutput> {
        let question = request.require("question", &request.question)?;
        let context = request.require("context", &request.context)?;
        let tokenizer = self.resource.tokenizer.as_ref();
        let input_ids = tokenizer.encode_pair(question, context)?;
        if input_ids.is_empty() {
            bail!("question and context encode to no tokens");
        }
        let logits = self.resource.model.forward(&input_ids, &[]).await?;

        if logits.vocab_size() != 2 {
            bail!(
                "question-answering head must score (start, end) pairs, got {} values per position",
                logits.vocab_size()
            );
        }
        if logits.rows() != input_ids.len() {
            bail!(
                "question-answering head scored {} positions for {} input tokens",
                logits.rows(),
                input_ids.len()
            );
        }
        let scores = logits.as_slice();
        let (start, end) = best_span(
            |i| scores[2 * i],
            |j| scores[2 * j + 1],
            input_ids.len(),
            MAX_ANSWER_TOKENS,
        );
        let answer = tokenizer.decode(&input_ids[start..=end], true)?;
        Ok(TaskOutput::Text(answer.trim().to_string()))
    }

    fn post_update(&self, data: String) {
        self.outbox.post(OutboundMessage::Update {
            target: self.target.map(str::to_string),
            data,
        });
    }
}

/// Append decoded text to the prompt, adding a space unless one is present.
fn join_continuation(prompt: &str, continuation: &str) -> String {
    if prompt.is_empty() || continuation.is_empty() {
        return format!("{prompt}{continuation}");
    }
    if prompt.ends_with(char::is_whitespace) || continuation.starts_with(char::is_whitespace) {
        format!("{prompt}{continuation}")
    } else {
        format!("{prompt} {continuation}")
    }
}

/// The `(start, end)` pair with `start <= end < start + max_len` maximising
/// `start_score(start) + end_score(end)`. Earlier spans win ties.
fn best_span(
    start_score: impl Fn(usize) -> f32,
    end_score: impl Fn(usize) -> f32,
    len: usize,
    max_len: usize,
) -> (usize, usize) {
    let mut best = (0, 0);
    let mut best_score = f32::NEG_INFINITY;
    for i in 0..len {
        let s = start_score(i);
        for j in i..len.min(i + max_len) {
            let score = s + end_score(j);
            if score > best_score {
                best_score = score;
                best = (i, j);
            }
        }
    }
    best
}
