//! Autoregressive decoding: drives the model step by step through a sampler.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use tokio::sync::mpsc;

use crate::error::{WorkerError, WorkerResult};
use crate::model::{LanguageModel, StopPolicy};
use crate::sampling::{Candidate, GenerationConfig, Sampler};

/// Step budget used when neither the request nor the worker sets one.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 128;

/// One hypothesis tracked during decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Beam {
    pub output_token_ids: Vec<u32>,
    /// Sum of candidate scores along the hypothesis.
    pub score: f32,
    /// Set once the hypothesis emitted the end-of-sequence token.
    pub done: bool,
}

impl Beam {
    fn start(decoder_start_ids: Vec<u32>) -> Self {
        Self {
            output_token_ids: decoder_start_ids,
            score: 0.0,
            done: false,
        }
    }

    fn extend(&self, candidate: Candidate, eos_token_id: Option<u32>) -> Self {
        let mut output_token_ids = Vec::with_capacity(self.output_token_ids.len() + 1);
        output_token_ids.extend_from_slice(&self.output_token_ids);
        output_token_ids.push(candidate.token_id);
        Self {
            output_token_ids,
            score: self.score + candidate.score,
            done: eos_token_id == Some(candidate.token_id),
        }
    }
}

/// The leading beam after a decoding step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub step: usize,
    pub token_ids: Vec<u32>,
}

/// Drives one generation call. Owns its beams and RNG; nothing is shared.
pub struct GenerationLoop<'a> {
    model: &'a dyn LanguageModel,
    sampler: Sampler,
    policy: StopPolicy,
    max_steps: usize,
    rng: StdRng,
}

impl<'a> GenerationLoop<'a> {
    /// Validate `config`, select the sampler and resolve the step budget
    /// against the model's own limit.
    pub fn new(model: &'a dyn LanguageModel, config: &GenerationConfig) -> WorkerResult<Self> {
        config.sampler.validate()?;
        let policy = model.stop_policy();
        let max_steps = config
            .max_new_tokens
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS)
            .min(policy.max_new_tokens);
        Ok(Self {
            model,
            sampler: Sampler::from_config(&config.sampler),
            policy,
            max_steps,
            rng: config.rng(),
        })
    }

    /// Use `eos_token_id` when the model does not name one itself.
    pub fn with_eos_fallback(mut self, eos_token_id: Option<u32>) -> Self {
        if self.policy.eos_token_id.is_none() {
            self.policy.eos_token_id = eos_token_id;
        }
        self
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Step budget before the prompt is known.
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Steps left for `prompt_len` input tokens once the model's total
    /// sequence limit is taken into account.
    pub fn steps_for_prompt(&self, prompt_len: usize) -> usize {
        let used = prompt_len + self.policy.decoder_start_ids.len();
        self.max_steps
            .min(self.policy.max_sequence_len.saturating_sub(used))
    }

    /// Decode after `input_ids` and return the leading beam's output ids.
    ///
    /// When `updates` is given, one [`StepUpdate`] per step is sent in step
    /// order, waiting for channel capacity. Any forward-pass failure aborts
    /// the whole call.
    pub async fn run(
        mut self,
        input_ids: &[u32],
        updates: Option<&mpsc::Sender<StepUpdate>>,
    ) -> Result<Vec<u32>> {
        let width = self.sampler.width();
        let steps = self.steps_for_prompt(input_ids.len());
        if steps < self.max_steps {
            tracing::debug!(
                requested = self.max_steps,
                steps,
                "step budget clamped to the model's sequence limit"
            );
        }
        let mut beams = vec![Beam::start(std::mem::take(
            &mut self.policy.decoder_start_ids,
        ))];

        for step in 0..steps {
            let mut next = Vec::with_capacity(beams.len() * width);
            for beam in &beams {
                if beam.done {
                    next.push(beam.clone());
                    continue;
                }
                let logits = self
                    .model
                    .forward(input_ids, &beam.output_token_ids)
                    .await
                    .with_context(|| format!("forward pass failed at step {step}"))?;
                for candidate in self.sampler.sample(&logits, None, &mut self.rng)? {
                    next.push(beam.extend(candidate, self.policy.eos_token_id));
                }
            }

            next.sort_by(|a, b| b.score.total_cmp(&a.score));
            next.truncate(width);
            beams = next;

            let leader = &beams[0];
            tracing::trace!(step, score = leader.score, len = leader.output_token_ids.len(), "decoded step");
            if let Some(tx) = updates {
                tx.send(StepUpdate {
                    step,
                    token_ids: leader.output_token_ids.clone(),
                })
                .await
                .map_err(|_| WorkerError::StreamClosed)?;
            }
            if leader.done {
                tracing::debug!(step, "leading beam reached end of sequence");
                break;
            }
        }

        Ok(beams.swap_remove(0).output_token_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FnModel;
    use crate::sampling::SamplerConfig;

    const EOS: u32 = 0;

    fn greedy(max_new_tokens: Option<usize>) -> GenerationConfig {
        GenerationConfig {
            sampler: SamplerConfig {
                temperature: 0.0,
                ..Default::default()
            },
            max_new_tokens,
            seed: Some(1),
        }
    }

    #[tokio::test]
    async fn greedy_follows_script_and_streams_each_step() {
        let model = FnModel::scripted(6, vec![3, 4, 5], EOS);
        let (tx, mut rx) = mpsc::channel(16);

        let out = GenerationLoop::new(&model, &greedy(None))
            .unwrap()
            .run(&[1, 2], Some(&tx))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(out, vec![3, 4, 5, EOS]);
        let mut seen = Vec::new();
        while let Some(update) = rx.recv().await {
            seen.push(update);
        }
        assert_eq!(seen.len(), 4);
        for (i, update) in seen.iter().enumerate() {
            assert_eq!(update.step, i);
            assert_eq!(update.token_ids, out[..=i]);
        }
    }

    #[tokio::test]
    async fn step_budget_stops_before_eos() {
        let model = FnModel::scripted(6, vec![3, 4, 5], EOS);
        let out = GenerationLoop::new(&model, &greedy(Some(2)))
            .unwrap()
            .run(&[1], None)
            .await
            .unwrap();
        assert_eq!(out, vec![3, 4]);
    }

    #[tokio::test]
    async fn model_limit_caps_requested_budget() {
        let model = FnModel::scripted(6, vec![3, 4, 5], EOS).with_max_new_tokens(1);
        let generation = GenerationLoop::new(&model, &greedy(Some(50))).unwrap();
        assert_eq!(generation.max_steps(), 1);
        assert_eq!(generation.run(&[1], None).await.unwrap(), vec![3]);
    }

    /// Scores keyed by the last output token. Greedy takes 1 then stops;
    /// beam search finds the stronger path through 2 and 3.
    fn branching_model() -> FnModel {
        FnModel::new(|_, output| {
            let scores = match output.last() {
                None => vec![-10.0, 2.0, 1.9, -10.0],
                Some(1) => vec![0.0, 0.0, 0.0, 0.0],
                Some(2) => vec![-10.0, -10.0, -10.0, 10.0],
                _ => vec![10.0, -10.0, -10.0, -10.0],
            };
            Ok(crate::LogitsView::from_scores(scores)?)
        })
        .with_eos(EOS)
    }

    #[tokio::test]
    async fn beam_search_keeps_the_best_cumulative_path() {
        let model = branching_model();

        let greedy_out = GenerationLoop::new(&model, &greedy(Some(10)))
            .unwrap()
            .run(&[9], None)
            .await
            .unwrap();
        assert_eq!(greedy_out, vec![1, EOS]);

        let beams = GenerationConfig {
            sampler: SamplerConfig {
                temperature: 0.0,
                num_beams: 2,
                ..Default::default()
            },
            max_new_tokens: Some(10),
            seed: Some(1),
        };
        let beam_out = GenerationLoop::new(&model, &beams)
            .unwrap()
            .run(&[9], None)
            .await
            .unwrap();
        assert_eq!(beam_out, vec![2, 3, EOS]);
    }

    #[tokio::test]
    async fn decoder_start_ids_seed_the_beam() {
        let model = FnModel::scripted(6, vec![4], EOS).with_decoder_start(vec![5]);
        let out = GenerationLoop::new(&model, &greedy(None))
            .unwrap()
            .run(&[1], None)
            .await
            .unwrap();
        assert_eq!(out, vec![5, 4, EOS]);
    }

    #[tokio::test]
    async fn forward_failure_aborts_after_streamed_steps() {
        let model = FnModel::new(|_, output| {
            if output.len() == 2 {
                anyhow::bail!("device lost");
            }
            Ok(crate::LogitsView::from_scores(vec![0.0, 1.0, 0.0, 0.0])?)
        });
        let (tx, mut rx) = mpsc::channel(16);
        let err = GenerationLoop::new(&model, &greedy(Some(10)))
            .unwrap()
            .run(&[1], Some(&tx))
            .await
            .unwrap_err();
        drop(tx);
        assert!(format!("{err:#}").contains("device lost"));

        let mut steps = 0;
        while rx.recv().await.is_some() {
            steps += 1;
        }
        assert_eq!(steps, 2);
    }

    #[tokio::test]
    async fn sequence_limit_counts_the_prompt() {
        // Fails like a fixed-context model once prompt + output exceed 6 tokens.
        let model = FnModel::new(|input, output| {
            if input.len() + output.len() > 6 {
                anyhow::bail!("sequence exceeds context length");
            }
            Ok(crate::LogitsView::from_scores(vec![0.0, 1.0, 0.0])?)
        })
        .with_eos(EOS)
        .with_max_sequence_len(6);

        let generation = GenerationLoop::new(&model, &greedy(Some(50))).unwrap();
        assert_eq!(generation.steps_for_prompt(4), 2);
        let (tx, mut rx) = mpsc::channel(16);
        let out = generation.run(&[7, 7, 7, 7], Some(&tx)).await.unwrap();
        drop(tx);
        assert_eq!(out, vec![1, 1]);
        let mut steps = 0;
        while rx.recv().await.is_some() {
            steps += 1;
        }
        assert_eq!(steps, 2);

        // A prompt that already fills the context decodes nothing.
        let full = GenerationLoop::new(&model, &greedy(Some(50)))
            .unwrap()
            .run(&[7; 6], None)
            .await
            .unwrap();
        assert!(full.is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let model = FnModel::scripted(4, vec![1], EOS);
        let config = GenerationConfig {
            sampler: SamplerConfig {
                num_beams: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            GenerationLoop::new(&model, &config),
            Err(WorkerError::InvalidConfig { field: "numBeams", .. })
        ));
    }

    #[tokio::test]
    async fn eos_fallback_only_fills_a_missing_policy() {
        let model = FnModel::scripted(6, vec![3, 4], 5).without_eos();
        let out = GenerationLoop::new(&model, &greedy(Some(10)))
            .unwrap()
            .with_eos_fallback(Some(5))
            .run(&[1], None)
            .await
            .unwrap();
        assert_eq!(out, vec![3, 4, 5]);
    }
}
