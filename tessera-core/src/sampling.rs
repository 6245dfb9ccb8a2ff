//! Token selection strategies: greedy, top-k and beam search.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};
use crate::logits::LogitsView;

/// Host-supplied sampling knobs. Immutable for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SamplerConfig {
    /// Divides every score before ranking. 0 = no scaling.
    pub temperature: f64,
    /// Parallel hypotheses kept per step. 1 = single-best decoding.
    #[serde(alias = "num_beams")]
    pub num_beams: usize,
    /// Draw from the distribution instead of ranking it.
    #[serde(alias = "do_sample")]
    pub do_sample: bool,
    /// Restrict candidates to the k best scores. 0 = full vocabulary.
    #[serde(alias = "top_k")]
    pub top_k: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            num_beams: 1,
            do_sample: false,
            top_k: 0,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> WorkerResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(WorkerError::InvalidConfig {
                field: "temperature",
                reason: format!("must be a finite value >= 0, got {}", self.temperature),
            });
        }
        if self.num_beams == 0 {
            return Err(WorkerError::InvalidConfig {
                field: "numBeams",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Sampler settings plus the decoding budget for one generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(flatten)]
    pub sampler: SamplerConfig,
    /// Upper bound on decoding steps. `None` defers to the worker default.
    #[serde(alias = "max_new_tokens")]
    pub max_new_tokens: Option<usize>,
    /// Seed for reproducible sampling. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl GenerationConfig {
    /// RNG for this call, seeded from `seed` when set.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// A proposed next token.
///
/// `score` is a log-probability, except for greedy decoding where it is 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub token_id: u32,
    pub score: f32,
}

impl Candidate {
    fn new(index: usize, score: f32) -> Self {
        Self {
            token_id: index as u32,
            score,
        }
    }
}

/// The selection strategy chosen for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub enum Sampler {
    Greedy {
        temperature: f64,
    },
    TopK {
        temperature: f64,
        k: usize,
    },
    BeamSearch {
        temperature: f64,
        num_beams: usize,
        do_sample: bool,
        top_k: usize,
    },
}

impl Sampler {
    /// Pick the variant for `config`: beams first, then sampling, then greedy.
    pub fn from_config(config: &SamplerConfig) -> Self {
        let temperature = config.temperature;
        if config.num_beams > 1 {
            Self::BeamSearch {
                temperature,
                num_beams: config.num_beams,
                do_sample: config.do_sample,
                top_k: config.top_k,
            }
        } else if config.top_k > 0 || config.do_sample {
            Self::TopK {
                temperature,
                k: config.top_k,
            }
        } else {
            Self::Greedy { temperature }
        }
    }

    pub fn temperature(&self) -> f64 {
        match *self {
            Self::Greedy { temperature }
            | Self::TopK { temperature, .. }
            | Self::BeamSearch { temperature, .. } => temperature,
        }
    }

    /// How many hypotheses survive each decoding step.
    pub fn width(&self) -> usize {
        match *self {
            Self::BeamSearch { num_beams, .. } => num_beams,
            _ => 1,
        }
    }

    /// Propose next-token candidates from the scores at `position`
    /// (the last row when `None`).
    pub fn sample<R: Rng + ?Sized>(
        &self,
        logits: &LogitsView,
        position: Option<usize>,
        rng: &mut R,
    ) -> WorkerResult<Vec<Candidate>> {
        let scores = self.scores(logits, position)?;
        let candidates = match *self {
            Self::Greedy { .. } => vec![Candidate::new(index_of_max(&scores), 0.0)],
            Self::TopK { k, .. } => {
                let (top, probs) = truncated_distribution(&scores, k);
                let picked = random_select(&probs, rng);
                vec![Candidate::new(top[picked].0, probs[picked].ln())]
            }
            Self::BeamSearch {
                num_beams,
                do_sample,
                top_k,
                ..
            } => {
                if do_sample || top_k > 0 {
                    let (top, probs) = truncated_distribution(&scores, top_k);
                    (0..num_beams)
                        .map(|_| {
                            let picked = random_select(&probs, rng);
                            Candidate::new(top[picked].0, probs[picked].ln())
                        })
                        .collect()
                } else {
                    top_items(&log_softmax(&scores), num_beams)
                        .into_iter()
                        .map(|(index, score)| Candidate::new(index, score))
                        .collect()
                }
            }
        };
        Ok(candidates)
    }

    /// Copy the score row and apply temperature.
    ///
    /// Scores are shifted so the row maximum is 0 and divided in f64. A
    /// temperature too small for f32 then sends every other entry to a
    /// negative value or `-inf` while the argmax and softmax stay intact.
    fn scores(&self, logits: &LogitsView, position: Option<usize>) -> WorkerResult<Vec<f32>> {
        let row = logits.row(position)?;
        let temperature = self.temperature();
        if temperature <= 0.0 {
            return Ok(row.to_vec());
        }
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Ok(row
            .iter()
            .map(|&s| ((s - max) as f64 / temperature) as f32)
            .collect())
    }
}

/// Top `k` entries (all when `k` is 0 or exceeds the vocabulary) and the
/// softmax over exactly those entries.
fn truncated_distribution(scores: &[f32], k: usize) -> (Vec<(usize, f32)>, Vec<f32>) {
    let k = if k > 0 { k.min(scores.len()) } else { scores.len() };
    let top = top_items(scores, k);
    let probs = softmax(&top.iter().map(|&(_, s)| s).collect::<Vec<_>>());
    (top, probs)
}

/// Index drawn with probability proportional to its weight.
///
/// Draws `u` in `[0, sum)` and walks the weights until the remainder drops to
/// zero. Rounding can leave a positive remainder after the last weight, in
/// which case index 0 is returned.
pub fn random_select<R: Rng + ?Sized>(weights: &[f32], rng: &mut R) -> usize {
    let total: f32 = weights.iter().sum();
    let mut remainder = rng.gen::<f32>() * total;
    for (i, &w) in weights.iter().enumerate() {
        remainder -= w;
        if remainder <= 0.0 {
            return i;
        }
    }
    0
}

/// Index of the largest score; the lowest index wins ties.
pub fn index_of_max(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

/// Numerically stable softmax.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|&s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn log_softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = scores.iter().map(|&s| (s - max).exp()).sum::<f32>().ln();
    scores.iter().map(|&s| s - max - log_sum).collect()
}

/// The `k` highest `(index, score)` pairs, best first.
///
/// The sort is stable, so equal scores keep ascending index order.
pub fn top_items(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
}
