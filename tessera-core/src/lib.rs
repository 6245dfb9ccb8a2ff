//! Tessera Core -- message-driven inference worker.
//!
//! Decodes with greedy, top-k or beam-search samplers over Candle models,
//! builds per-task model resources exactly once and streams partial results
//! to the host as generation progresses.

use anyhow::Result;
use candle_core::Device;

pub mod config;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod generation;
pub mod hub;
pub mod logits;
pub mod model;
mod pipelines;
pub mod resources;
pub mod sampling;
pub mod task;
pub mod tokenizer;

#[cfg(test)]
pub(crate) mod testing;

pub use config::WorkerConfig;
pub use dispatch::{DispatchSettings, OutboundMessage, Outbox, TaskDispatcher};
pub use encoder::EncoderModel;
pub use error::{WorkerError, WorkerResult};
pub use generation::{GenerationLoop, StepUpdate};
pub use hub::HubLoader;
pub use logits::LogitsView;
pub use model::{GgufCausalLm, LanguageModel, StopPolicy};
pub use resources::{LoadProgress, ModelResource, ModelSource, ResourceCache, ResourceLoader};
pub use sampling::{Candidate, GenerationConfig, Sampler, SamplerConfig};
pub use task::{LabelScore, TaskKind, TaskOutput, TaskRequest};
pub use tokenizer::{TextTokenizer, TokenizerWrapper};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Select the best available compute device for the current platform.
pub fn default_device() -> Result<Device> {
    #[cfg(feature = "metal")]
    {
        tracing::info!("using Metal backend");
        return Ok(Device::new_metal(0)?);
    }

    #[cfg(feature = "cuda")]
    {
        tracing::info!("using CUDA backend");
        return Ok(Device::new_cuda(0)?);
    }

    #[allow(unreachable_code)]
    {
        tracing::info!("using CPU backend");
        Ok(Device::Cpu)
    }
}

/// Names of the compute backends compiled into this build.
pub fn backends() -> Vec<&'static str> {
    let mut backends = Vec::new();
    if cfg!(feature = "metal") {
        backends.push("metal");
    }
    if cfg!(feature = "cuda") {
        backends.push("cuda");
    }
    backends.push("cpu");
    backends
}
