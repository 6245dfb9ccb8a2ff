//! [`ResourceLoader`] backed by the HuggingFace Hub and local files.
//!
//! Generative tasks load a GGUF causal LM, the other tasks a BERT-family
//! encoder. Source shapes:
//! 1. Local `.gguf` path: loaded directly, `tokenizer.json` is looked up
//!    next to it unless `tokenizer_repo` names another location.
//! 2. Local directory: an encoder checkpoint (`config.json`, weights and
//!    `tokenizer.json`).
//! 3. HF repo id: `file` (required for GGUF, optional for encoders) is
//!    downloaded from the repo, `tokenizer.json` from `tokenizer_repo` (or
//!    the same repo).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use candle_core::Device;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};

use crate::encoder::EncoderModel;
use crate::model::{GgufCausalLm, LanguageModel};
use crate::resources::{LoadProgress, ModelSource, ResourceLoader};
use crate::task::TaskKind;
use crate::tokenizer::{TextTokenizer, TokenizerWrapper};

const TOKENIZER_FILE: &str = "tokenizer.json";
const CONFIG_FILE: &str = "config.json";
/// Encoder weight files, in order of preference.
const ENCODER_WEIGHTS: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];

pub struct HubLoader {
    device: Device,
}

impl HubLoader {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn is_local_gguf(repo: &str) -> bool {
    Path::new(repo).extension().map_or(false, |e| e == "gguf")
}

fn is_local_dir(repo: &str) -> bool {
    Path::new(repo).is_dir()
}

fn hub_repo(repo: &str, revision: Option<&str>) -> Result<ApiRepo> {
    let api = Api::new().context("failed to initialize HuggingFace Hub API")?;
    Ok(match revision {
        Some(rev) => api.repo(Repo::with_revision(
            repo.to_string(),
            RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(repo.to_string()),
    })
}

/// Resolve `tokenizer.json` for `source` to a local path. Blocking.
fn resolve_tokenizer(source: &ModelSource) -> Result<PathBuf> {
    match source.tokenizer_repo.as_deref() {
        Some(path) if path.ends_with(".json") => Ok(PathBuf::from(path)),
        Some(repo) => hub_repo(repo, None)?
            .get(TOKENIZER_FILE)
            .with_context(|| format!("failed to download {TOKENIZER_FILE} from {repo}")),
        None if is_local_gguf(&source.repo) => {
            let dir = Path::new(&source.repo).parent().unwrap_or(Path::new("."));
            let path = dir.join(TOKENIZER_FILE);
            if !path.exists() {
                bail!(
                    "{TOKENIZER_FILE} not found next to GGUF file (looked in {})",
                    dir.display()
                );
            }
            Ok(path)
        }
        None if is_local_dir(&source.repo) => Ok(Path::new(&source.repo).join(TOKENIZER_FILE)),
        None => hub_repo(&source.repo, source.revision.as_deref())?
            .get(TOKENIZER_FILE)
            .with_context(|| {
                format!("failed to download {TOKENIZER_FILE} from {}", source.repo)
            }),
    }
}

/// Resolve the GGUF weights for `source` to a local path. Blocking.
fn resolve_weights(source: &ModelSource) -> Result<PathBuf> {
    if is_local_gguf(&source.repo) {
        let path = PathBuf::from(&source.repo);
        if !path.exists() {
            bail!("GGUF file not found: {}", path.display());
        }
        return Ok(path);
    }
    let Some(file) = source.file.as_deref() else {
        bail!(
            "a GGUF file name must be given for HF repo '{}' (use repo:file)",
            source.repo
        );
    };
    tracing::info!(repo = %source.repo, file, "downloading from HF Hub");
    hub_repo(&source.repo, source.revision.as_deref())?
        .get(file)
        .with_context(|| format!("failed to download {file} from {}", source.repo))
}

/// Resolve an encoder's `config.json` and weights to local paths. Blocking.
fn resolve_encoder(source: &ModelSource) -> Result<(PathBuf, PathBuf)> {
    if is_local_dir(&source.repo) {
        let dir = Path::new(&source.repo);
        let config = dir.join(CONFIG_FILE);
        if !config.exists() {
            bail!("{CONFIG_FILE} not found in {}", dir.display());
        }
        let weights = match source.file.as_deref() {
            Some(file) => Some(dir.join(file)),
            None => ENCODER_WEIGHTS
                .iter()
                .map(|name| dir.join(name))
                .find(|path| path.exists()),
        };
        return match weights {
            Some(path) if path.exists() => Ok((config, path)),
            _ => bail!("no encoder weights found in {}", dir.display()),
        };
    }

    tracing::info!(repo = %source.repo, "downloading encoder from HF Hub");
    let repo = hub_repo(&source.repo, source.revision.as_deref())?;
    let config = repo
        .get(CONFIG_FILE)
        .with_context(|| format!("failed to download {CONFIG_FILE} from {}", source.repo))?;
    let weights = match source.file.as_deref() {
        Some(file) => repo.get(file),
        None => repo
            .get(ENCODER_WEIGHTS[0])
            .or_else(|_| repo.get(ENCODER_WEIGHTS[1])),
    }
    .with_context(|| format!("failed to download encoder weights from {}", source.repo))?;
    Ok((config, weights))
}

#[async_trait]
impl ResourceLoader for HubLoader {
    async fn load_tokenizer(&self, source: &ModelSource) -> Result<Arc<dyn TextTokenizer>> {
        let source = source.clone();
        let tokenizer = tokio::task::spawn_blocking(move || {
            let path = resolve_tokenizer(&source)?;
            tracing::info!(path = %path.display(), "loading tokenizer");
            TokenizerWrapper::from_file(&path)
        })
        .await
        .context("tokenizer load task panicked")??;
        Ok(Arc::new(tokenizer))
    }

    async fn load_model(
        &self,
        task: TaskKind,
        source: &ModelSource,
        progress: &(dyn Fn(LoadProgress) + Send + Sync),
    ) -> Result<Arc<dyn LanguageModel>> {
        let name = source.repo.clone();
        let file = source.file.clone().unwrap_or_else(|| name.clone());
        progress(LoadProgress::Initiate {
            name: name.clone(),
            file: file.clone(),
        });

        let owned = source.clone();
        let device = self.device.clone();
        let model: Arc<dyn LanguageModel> = if task.is_generative() {
            let path = tokio::task::spawn_blocking(move || resolve_weights(&owned))
                .await
                .context("download task panicked")??;
            progress(LoadProgress::Done {
                name: name.clone(),
                file,
            });
            let model = tokio::task::spawn_blocking(move || GgufCausalLm::load(&path, &device))
                .await
                .context("model load task panicked")??;
            Arc::new(model)
        } else {
            let (config, weights) = tokio::task::spawn_blocking(move || resolve_encoder(&owned))
                .await
                .context("download task panicked")??;
            progress(LoadProgress::Done {
                name: name.clone(),
                file,
            });
            let model = tokio::task::spawn_blocking(move || {
                EncoderModel::load(task, &config, &weights, &device)
            })
            .await
            .context("model load task panicked")??;
            Arc::new(model)
        };
        progress(LoadProgress::Ready { name });

        Ok(model)
    }
}
