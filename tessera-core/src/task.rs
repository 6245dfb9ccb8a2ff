//! The fixed task set and the request/response payloads exchanged with the host.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::sampling::GenerationConfig;

/// Every task the worker knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Translation,
    TextGeneration,
    MaskedLanguageModelling,
    SequenceClassification,
    QuestionAnswering,
    Summarization,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::Translation,
        TaskKind::TextGeneration,
        TaskKind::MaskedLanguageModelling,
        TaskKind::SequenceClassification,
        TaskKind::QuestionAnswering,
        TaskKind::Summarization,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Translation => "translation",
            Self::TextGeneration => "text-generation",
            Self::MaskedLanguageModelling => "masked-language-modelling",
            Self::SequenceClassification => "sequence-classification",
            Self::QuestionAnswering => "question-answering",
            Self::Summarization => "summarization",
        }
    }

    /// Whether the task decodes autoregressively rather than in one forward pass.
    pub fn is_generative(self) -> bool {
        matches!(
            self,
            Self::Translation | Self::TextGeneration | Self::Summarization
        )
    }

    /// Stable slot index, matching the order of [`TaskKind::ALL`].
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| WorkerError::UnknownTask(s.to_string()))
    }
}

/// An inbound task request as posted by the host.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task: TaskKind,
    pub text: Option<String>,
    pub language_from: Option<String>,
    pub language_to: Option<String>,
    pub question: Option<String>,
    pub context: Option<String>,
    /// Host element that streaming updates and the result are routed to.
    pub element_id_to_update: Option<String>,
    /// Opaque host tag echoed back on the result.
    pub target_type: Option<String>,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl TaskRequest {
    pub fn new(task: TaskKind) -> Self {
        Self {
            task,
            text: None,
            language_from: None,
            language_to: None,
            question: None,
            context: None,
            element_id_to_update: None,
            target_type: None,
            generation: GenerationConfig::default(),
        }
    }

    pub(crate) fn require<'a>(
        &self,
        field: &'static str,
        value: &'a Option<String>,
    ) -> Result<&'a str, WorkerError> {
        value.as_deref().ok_or(WorkerError::MissingField {
            task: self.task,
            field,
        })
    }
}

/// One class label and its probability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f32,
}

/// Terminal payload of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskOutput {
    Text(String),
    Samples(Vec<String>),
    Labels(Vec<LabelScore>),
}

impl TaskOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}
