use thiserror::Error;

use crate::task::TaskKind;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no model source registered for task '{0}'")]
    UnregisteredSource(TaskKind),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("invalid generation config: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("logits buffer holds {got} scores but dims {dims:?} need {expected}")]
    LogitsShape {
        dims: [usize; 3],
        expected: usize,
        got: usize,
    },

    #[error("logits must have a non-empty vocabulary axis")]
    EmptyVocabulary,

    #[error("position {position} is out of range for {rows} score rows")]
    PositionOutOfRange { position: usize, rows: usize },

    #[error("'{task}' request is missing field '{field}'")]
    MissingField { task: TaskKind, field: &'static str },

    #[error("tokenizer does not define a mask token")]
    NoMaskToken,

    #[error("input text contains no mask token")]
    MaskNotFound,

    #[error("step update stream closed before generation finished")]
    StreamClosed,
}

pub type WorkerResult<T> = Result<T, WorkerError>;
