use std::io;

use thiserror::Error;

/// Filter errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Unrecognized keyword or operator in rule text.
    #[error("line {line}: unexpected `{token}`")]
    Syntax { line: usize, token: String },
    /// A constraint spanning several fields of a rule was violated.
    #[error("line {line}: {reason}")]
    Semantic { line: usize, reason: String },
    /// A match field was used with a protocol it does not apply to.
    #[error("line {line}: {reason}")]
    ProtocolMismatch { line: usize, reason: String },
    #[error("line {line}: bad mask `{text}`")]
    Mask { line: usize, text: String },
    #[error("line {line}: bad host `{text}`")]
    Host { line: usize, text: String },
    #[error("line {line}: bad port specification `{text}`")]
    PortSyntax { line: usize, text: String },
    /// Timeout queue still has references or entries.
    #[error("timeout queue is still in use")]
    QueueBusy,
    /// Group still referenced by rules.
    #[error("group `{0}` is still in use")]
    Busy(String),
    /// State table is at its configured maximum.
    #[error("state table is full")]
    StateFull,
    #[error("rule not found")]
    RuleNotFound,
    #[error("unknown tunable `{0}`")]
    UnknownTunable(String),
    #[error("value {value} out of range for tunable `{name}`")]
    TunableRange { name: String, value: u64 },
    /// Control request could not be decoded.
    #[error("invalid control request")]
    InvalidRequest,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Line of rule text the error was raised for, if any.
    pub fn line(&self) -> Option<usize> {
        match self {
            Error::Syntax { line, .. }
            | Error::Semantic { line, .. }
            | Error::ProtocolMismatch { line, .. }
            | Error::Mask { line, .. }
            | Error::Host { line, .. }
            | Error::PortSyntax { line, .. } => Some(*line),
            _ => None,
        }
    }
}

/// Failure of a single field encoder, before a line number is known.
#[non_exhaustive]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FieldError {
    #[error("bad mask `{0}`")]
    Mask(String),
    #[error("bad host `{0}`")]
    Host(String),
    #[error("bad port specification `{0}`")]
    PortSyntax(String),
    /// Anything else the encoder did not recognize.
    #[error("unexpected `{0}`")]
    Syntax(String),
}

impl FieldError {
    pub(crate) fn at(self, line: usize) -> Error {
        match self {
            FieldError::Mask(text) => Error::Mask { line, text },
            FieldError::Host(text) => Error::Host { line, text },
            FieldError::PortSyntax(text) => Error::PortSyntax { line, text },
            FieldError::Syntax(token) => Error::Syntax { line, token },
        }
    }
}
