use std::fmt;
use thiserror::Error;

/// Coarse classification every failure in the pipeline maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    FatalResponse,
    JsonStructure,
    Validation,
    ConfigurationFatal,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientNetwork => "transient network error",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::FatalResponse => "fatal response",
            ErrorKind::JsonStructure => "malformed model output",
            ErrorKind::Validation => "validation error",
            ErrorKind::ConfigurationFatal => "configuration error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// External service a call was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Text,
    Image,
    Speech,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Service::Text => "text generator",
            Service::Image => "image generator",
            Service::Speech => "speech synthesizer",
        };
        f.write_str(s)
    }
}

/// Pipeline stage, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PlotPoints,
    Story,
    Paging,
    Style,
    Page(usize),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::PlotPoints => f.write_str("plot points"),
            Stage::Story => f.write_str("story"),
            Stage::Paging => f.write_str("paging"),
            Stage::Style => f.write_str("style base"),
            Stage::Page(i) => write!(f, "page {}", i),
        }
    }
}

/// Failure of a call made through the resilient client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("{service} returned a fatal response after {attempts} attempt(s): {reason}\nrequest: {request}")]
    Fatal {
        service: Service,
        attempts: u32,
        reason: String,
        request: String,
    },

    #[error("{service} still failing after {attempts} attempt(s) ({last_kind}): {last_error}")]
    Exhausted {
        service: Service,
        attempts: u32,
        last_kind: ErrorKind,
        last_error: String,
    },

    #[error("{service} is unreachable: {reason}")]
    Unreachable { service: Service, reason: String },
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Fatal { .. } | ClientError::Unreachable { .. } => ErrorKind::FatalResponse,
            ClientError::Exhausted { last_kind, .. } => *last_kind,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ClientError::Fatal { attempts, .. } | ClientError::Exhausted { attempts, .. } => {
                *attempts
            }
            ClientError::Unreachable { .. } => 0,
        }
    }
}

/// Failure of a book-generation run (or of a single stage the user may retry).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid selection: {0}")]
    Validation(String),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: ClientError,
    },

    #[error("{stage} stage produced no usable output")]
    EmptyStageOutput { stage: Stage },

    #[error("could not parse paged story: {message}\n--- raw ---\n{raw}\n--- repaired ---\n{repaired}")]
    JsonStructure {
        raw: String,
        repaired: String,
        message: String,
    },

    #[error("run cancelled before {stage}")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Stage { source, .. } => source.kind(),
            PipelineError::EmptyStageOutput { .. } => ErrorKind::FatalResponse,
            PipelineError::JsonStructure { .. } => ErrorKind::JsonStructure,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Stage the failure belongs to; `None` for a rejected selection.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Validation(_) => None,
            PipelineError::Stage { stage, .. }
            | PipelineError::EmptyStageOutput { stage }
            | PipelineError::Cancelled { stage } => Some(*stage),
            PipelineError::JsonStructure { .. } => Some(Stage::Paging),
        }
    }
}

/// Missing or unusable process-wide configuration. Aborts startup.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigurationFatal
    }
}
