//! Error kinds surfaced by the reconciliation core.
//!
//! Every failure is returned to the immediate caller unmodified. "No existing
//! resource" is not an error anywhere except [`Error::NotFound`] from a direct
//! `get_resource` call.

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A requested object does not exist.
    #[error("{kind} {name} not found{}", in_namespace(.namespace))]
    NotFound { kind: String, namespace: Option<String>, name: String },

    /// Missing, empty, non-numeric or non-positive generation annotation.
    #[error("invalid generation on {resource}: {reason}")]
    InvalidGeneration { resource: String, reason: String },

    /// A payload or an embedded entry is not the expected object shape.
    #[error("cannot parse {context}{}: {message}", at_index(.index))]
    StructuralParse { context: String, index: Option<usize>, message: String },

    /// The backend call itself failed.
    #[error("transport failure: {0}")]
    Transport(#[source] BoxError),

    /// Request context was cancelled or its deadline expired.
    #[error("operation cancelled")]
    Cancelled,

    /// The selected transport needs routing data the caller did not supply.
    #[error("missing routing: {0}")]
    MissingRouting(String),
}

fn in_namespace(ns: &Option<String>) -> String {
    match ns.as_deref() {
        Some(n) if !n.is_empty() => format!(" in namespace {}", n),
        _ => String::new(),
    }
}

fn at_index(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" at index {}", i),
        None => String::new(),
    }
}

impl Error {
    pub fn not_found(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self::NotFound { kind: kind.into(), namespace: namespace.map(str::to_string), name: name.into() }
    }

    pub fn invalid_generation(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidGeneration { resource: resource.into(), reason: reason.into() }
    }

    pub fn structural(context: impl Into<String>, index: Option<usize>, message: impl ToString) -> Self {
        Self::StructuralParse { context: context.into(), index, message: message.to_string() }
    }

    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Hint for callers layering backoff around a whole reconcile: only backend
    /// failures may succeed on a later attempt with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Self::Transport(Box::new(e))
    }
}
