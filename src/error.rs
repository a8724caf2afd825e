//! Error types and retry helpers.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ForgeError>;

/// Main error type for imageforge operations
#[derive(Debug, Error)]
pub enum ForgeError {
    /// Malformed spec YAML or unknown fields
    #[error("{}: invalid spec{}: {message}", .path.display(), line_suffix(.line, .column))]
    SpecParse {
        path: PathBuf,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },
    /// Spec parsed but failed a semantic check
    #[error("{}: {reason}", .path.display())]
    InvalidSpec { path: PathBuf, reason: String },
    /// Variables still unresolved after expansion
    #[error("{}: unresolved variables: {}", .path.display(), .names.join(", "))]
    UnresolvedVariables { path: PathBuf, names: Vec<String> },
    /// A `deps` entry pointing at a file that does not exist
    #[error("{}: dependency file {} not found", .spec.display(), .dep.display())]
    MissingDependency { spec: PathBuf, dep: PathBuf },
    /// A `@name` from with no matching spec in the graph
    #[error("spec '{spec}' references '@{reference}' but no loaded dependency is named '{reference}'")]
    DanglingLocalFrom { spec: String, reference: String },
    /// Two distinct spec files resolved to the same name
    #[error("spec name '{name}' is defined by both {} and {}", .first.display(), .second.display())]
    NameCollision {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("dependency cycle between specs: {}", .names.join(", "))]
    DependencyCycle { names: Vec<String> },
    #[error("{}:{line}: {reason}", .path.display())]
    EnvFile {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("variable '{0}' is not set")]
    MissingVariable(String),
    /// A path that would leave its permitted root
    #[error("path '{path}' escapes {}", .root.display())]
    PathEscape { path: String, root: PathBuf },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid image reference '{reference}': {reason}")]
    ImageReference { reference: String, reason: String },
    #[error("registry error in {operation} (retryable: {retryable}): {reason}")]
    Registry {
        operation: String,
        reason: String,
        retryable: bool,
    },
    /// Non-zero exit from a runtime subprocess
    #[error("`{command}` failed with {}", exit_description(.code))]
    Process { command: String, code: Option<i32> },
    #[error("image '{0}' not found")]
    MissingImage(String),
    #[error("artifact extraction failed: {0}")]
    Extraction(String),
    #[error("build cancelled")]
    Cancelled,
    /// Failure localized to one spec and operation
    #[error("spec '{spec}' ({operation}): {source}")]
    InSpec {
        spec: String,
        operation: &'static str,
        #[source]
        source: Box<ForgeError>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Anything else, with context attached through anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn line_suffix(line: &Option<usize>, column: &Option<usize>) -> String {
    match (*line, *column) {
        (Some(l), Some(c)) => format!(" at line {}, column {}", l, c),
        (Some(l), None) => format!(" at line {}", l),
        _ => String::new(),
    }
}

fn exit_description(code: &Option<i32>) -> String {
    match *code {
        Some(c) => format!("exit code {}", c),
        None => "termination by signal".to_string(),
    }
}

impl ForgeError {
    /// Attach the spec name and the operation that failed.
    pub fn in_spec(self, spec: &str, operation: &'static str) -> Self {
        match self {
            // cancellation stays recognizable at the top level
            Self::Cancelled => Self::Cancelled,
            other => Self::InSpec {
                spec: spec.to_string(),
                operation,
                source: Box::new(other),
            },
        }
    }

    pub fn registry(operation: &str, reason: impl ToString, retryable: bool) -> Self {
        Self::Registry {
            operation: operation.to_string(),
            reason: reason.to_string(),
            retryable,
        }
    }

    /// The innermost error, skipping `InSpec` wrappers.
    pub fn root_cause(&self) -> &ForgeError {
        match self {
            Self::InSpec { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled)
    }
}

/// Whether a request that failed with `err` may succeed on retry.
pub fn is_retryable(err: &ForgeError) -> bool {
    match err.root_cause() {
        ForgeError::Registry { retryable, .. } => *retryable,
        ForgeError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::Interrupted
        ),
        _ => false,
    }
}

/// Retry configuration for registry requests
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::constants::DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_backoff_ms: crate::constants::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: crate::constants::DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: 2.0,
        }
    }
}

/// Delay before retry `attempt`: exponential, capped at the maximum, with
/// ±20% jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // ±20% jitter, clamped to max
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    ((backoff as f64) + jitter)
        .max(0.0)
        .min(config.max_backoff_ms as f64) as u64
}
