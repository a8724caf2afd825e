//! Structured logging and build counters.

use crate::constants::SHORT_DIGEST_LEN;
use std::io;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Install the global subscriber. JSON output also records span closes,
/// which carry per-spec timing.
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("imageforge=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(false)
                    .with_span_events(FmtSpan::NONE),
            )
            .try_init()?;
    }

    Ok(())
}

/// First characters of a digest, for log lines.
pub fn short_digest(digest: &str) -> &str {
    let digest = digest.strip_prefix("sha256:").unwrap_or(digest);
    digest.get(..SHORT_DIGEST_LEN).unwrap_or(digest)
}

/// Counters for one `Forge`, across every spec it has processed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildMetrics {
    pub specs: u64,
    pub builds: u64,
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub pulls: u64,
    pub artifacts: u64,
    pub total_duration_ms: u64,
}

impl BuildMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_hits(&self) -> u64 {
        self.local_hits + self.remote_hits
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits() + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits() as f64) / (total as f64)
        }
    }

    pub fn average_spec_time_ms(&self) -> f64 {
        if self.specs == 0 {
            0.0
        } else {
            (self.total_duration_ms as f64) / (self.specs as f64)
        }
    }
}

#[macro_export]
macro_rules! log_cache_hit {
    ($spec:expr, $digest:expr, $source:expr) => {
        tracing::info!(
            spec = %$spec,
            digest = %$crate::logging::short_digest(&$digest),
            source = $source,
            "Cache hit"
        );
    };
}

#[macro_export]
macro_rules! log_cache_miss {
    ($spec:expr, $digest:expr) => {
        tracing::info!(
            spec = %$spec,
            digest = %$crate::logging::short_digest(&$digest),
            "Cache miss"
        );
    };
}

#[macro_export]
macro_rules! log_build_start {
    ($spec:expr, $runtime:expr) => {
        tracing::info!(spec = %$spec, runtime = %$runtime, "Build started");
    };
}

#[macro_export]
macro_rules! log_build_complete {
    ($spec:expr, $duration_ms:expr) => {
        tracing::info!(spec = %$spec, duration_ms = $duration_ms, "Build completed");
    };
}

#[macro_export]
macro_rules! log_remote_operation {
    ($operation:expr, $reference:expr, $status:expr, $duration_ms:expr) => {
        tracing::debug!(
            operation = $operation,
            reference = %$reference,
            status = $status,
            duration_ms = $duration_ms,
            "Remote operation completed"
        );
    };
}

/// Per-spec lifecycle events
#[derive(Debug, Clone)]
pub enum TraceEvent {
    GraphLoaded { root: String, specs: usize },
    SpecStarted { spec: String },
    BasePulled { reference: String },
    ImageBuilt { spec: String, duration_ms: u64 },
    ArtifactsExtracted { spec: String, files: usize },
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GraphLoaded { root, specs } => {
                write!(f, "Loaded graph for {} ({} specs)", root, specs)
            }
            Self::SpecStarted { spec } => write!(f, "Processing {}", spec),
            Self::BasePulled { reference } => write!(f, "Pulled {}", reference),
            Self::ImageBuilt { spec, duration_ms } => {
                write!(f, "Built {} in {}ms", spec, duration_ms)
            }
            Self::ArtifactsExtracted { spec, files } => {
                write!(f, "Extracted {} artifact files from {}", files, spec)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_rate_counts_both_sources() {
        let mut metrics = BuildMetrics::new();
        metrics.local_hits = 2;
        metrics.remote_hits = 1;
        metrics.misses = 1;

        assert!((metrics.cache_hit_rate() - 0.75).abs() < 0.01);
    }

    #[test]
    fn test_zero_metrics() {
        let metrics = BuildMetrics::new();
        assert_eq!(metrics.cache_hit_rate(), 0.0);
        assert_eq!(metrics.average_spec_time_ms(), 0.0);
    }

    #[test]
    fn test_init_logging_installs_once() {
        let _ = init_logging(false);
        assert!(init_logging(true).is_err());
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(short_digest("sha256:0123456789abcdef"), "0123456789ab");
        assert_eq!(short_digest("abc"), "abc");
    }

    #[test]
    fn test_trace_event_display() {
        let event = TraceEvent::ImageBuilt {
            spec: "api".to_string(),
            duration_ms: 42,
        };
        assert_eq!(event.to_string(), "Built api in 42ms");

        let event = TraceEvent::GraphLoaded {
            root: "api".to_string(),
            specs: 3,
        };
        assert!(event.to_string().contains("3 specs"));
    }
}
