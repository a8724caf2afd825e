pub mod artifacts;
pub mod cache;
pub mod config;
pub mod constants;
pub mod context;
pub mod core;
pub mod envfile;
pub mod error;
pub mod forge;
pub mod graph;
pub mod hasher;
pub mod logging;
pub mod oci;
pub mod paths;
pub mod remote_cache;
pub mod runtime;
pub mod spec;
pub mod vars;

pub use config::{ForgeConfig, RuntimeKind};
pub use error::{ForgeError, Result};
pub use forge::{BuildReport, Forge, SpecOutcome, SpecReport};
pub use graph::{build_dep_graph, DepGraph};
pub use spec::{ResolvedSpec, Spec};

use std::path::Path;

/// Build the spec at `spec_path` and its dependencies with the host's
/// container runtime.
pub async fn build(spec_path: &Path, config: &ForgeConfig) -> Result<BuildReport> {
    Forge::new(config.clone())?.build(spec_path).await
}

/// Whether [`build`] would find the root spec's image already cached.
pub async fn predict_cache_hit(spec_path: &Path, config: &ForgeConfig) -> Result<bool> {
    Forge::new(config.clone())?
        .predict_cache_hit(spec_path)
        .await
}
