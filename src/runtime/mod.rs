//! Container runtimes. Docker and Podman share the subprocess plumbing in
//! [`cli`] and differ only in flags and forwarded environment.

pub mod cli;
pub mod docker;
pub mod podman;

pub use cli::CliRuntime;
pub use docker::DockerRuntime;
pub use podman::PodmanRuntime;

use crate::config::RuntimeKind;
use crate::context::ContextSnapshot;
use crate::core::BuildInputCore;
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

/// The parts of `image inspect` output the engine uses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoDigests", default)]
    pub repo_digests: Vec<String>,
}

/// Everything about a build that is not part of the cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildHints {
    /// Every tag the built image receives, cache tag first
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl BuildHints {
    /// The same labels under the single tag `tag`.
    pub fn retagged(&self, tag: &str) -> Self {
        Self {
            tags: vec![tag.to_string()],
            labels: self.labels.clone(),
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Pull `src` and tag it `as_tag`.
    async fn pull(&self, src: &str, as_tag: &str) -> Result<()>;

    async fn tag(&self, src: &str, as_tag: &str) -> Result<()>;

    /// `Ok(None)` when the image is not in the local store.
    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>>;

    /// Build from `input`, streamed to the builder as a tar on stdin. The
    /// image receives `hints.tags` only if the whole build succeeded.
    async fn build(
        &self,
        input: &ContextSnapshot,
        core: &BuildInputCore,
        hints: &BuildHints,
    ) -> Result<()>;

    async fn push(&self, tag: &str) -> Result<()>;

    /// Run `script` with `sh` inside `image`, with `mount` bound read-write
    /// at the artifacts mount point.
    async fn run_script(&self, image: &str, mount: &Path, script: &str) -> Result<()>;
}

/// Cooperative cancellation shared between a `Forge` and its runtime.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // the sender lives as long as `self`, so this only ends on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The runtime selected by `kind`, forwarding allow-listed variables from
/// `lookup` to every subprocess.
pub fn runtime_for(
    kind: RuntimeKind,
    lookup: &dyn Fn(&str) -> Option<String>,
    cancel: CancelSignal,
) -> Arc<dyn ContainerRuntime> {
    match kind {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new(lookup, cancel)),
        RuntimeKind::Podman => Arc::new(PodmanRuntime::new(lookup, cancel)),
    }
}
