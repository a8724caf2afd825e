//! Resolution of a spec's `froms` into concrete base images.

use crate::error::Result;
use crate::oci::reference::ImageRef;
use crate::remote_cache::RemoteRegistry;
use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Built earlier in the same graph; only ever referenced by local tag
    Local,
    /// Must be pulled from `reference` and tagged with the logical name
    Remote,
    /// Already in the local store under its logical name
    Present,
}

/// A base image resolved to something the build can use and the identity
/// that goes into the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// As written in `froms`
    pub name: String,
    /// Pull reference, or the local tag for graph images
    pub reference: String,
    pub identity: String,
    pub kind: SourceKind,
}

impl ImageSource {
    /// A `@name` from: the dependency's local tag, identified by its cache
    /// digest.
    pub fn local(name: &str, tag: &str, digest: &str) -> Self {
        Self {
            name: name.to_string(),
            reference: tag.to_string(),
            identity: digest.to_string(),
            kind: SourceKind::Local,
        }
    }

    /// Resolve a registry image without pulling anything: a pinned digest,
    /// then the registry's manifest digest, then the local store. `None`
    /// means the identity cannot be known without a pull.
    pub async fn resolve_remote(
        from: &str,
        runtime: &dyn ContainerRuntime,
        registry: Option<&dyn RemoteRegistry>,
    ) -> Result<Option<Self>> {
        let reference = ImageRef::parse(from)?;

        if let Some(digest) = &reference.digest {
            return Ok(Some(Self {
                name: from.to_string(),
                reference: from.to_string(),
                identity: digest.clone(),
                kind: SourceKind::Remote,
            }));
        }

        if let Some(registry) = registry {
            match registry.manifest_digest(&reference).await {
                Ok(Some(digest)) => {
                    let pinned = ImageRef {
                        digest: Some(digest.clone()),
                        ..reference.clone()
                    };
                    return Ok(Some(Self {
                        name: from.to_string(),
                        reference: pinned.to_string(),
                        identity: digest,
                        kind: SourceKind::Remote,
                    }));
                }
                Ok(None) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(from, error = %e, "registry lookup failed, using local store")
                }
            }
        }

        Ok(runtime.inspect_image(from).await?.map(|info| Self {
            name: from.to_string(),
            reference: from.to_string(),
            identity: info.id,
            kind: SourceKind::Present,
        }))
    }

    /// Like [`resolve_remote`](Self::resolve_remote), pulling the image when
    /// nothing else identifies it.
    pub async fn resolve_or_pull(
        from: &str,
        runtime: &dyn ContainerRuntime,
        registry: Option<&dyn RemoteRegistry>,
    ) -> Result<Self> {
        if let Some(source) = Self::resolve_remote(from, runtime, registry).await? {
            return Ok(source);
        }

        tracing::info!(from, "Pulling base image to identify it");
        runtime.pull(from, from).await?;
        let info = runtime
            .inspect_image(from)
            .await?
            .ok_or_else(|| crate::error::ForgeError::MissingImage(from.to_string()))?;
        Ok(Self {
            name: from.to_string(),
            reference: from.to_string(),
            identity: info.id,
            kind: SourceKind::Present,
        })
    }

    /// Make the image available locally under its logical name. Local and
    /// present images are left alone.
    pub async fn ensure_local(&self, runtime: &dyn ContainerRuntime) -> Result<bool> {
        match self.kind {
            SourceKind::Remote => {
                runtime.pull(&self.reference, &self.name).await?;
                Ok(true)
            }
            SourceKind::Local | SourceKind::Present => Ok(false),
        }
    }
}
