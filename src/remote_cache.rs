use crate::error::Result;
use crate::oci::reference::ImageRef;
use async_trait::async_trait;

/// A raw manifest as stored by a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub media_type: String,
    pub body: Vec<u8>,
    /// `sha256:<hex>` of `body`
    pub digest: String,
}

impl Manifest {
    pub fn new(media_type: impl Into<String>, body: Vec<u8>) -> Self {
        let digest = format!("sha256:{}", crate::hasher::sha256_bytes(&body));
        Self {
            media_type: media_type.into(),
            body,
            digest,
        }
    }
}

/// Metadata-only access to a registry: nothing here moves blobs.
#[async_trait]
pub trait RemoteRegistry: Send + Sync {
    /// Manifest digest for `reference`, or `None` when the registry does not
    /// know it.
    async fn manifest_digest(&self, reference: &ImageRef) -> Result<Option<String>>;

    async fn fetch_manifest(&self, reference: &ImageRef) -> Result<Option<Manifest>>;

    async fn put_manifest(&self, reference: &ImageRef, manifest: &Manifest) -> Result<()>;

    /// Point `dst` at the manifest behind `src`. Returns `false` when `src`
    /// does not exist. Blobs are only shared when both live in the same
    /// repository or the registry mounts them itself.
    async fn retag(&self, src: &ImageRef, dst: &ImageRef) -> Result<bool> {
        match self.fetch_manifest(src).await? {
            Some(manifest) => {
                self.put_manifest(dst, &manifest).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
