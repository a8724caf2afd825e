//! Cache-hit resolution against the local image store and a remote registry.

use crate::config::ForgeConfig;
use crate::error::Result;
use crate::oci::reference::ImageRef;
use crate::remote_cache::RemoteRegistry;
use crate::runtime::ContainerRuntime;
use crate::spec::ResolvedSpec;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheHit {
    Local,
    Remote,
}

pub struct CacheResolver<'a> {
    config: &'a ForgeConfig,
    runtime: &'a dyn ContainerRuntime,
    registry: Option<&'a dyn RemoteRegistry>,
}

impl<'a> CacheResolver<'a> {
    pub fn new(
        config: &'a ForgeConfig,
        runtime: &'a dyn ContainerRuntime,
        registry: Option<&'a dyn RemoteRegistry>,
    ) -> Self {
        Self {
            config,
            runtime,
            registry,
        }
    }

    fn remote(&self) -> Option<&'a dyn RemoteRegistry> {
        self.registry.filter(|_| self.config.remote_cache)
    }

    fn enabled_for(&self, spec: &ResolvedSpec) -> bool {
        !spec.spec.disable_caching && !self.config.rebuild
    }

    /// Look for `cache_tag` without changing any tag. A failed remote lookup
    /// is a miss; a failed local inspect is not.
    pub async fn probe(&self, spec: &ResolvedSpec, cache_tag: &str) -> Result<Option<CacheHit>> {
        if !self.enabled_for(spec) {
            return Ok(None);
        }

        if self.config.local_cache && self.runtime.inspect_image(cache_tag).await?.is_some() {
            return Ok(Some(CacheHit::Local));
        }

        if let Some(registry) = self.remote() {
            let reference = ImageRef::parse(cache_tag)?;
            match registry.manifest_digest(&reference).await {
                Ok(Some(_)) => return Ok(Some(CacheHit::Remote)),
                Ok(None) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(spec = %spec.name(), tag = cache_tag, error = %e, "remote cache lookup failed, treating as miss");
                }
            }
        }

        Ok(None)
    }

    /// Probe and, on a hit, point the spec's outputs at the cached image.
    /// `need_local` pulls a remote hit into the local store, for specs that
    /// later steps build from or extract artifacts out of.
    pub async fn resolve(
        &self,
        spec: &ResolvedSpec,
        cache_tag: &str,
        need_local: bool,
    ) -> Result<Option<CacheHit>> {
        let hit = self.probe(spec, cache_tag).await?;
        let local_tag = self.config.local_tag(spec.name());

        match hit {
            Some(CacheHit::Local) => {
                self.runtime.tag(cache_tag, &local_tag).await?;
                for tag in &spec.spec.tags {
                    self.runtime.tag(cache_tag, tag).await?;
                }
            }
            Some(CacheHit::Remote) => {
                if let Some(registry) = self.remote() {
                    let source = ImageRef::parse(cache_tag)?;
                    for tag in &spec.spec.tags {
                        let target = ImageRef::parse(tag)?;
                        if !registry.retag(&source, &target).await? {
                            return Err(crate::error::ForgeError::MissingImage(
                                cache_tag.to_string(),
                            ));
                        }
                    }
                }
                if need_local {
                    self.runtime.pull(cache_tag, &local_tag).await?;
                }
            }
            None => {}
        }

        Ok(hit)
    }

    /// Publish a freshly built cache tag. Returns whether anything was pushed.
    pub async fn store(&self, cache_tag: &str) -> Result<bool> {
        if !self.config.remote_cache || self.config.read_only_cache {
            return Ok(false);
        }
        self.runtime.push(cache_tag).await?;
        Ok(true)
    }
}
