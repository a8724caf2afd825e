//! Graph-level orchestration: plan, cache-check, build and extract each spec
//! in dependency order.

use crate::artifacts::{ExtractedArtifact, ExtractionPlan};
use crate::cache::{CacheHit, CacheResolver};
use crate::config::ForgeConfig;
use crate::constants::ARTIFACTS_MOUNT;
use crate::context::{BuildContext, ContextSnapshot};
use crate::core::{cache_tag_for, resolve_build_args, BuildInputCore};
use crate::envfile::EnvLookup;
use crate::error::{ForgeError, Result};
use crate::graph::{build_dep_graph, DepGraph};
use crate::logging::{BuildMetrics, TraceEvent};
use crate::oci::source::ImageSource;
use crate::oci::HttpRegistry;
use crate::remote_cache::RemoteRegistry;
use crate::runtime::{runtime_for, BuildHints, CancelSignal, ContainerRuntime};
use crate::spec::{self, ResolvedSpec};
use crate::{log_build_complete, log_build_start, log_cache_hit, log_cache_miss};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecOutcome {
    LocalHit,
    RemoteHit,
    Built,
}

impl From<CacheHit> for SpecOutcome {
    fn from(hit: CacheHit) -> Self {
        match hit {
            CacheHit::Local => SpecOutcome::LocalHit,
            CacheHit::Remote => SpecOutcome::RemoteHit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecReport {
    pub name: String,
    pub digest: String,
    pub cache_tag: String,
    pub outcome: SpecOutcome,
    pub artifacts: Vec<ExtractedArtifact>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub root: String,
    /// In build order
    pub specs: Vec<SpecReport>,
}

impl BuildReport {
    pub fn get(&self, name: &str) -> Option<&SpecReport> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn root_report(&self) -> Option<&SpecReport> {
        self.get(&self.root)
    }

    pub fn built(&self) -> impl Iterator<Item = &SpecReport> {
        self.specs.iter().filter(|s| s.outcome == SpecOutcome::Built)
    }
}

/// Everything computed for a spec before the cache is consulted.
struct SpecPlan {
    snapshot: ContextSnapshot,
    sources: Vec<ImageSource>,
    core: BuildInputCore,
    digest: String,
    cache_tag: String,
}

pub struct Forge {
    config: ForgeConfig,
    lookup: EnvLookup,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Option<Arc<dyn RemoteRegistry>>,
    cancel: CancelSignal,
    metrics: Mutex<BuildMetrics>,
}

impl Forge {
    /// The runtime named by the config, talking to the host's engine, and an
    /// HTTP registry client when remote caching is on.
    pub fn new(config: ForgeConfig) -> Result<Self> {
        config.validate()?;
        let lookup = EnvLookup::from_process(config.env_file.as_deref())?;
        let cancel = CancelSignal::new();
        let runtime = runtime_for(config.runtime, &lookup.as_fn(), cancel.clone());
        let registry: Option<Arc<dyn RemoteRegistry>> = if config.remote_cache {
            Some(Arc::new(HttpRegistry::from_lookup(&lookup.as_fn())?))
        } else {
            None
        };

        Ok(Self {
            config,
            lookup,
            runtime,
            registry,
            cancel,
            metrics: Mutex::new(BuildMetrics::new()),
        })
    }

    /// A forge around an injected runtime and an explicit lookup, with no
    /// registry until [`with_registry`](Self::with_registry).
    pub fn with_runtime(
        config: ForgeConfig,
        lookup: EnvLookup,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            lookup,
            runtime,
            registry: None,
            cancel: CancelSignal::new(),
            metrics: Mutex::new(BuildMetrics::new()),
        })
    }

    pub fn with_registry(mut self, registry: Arc<dyn RemoteRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Share `cancel` with whoever will call [`CancelSignal::cancel`].
    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn metrics(&self) -> BuildMetrics {
        self.metrics.lock().clone()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ForgeError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn resolver(&self) -> CacheResolver<'_> {
        CacheResolver::new(&self.config, self.runtime.as_ref(), self.registry.as_deref())
    }

    /// Build the spec at `spec_path` and everything it depends on. The first
    /// failing spec aborts the rest of the graph.
    pub async fn build(&self, spec_path: &Path) -> Result<BuildReport> {
        let graph = build_dep_graph(spec_path, &self.lookup.as_fn())?;
        tracing::info!(
            "{}",
            TraceEvent::GraphLoaded {
                root: graph.root.clone(),
                specs: graph.specs.len(),
            }
        );

        let resolver = self.resolver();
        let mut digests = BTreeMap::new();
        let mut report = BuildReport {
            root: graph.root.clone(),
            specs: Vec::with_capacity(graph.order.len()),
        };

        for spec in graph.ordered() {
            self.check_cancelled()?;
            let span = tracing::info_span!(
                "spec",
                spec = %spec.name(),
                build_id = self.config.build_id.as_deref().unwrap_or("")
            );
            let spec_report = self
                .build_spec(&graph, spec, &resolver, &digests)
                .instrument(span)
                .await?;
            digests.insert(spec.name().to_string(), spec_report.digest.clone());
            report.specs.push(spec_report);
        }

        Ok(report)
    }

    async fn build_spec(
        &self,
        graph: &DepGraph,
        spec: &ResolvedSpec,
        resolver: &CacheResolver<'_>,
        digests: &BTreeMap<String, String>,
    ) -> Result<SpecReport> {
        let name = spec.name();
        let started = Instant::now();
        tracing::info!("{}", TraceEvent::SpecStarted { spec: name.to_string() });

        let plan = self
            .plan(spec, digests, true)
            .await?
            .ok_or_else(|| ForgeError::Other(anyhow::anyhow!("base images unresolved")))
            .map_err(|e| e.in_spec(name, "resolve-froms"))?;

        let need_local =
            !graph.dependents_of(name).is_empty() || !spec.spec.artifacts.is_empty();
        let hit = resolver
            .resolve(spec, &plan.cache_tag, need_local)
            .await
            .map_err(|e| e.in_spec(name, "cache"))?;

        let outcome = match hit {
            Some(hit) => {
                let remote = hit == CacheHit::Remote;
                let source = if remote { "remote" } else { "local" };
                log_cache_hit!(name, plan.digest, source);
                let mut metrics = self.metrics.lock();
                if remote {
                    metrics.remote_hits += 1;
                } else {
                    metrics.local_hits += 1;
                }
                SpecOutcome::from(hit)
            }
            None => {
                log_cache_miss!(name, plan.digest);
                self.metrics.lock().misses += 1;
                self.run_build(spec, &plan)
                    .await
                    .map_err(|e| e.in_spec(name, "build"))?;
                if resolver
                    .store(&plan.cache_tag)
                    .await
                    .map_err(|e| e.in_spec(name, "push"))?
                {
                    tracing::info!(spec = %name, tag = %plan.cache_tag, "Pushed cache tag");
                }
                SpecOutcome::Built
            }
        };

        self.check_cancelled()?;
        let artifacts = self
            .extract(spec)
            .await
            .map_err(|e| e.in_spec(name, "extract"))?;

        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut metrics = self.metrics.lock();
            metrics.specs += 1;
            metrics.total_duration_ms += duration_ms;
            metrics.artifacts += artifacts.iter().map(|a| a.matched.len() as u64).sum::<u64>();
        }

        Ok(SpecReport {
            name: name.to_string(),
            digest: plan.digest,
            cache_tag: plan.cache_tag,
            outcome,
            artifacts,
            duration_ms,
        })
    }

    /// Compute a spec's context, base-image identities and cache key.
    /// With `allow_pull` unset nothing is pulled, and `None` means some base
    /// image could not be identified.
    async fn plan(
        &self,
        spec: &ResolvedSpec,
        digests: &BTreeMap<String, String>,
        allow_pull: bool,
    ) -> Result<Option<SpecPlan>> {
        let name = spec.name();
        let snapshot = BuildContext::from_spec(spec)
            .and_then(ContextSnapshot::new)
            .map_err(|e| e.in_spec(name, "context"))?;

        let mut sources = Vec::with_capacity(spec.spec.froms.len());
        let mut froms = BTreeMap::new();
        for from in &spec.spec.froms {
            let source = match self.resolve_from(name, from, digests, allow_pull).await {
                Ok(Some(source)) => source,
                Ok(None) => return Ok(None),
                Err(e) => return Err(e.in_spec(name, "resolve-froms")),
            };
            froms.insert(from.clone(), source.identity.clone());
            sources.push(source);
        }

        let core = BuildInputCore {
            dockerfile: spec.spec.dockerfile_name().to_string(),
            froms,
            context: snapshot.digest().to_string(),
            build_args: resolve_build_args(&spec.spec.build_args, &self.lookup.as_fn()),
            epoch: self.config.cache_epoch.clone(),
        };
        let digest = core.digest().map_err(|e| e.in_spec(name, "digest"))?;
        let cache_tag = cache_tag_for(&self.config.work_repo, &digest);
        tracing::debug!(spec = %name, digest = %digest, context = %core.context, "Computed cache key");

        Ok(Some(SpecPlan {
            snapshot,
            sources,
            core,
            digest,
            cache_tag,
        }))
    }

    async fn resolve_from(
        &self,
        spec_name: &str,
        from: &str,
        digests: &BTreeMap<String, String>,
        allow_pull: bool,
    ) -> Result<Option<ImageSource>> {
        if let Some(dep) = from.strip_prefix('@') {
            let digest = digests
                .get(dep)
                .ok_or_else(|| ForgeError::DanglingLocalFrom {
                    spec: spec_name.to_string(),
                    reference: dep.to_string(),
                })?;
            return Ok(Some(ImageSource::local(
                from,
                &self.config.local_tag(dep),
                digest,
            )));
        }

        let runtime = self.runtime.as_ref();
        let registry = self.registry.as_deref();
        if allow_pull {
            ImageSource::resolve_or_pull(from, runtime, registry)
                .await
                .map(Some)
        } else {
            ImageSource::resolve_remote(from, runtime, registry).await
        }
    }

    async fn run_build(&self, spec: &ResolvedSpec, plan: &SpecPlan) -> Result<()> {
        let name = spec.name();

        for source in &plan.sources {
            self.check_cancelled()?;
            if source.ensure_local(self.runtime.as_ref()).await? {
                self.metrics.lock().pulls += 1;
                tracing::info!(
                    "{}",
                    TraceEvent::BasePulled {
                        reference: source.reference.clone(),
                    }
                );
            }
        }

        let mut tags = vec![plan.cache_tag.clone(), self.config.local_tag(name)];
        for tag in &spec.spec.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        let mut labels = BTreeMap::from([
            ("imageforge.spec".to_string(), name.to_string()),
            ("imageforge.digest".to_string(), plan.digest.clone()),
        ]);
        if let Some(build_id) = &self.config.build_id {
            labels.insert("imageforge.build-id".to_string(), build_id.clone());
        }
        let hints = BuildHints { tags, labels };

        log_build_start!(name, self.runtime.kind());
        let started = Instant::now();
        self.check_cancelled()?;
        self.runtime.build(&plan.snapshot, &plan.core, &hints).await?;
        let duration_ms = started.elapsed().as_millis() as u64;
        log_build_complete!(name, duration_ms);
        self.metrics.lock().builds += 1;
        tracing::debug!(
            "{}",
            TraceEvent::ImageBuilt {
                spec: name.to_string(),
                duration_ms,
            }
        );
        Ok(())
    }

    /// Copy the spec's artifacts out of its local image into the artifacts
    /// root.
    async fn extract(&self, spec: &ResolvedSpec) -> Result<Vec<ExtractedArtifact>> {
        if spec.spec.artifacts.is_empty() {
            return Ok(Vec::new());
        }

        let root = self.config.artifacts_root();
        std::fs::create_dir_all(&root)?;
        let root = spec::absolute(&root)?;

        let plan = ExtractionPlan::new(&spec.spec.artifacts, &root)?;
        plan.clear_previous()?;
        let script = plan.script(ARTIFACTS_MOUNT);
        let image = self.config.local_tag(spec.name());
        tracing::debug!(spec = %spec.name(), image = %image, root = %root.display(), "Extracting artifacts");
        self.runtime.run_script(&image, &root, &script).await?;

        let extracted = plan.verify()?;
        tracing::info!(
            "{}",
            TraceEvent::ArtifactsExtracted {
                spec: spec.name().to_string(),
                files: extracted.iter().map(|a| a.matched.len()).sum(),
            }
        );
        Ok(extracted)
    }

    /// Whether building `spec_path` would be a cache hit for its root spec.
    /// Computes the same keys as [`build`](Self::build) but pulls nothing and
    /// changes no tags; a base image that cannot be identified without a
    /// pull counts as a miss.
    pub async fn predict_cache_hit(&self, spec_path: &Path) -> Result<bool> {
        let graph = build_dep_graph(spec_path, &self.lookup.as_fn())?;
        let resolver = self.resolver();
        let mut digests = BTreeMap::new();

        for spec in graph.ordered() {
            self.check_cancelled()?;
            let Some(plan) = self.plan(spec, &digests, false).await? else {
                tracing::info!(spec = %spec.name(), "Base image unknown without a pull, predicting miss");
                return Ok(false);
            };

            if spec.name() == graph.root {
                let hit = resolver
                    .probe(spec, &plan.cache_tag)
                    .await
                    .map_err(|e| e.in_spec(spec.name(), "cache"))?;
                tracing::info!(spec = %spec.name(), hit = hit.is_some(), "Predicted cache result");
                return Ok(hit.is_some());
            }
            digests.insert(spec.name().to_string(), plan.digest);
        }

        Ok(false)
    }
}
