//! In-memory runtime and registry doubles shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use imageforge::config::{ForgeConfig, RuntimeKind};
use imageforge::constants::ARTIFACTS_MOUNT;
use imageforge::context::ContextSnapshot;
use imageforge::core::BuildInputCore;
use imageforge::envfile::EnvLookup;
use imageforge::error::{ForgeError, Result};
use imageforge::oci::ImageRef;
use imageforge::remote_cache::{Manifest, RemoteRegistry};
use imageforge::runtime::{BuildHints, CancelSignal, ContainerRuntime, ImageInfo};
use imageforge::Forge;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WORK_REPO: &str = "localhost:5000/forge-cache";
const MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Pull { src: String, as_tag: String },
    Tag { src: String, as_tag: String },
    Build {
        tags: Vec<String>,
        labels: BTreeMap<String, String>,
        froms: BTreeMap<String, String>,
        build_args: BTreeMap<String, String>,
        files: Vec<String>,
    },
    Push(String),
    RunScript { image: String, script: String },
}

/// A container engine with an in-memory image store. Every state-changing
/// call is recorded.
#[derive(Default)]
pub struct FakeRuntime {
    images: Mutex<BTreeMap<String, String>>,
    calls: Mutex<Vec<Call>>,
    registry: Option<Arc<FakeRegistry>>,
    failing_tag: Option<String>,
    block_until: Option<CancelSignal>,
    image_root: Option<PathBuf>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the local store.
    pub fn with_image(self, tag: &str, id: &str) -> Self {
        self.images.lock().insert(tag.to_string(), id.to_string());
        self
    }

    /// Pushes land in `registry`.
    pub fn with_registry(mut self, registry: Arc<FakeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Any build that would produce `tag` exits non-zero.
    pub fn failing_build(mut self, tag: &str) -> Self {
        self.failing_tag = Some(tag.to_string());
        self
    }

    /// Builds hang until `cancel` fires.
    pub fn blocking_until(mut self, cancel: CancelSignal) -> Self {
        self.block_until = Some(cancel);
        self
    }

    /// Extraction scripts run on the host with absolute in-container paths
    /// rooted at `root`.
    pub fn with_image_root(mut self, root: &Path) -> Self {
        self.image_root = Some(root.to_path_buf());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn builds(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Build { .. }))
            .collect()
    }

    /// Local tags of the specs built, in order.
    pub fn built_tags(&self) -> Vec<String> {
        self.builds()
            .into_iter()
            .filter_map(|c| match c {
                Call::Build { tags, .. } => tags.get(1).cloned(),
                _ => None,
            })
            .collect()
    }

    pub fn pulls(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Pull { src, as_tag } => Some((src, as_tag)),
                _ => None,
            })
            .collect()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Push(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn image_id(&self, tag: &str) -> Option<String> {
        self.images.lock().get(tag).cloned()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn pull(&self, src: &str, as_tag: &str) -> Result<()> {
        self.record(Call::Pull {
            src: src.to_string(),
            as_tag: as_tag.to_string(),
        });
        let id = match &self.registry {
            Some(registry) => registry
                .digest_of(src)
                .unwrap_or_else(|| format!("sha256:pulled-{}", src)),
            None => format!("sha256:pulled-{}", src),
        };
        let mut images = self.images.lock();
        images.insert(src.to_string(), id.clone());
        images.insert(as_tag.to_string(), id);
        Ok(())
    }

    async fn tag(&self, src: &str, as_tag: &str) -> Result<()> {
        self.record(Call::Tag {
            src: src.to_string(),
            as_tag: as_tag.to_string(),
        });
        let mut images = self.images.lock();
        let id = images
            .get(src)
            .cloned()
            .ok_or_else(|| ForgeError::MissingImage(src.to_string()))?;
        images.insert(as_tag.to_string(), id);
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        Ok(self.images.lock().get(reference).map(|id| ImageInfo {
            id: id.clone(),
            repo_digests: Vec::new(),
        }))
    }

    async fn build(
        &self,
        input: &ContextSnapshot,
        core: &BuildInputCore,
        hints: &BuildHints,
    ) -> Result<()> {
        let files = context_files(input)?;
        self.record(Call::Build {
            tags: hints.tags.clone(),
            labels: hints.labels.clone(),
            froms: core.froms.clone(),
            build_args: core.build_args.clone(),
            files,
        });

        for from in core.froms.keys() {
            if from.starts_with('@') {
                continue;
            }
            if !self.images.lock().contains_key(from) {
                return Err(ForgeError::MissingImage(from.clone()));
            }
        }

        if let Some(cancel) = &self.block_until {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ForgeError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        }

        if let Some(failing) = &self.failing_tag {
            if hints.tags.contains(failing) {
                return Err(ForgeError::Process {
                    command: "docker build".to_string(),
                    code: Some(1),
                });
            }
        }

        let id = format!("sha256:built-{}", core.digest()?);
        let mut images = self.images.lock();
        for tag in &hints.tags {
            images.insert(tag.clone(), id.clone());
        }
        Ok(())
    }

    async fn push(&self, tag: &str) -> Result<()> {
        self.record(Call::Push(tag.to_string()));
        let id = self
            .image_id(tag)
            .ok_or_else(|| ForgeError::MissingImage(tag.to_string()))?;
        if let Some(registry) = &self.registry {
            registry.insert(tag, id.as_bytes());
        }
        Ok(())
    }

    async fn run_script(&self, image: &str, mount: &Path, script: &str) -> Result<()> {
        self.record(Call::RunScript {
            image: image.to_string(),
            script: script.to_string(),
        });
        if self.image_id(image).is_none() {
            return Err(ForgeError::MissingImage(image.to_string()));
        }
        let Some(root) = &self.image_root else {
            return Ok(());
        };

        let root = root.display().to_string();
        let rooted = script.replace("'/", &format!("'{}/", root));
        let host_script = rooted.replace(
            &format!("{}{}", root, ARTIFACTS_MOUNT),
            &mount.display().to_string(),
        );
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&host_script)
            .status()
            .await?;
        if !status.success() {
            return Err(ForgeError::Process {
                command: "sh".to_string(),
                code: status.code(),
            });
        }
        Ok(())
    }
}

/// Entry names of the tar the builder would receive.
fn context_files(input: &ContextSnapshot) -> Result<Vec<String>> {
    let mut bytes = Vec::new();
    input.write_tar(&mut bytes)?;
    let mut archive = tar::Archive::new(&bytes[..]);
    let mut files = Vec::new();
    for entry in archive.entries()? {
        files.push(entry?.path()?.to_string_lossy().into_owned());
    }
    Ok(files)
}

/// Manifests keyed by normalized reference.
#[derive(Default)]
pub struct FakeRegistry {
    manifests: Mutex<BTreeMap<String, Manifest>>,
    puts: Mutex<Vec<String>>,
    unreachable: AtomicBool,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(reference: &str) -> String {
        ImageRef::parse(reference)
            .map(|r| r.to_string())
            .unwrap_or_else(|_| reference.to_string())
    }

    pub fn insert(&self, reference: &str, body: &[u8]) {
        self.manifests.lock().insert(
            Self::key(reference),
            Manifest::new(MANIFEST_TYPE, body.to_vec()),
        );
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.manifests.lock().contains_key(&Self::key(reference))
    }

    pub fn digest_of(&self, reference: &str) -> Option<String> {
        self.manifests
            .lock()
            .get(&Self::key(reference))
            .map(|m| m.digest.clone())
    }

    /// References written through the registry API, not via pushes.
    pub fn puts(&self) -> Vec<String> {
        self.puts.lock().clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(ForgeError::registry("manifest", "connection refused", true))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteRegistry for FakeRegistry {
    async fn manifest_digest(&self, reference: &ImageRef) -> Result<Option<String>> {
        self.check_reachable()?;
        Ok(self
            .manifests
            .lock()
            .get(&reference.to_string())
            .map(|m| m.digest.clone()))
    }

    async fn fetch_manifest(&self, reference: &ImageRef) -> Result<Option<Manifest>> {
        self.check_reachable()?;
        Ok(self.manifests.lock().get(&reference.to_string()).cloned())
    }

    async fn put_manifest(&self, reference: &ImageRef, manifest: &Manifest) -> Result<()> {
        self.check_reachable()?;
        self.puts.lock().push(reference.to_string());
        self.manifests
            .lock()
            .insert(reference.to_string(), manifest.clone());
        Ok(())
    }
}

pub fn config(work: &Path) -> ForgeConfig {
    ForgeConfig {
        work_dir: work.join(".imageforge"),
        work_repo: WORK_REPO.to_string(),
        artifacts_dir: Some(work.join("artifacts")),
        ..ForgeConfig::default()
    }
}

pub fn lookup(vars: &[(&str, &str)]) -> EnvLookup {
    EnvLookup::from_map(
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

pub fn forge(config: ForgeConfig, runtime: Arc<FakeRuntime>) -> Forge {
    Forge::with_runtime(config, lookup(&[]), runtime).expect("valid config")
}

pub fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(&path, content).expect("write file");
    path
}

/// A spec directory with a Dockerfile and one source file.
pub fn spec_dir(root: &Path, dir: &str, spec_yaml: &str) -> PathBuf {
    write(root, &format!("{}/Dockerfile", dir), "FROM alpine:3.20\nCOPY . /app\n");
    write(root, &format!("{}/app.txt", dir), &format!("{} sources\n", dir));
    write(root, &format!("{}/forge.yaml", dir), spec_yaml)
}

/// `c` is a base, `b` builds from it, `a` builds from `b`.
pub fn chain(root: &Path) -> PathBuf {
    spec_dir(
        root,
        "c",
        "name: c\nfroms: [\"alpine:3.20\"]\nsrcs: [app.txt]\n",
    );
    spec_dir(
        root,
        "b",
        "name: b\nfroms: [\"@c\"]\nsrcs: [app.txt]\ndeps: [../c/forge.yaml]\n",
    );
    spec_dir(
        root,
        "a",
        "name: a\ntags: [\"localhost:5000/team/a:1.0\"]\nfroms: [\"@b\"]\nsrcs: [app.txt]\ndeps: [../b/forge.yaml]\n",
    )
}

pub fn alpine_runtime() -> FakeRuntime {
    FakeRuntime::new().with_image("alpine:3.20", "sha256:alpine")
}
