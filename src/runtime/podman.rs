use crate::config::RuntimeKind;
use crate::constants::PODMAN_ENV_ALLOWLIST;
use crate::context::ContextSnapshot;
use crate::core::BuildInputCore;
use crate::error::Result;
use crate::runtime::cli::{self, CliRuntime};
use crate::runtime::{BuildHints, CancelSignal, ContainerRuntime, ImageInfo};
use async_trait::async_trait;
use std::path::Path;

pub struct PodmanRuntime {
    cli: CliRuntime,
}

impl PodmanRuntime {
    pub fn new(lookup: &dyn Fn(&str) -> Option<String>, cancel: CancelSignal) -> Self {
        Self {
            cli: CliRuntime::new(RuntimeKind::Podman, PODMAN_ENV_ALLOWLIST, lookup, cancel),
        }
    }

    /// Podman has no BuildKit progress flag; `--format docker` keeps the
    /// image config compatible with registries expecting v2 manifests.
    pub fn build_command(core: &BuildInputCore, hints: &BuildHints) -> Vec<String> {
        let mut args = vec!["build".to_string(), "--format".to_string(), "docker".to_string()];
        args.extend(cli::build_args(
            &core.dockerfile,
            &hints.tags,
            &hints.labels,
            &core.build_args,
        ));
        args
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Podman
    }

    async fn pull(&self, src: &str, as_tag: &str) -> Result<()> {
        self.cli.pull(src, as_tag).await
    }

    async fn tag(&self, src: &str, as_tag: &str) -> Result<()> {
        self.cli.tag(src, as_tag).await
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>> {
        self.cli.inspect(reference).await
    }

    async fn build(
        &self,
        input: &ContextSnapshot,
        core: &BuildInputCore,
        hints: &BuildHints,
    ) -> Result<()> {
        let staging = cli::staging_tag(input.digest());
        let args = Self::build_command(core, &hints.retagged(&staging));
        self.cli
            .build_staged(&args, input, &staging, &hints.tags)
            .await
    }

    async fn push(&self, tag: &str) -> Result<()> {
        self.cli.push(tag).await
    }

    async fn run_script(&self, image: &str, mount: &Path, script: &str) -> Result<()> {
        self.cli.run_script(image, mount, script).await
    }
}
