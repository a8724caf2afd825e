use crate::config::RuntimeKind;
use crate::constants::DOCKER_ENV_ALLOWLIST;
use crate::context::ContextSnapshot;
use crate::core::BuildInputCore;
use crate::error::Result;
use crate::runtime::cli::{self, CliRuntime};
use crate::runtime::{BuildHints, CancelSignal, ContainerRuntime, ImageInfo};
use async_trait::async_trait;
use std::path::Path;

pub struct DockerRuntime {
    cli: CliRuntime,
}

impl DockerRuntime {
    pub fn new(lookup: &dyn Fn(&str) -> Option<String>, cancel: CancelSignal) -> Self {
        let cli = CliRuntime::new(RuntimeKind::Docker, DOCKER_ENV_ALLOWLIST, lookup, cancel)
            .with_env("DOCKER_BUILDKIT", "1");
        Self { cli }
    }

    pub fn build_command(core: &BuildInputCore, hints: &BuildHints) -> Vec<String> {
        let mut args = vec!["build".to_string(), "--progress=plain".to_string()];
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
impl ContainerRuntime for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_build_command_uses_buildkit_progress() {
        let core = BuildInputCore {
            dockerfile: "Dockerfile".to_string(),
            froms: BTreeMap::new(),
            context: "c".to_string(),
            build_args: BTreeMap::from([("V".to_string(), "1".to_string())]),
            epoch: String::new(),
        };
        let hints = BuildHints {
            tags: vec!["cache:z-1".to_string()],
            labels: BTreeMap::new(),
        };
        let args = DockerRuntime::build_command(&core, &hints);
        assert_eq!(&args[..2], &["build", "--progress=plain"]);
        assert!(args.windows(2).any(|w| w == ["--build-arg", "V=1"]));
        assert_eq!(args.last().unwrap(), "-");
    }

    #[test]
    fn test_buildkit_enabled() {
        let runtime = DockerRuntime::new(&|_| None, CancelSignal::new());
        assert_eq!(runtime.cli.env().get("DOCKER_BUILDKIT").map(String::as_str), Some("1"));
    }
}
