//! Engine configuration, read from `IMAGEFORGE_*` variables.

use crate::error::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Podman,
}

impl RuntimeKind {
    pub fn binary(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for RuntimeKind {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeKind::Docker),
            "podman" => Ok(RuntimeKind::Podman),
            other => Err(ForgeError::Config(format!(
                "unknown container runtime '{}' (expected docker or podman)",
                other
            ))),
        }
    }
}

/// Read-only settings for one or more sequential builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub work_dir: PathBuf,
    /// Repository holding `z-<digest>` cache tags
    pub work_repo: String,
    /// Prepended to a spec name to form its local tag
    pub name_prefix: String,
    pub build_id: Option<String>,
    pub cache_epoch: String,
    pub env_file: Option<PathBuf>,
    /// Defaults to `<work_dir>/artifacts`
    pub artifacts_dir: Option<PathBuf>,
    pub runtime: RuntimeKind,
    pub rebuild: bool,
    pub read_only_cache: bool,
    pub local_cache: bool,
    pub remote_cache: bool,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".imageforge"),
            work_repo: "imageforge-cache".to_string(),
            name_prefix: String::new(),
            build_id: None,
            cache_epoch: String::new(),
            env_file: None,
            artifacts_dir: None,
            runtime: RuntimeKind::Docker,
            rebuild: false,
            read_only_cache: false,
            local_cache: true,
            remote_cache: false,
        }
    }
}

impl ForgeConfig {
    /// Defaults overlaid with any `IMAGEFORGE_*` variables `lookup` resolves.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("IMAGEFORGE_WORK_DIR") {
            config.work_dir = PathBuf::from(v);
        }
        if let Some(v) = get("IMAGEFORGE_WORK_REPO") {
            config.work_repo = v;
        }
        if let Some(v) = get("IMAGEFORGE_NAME_PREFIX") {
            config.name_prefix = v;
        }
        config.build_id = get("IMAGEFORGE_BUILD_ID");
        if let Some(v) = get("IMAGEFORGE_CACHE_EPOCH") {
            config.cache_epoch = v;
        }
        config.env_file = get("IMAGEFORGE_ENV_FILE").map(PathBuf::from);
        config.artifacts_dir = get("IMAGEFORGE_ARTIFACTS_DIR").map(PathBuf::from);
        if let Some(v) = get("IMAGEFORGE_RUNTIME") {
            config.runtime = v.parse()?;
        }

        let flags: [(&str, &mut bool); 4] = [
            ("IMAGEFORGE_REBUILD", &mut config.rebuild),
            ("IMAGEFORGE_READ_ONLY_CACHE", &mut config.read_only_cache),
            ("IMAGEFORGE_LOCAL_CACHE", &mut config.local_cache),
            ("IMAGEFORGE_REMOTE_CACHE", &mut config.remote_cache),
        ];
        for (key, slot) in flags {
            if let Some(v) = get(key) {
                *slot = parse_flag(key, &v)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<()> {
        let repo = self.work_repo.trim();
        if repo.is_empty() {
            return Err(ForgeError::Config("work_repo must not be empty".to_string()));
        }
        let last = repo.rsplit('/').next().unwrap_or(repo);
        if repo.contains('@') || last.contains(':') {
            return Err(ForgeError::Config(format!(
                "work_repo '{}' must be a repository without tag or digest",
                repo
            )));
        }
        Ok(())
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("artifacts"))
    }

    /// Tag a spec's image carries locally so dependents can build from it.
    pub fn local_tag(&self, spec_name: &str) -> String {
        format!("{}{}", self.name_prefix, spec_name)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ForgeError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, value
        ))),
    }
}
