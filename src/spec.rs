//! Spec files: one declarative image build each.
//!
//! A spec is parsed from YAML with unknown fields rejected, then every string
//! field is run through variable expansion. Unresolved variables are reported
//! per file with the full sorted set of names.

use crate::artifacts::Artifact;
use crate::error::{ForgeError, Result};
use crate::vars;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// A spec as authored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Spec {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Bare image references, or `@name` for another spec in the graph
    #[serde(default)]
    pub froms: Vec<String>,
    #[serde(default)]
    pub srcs: Vec<String>,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub build_args: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub disable_caching: bool,
}

/// A spec after expansion, tied to the absolute path it was loaded from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSpec {
    pub spec: Spec,
    pub source_path: PathBuf,
}

impl Spec {
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| {
            let location = e.location();
            ForgeError::SpecParse {
                path: path.to_path_buf(),
                line: location.as_ref().map(|l| l.line()),
                column: location.as_ref().map(|l| l.column()),
                message: e.to_string(),
            }
        })
    }

    /// Expand every string and string-list field, returning the names that
    /// could not be resolved.
    pub fn expand(
        mut self,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> (Self, BTreeSet<String>) {
        let mut missing = BTreeSet::new();
        let mut one = |s: &mut String| *s = vars::expand_tracked(s, lookup, &mut missing);

        one(&mut self.name);
        self.tags.iter_mut().for_each(&mut one);
        self.froms.iter_mut().for_each(&mut one);
        self.srcs.iter_mut().for_each(&mut one);
        if let Some(dockerfile) = self.dockerfile.as_mut() {
            one(dockerfile);
        }
        self.build_args.iter_mut().for_each(&mut one);
        self.deps.iter_mut().for_each(&mut one);
        for artifact in &mut self.artifacts {
            one(&mut artifact.src);
            one(&mut artifact.dst);
        }

        (self, missing)
    }

    /// Names of specs referenced as `@name` in `froms`.
    pub fn local_froms(&self) -> impl Iterator<Item = &str> {
        self.froms.iter().filter_map(|f| f.strip_prefix('@'))
    }

    pub fn dockerfile_name(&self) -> &str {
        self.dockerfile
            .as_deref()
            .unwrap_or(crate::constants::DEFAULT_DOCKERFILE)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |reason: String| ForgeError::InvalidSpec {
            path: path.to_path_buf(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if !self.name.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
        }) {
            return Err(invalid(format!(
                "name '{}' may only contain lowercase letters, digits, '.', '_' and '-'",
                self.name
            )));
        }
        for from in &self.froms {
            if from.is_empty() || from == "@" {
                return Err(invalid("empty entry in froms".to_string()));
            }
        }
        for arg in &self.build_args {
            let key = arg.split_once('=').map_or(arg.as_str(), |(k, _)| k);
            if key.is_empty() {
                return Err(invalid(format!("build arg '{}' has an empty key", arg)));
            }
        }
        for artifact in &self.artifacts {
            artifact
                .validate()
                .map_err(|e| invalid(format!("artifact {}: {}", artifact.src, e)))?;
        }
        Ok(())
    }
}

impl ResolvedSpec {
    /// Read, parse, expand and validate the spec at `path`.
    pub fn load(path: &Path, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let source_path = absolute(path)?;
        let content = std::fs::read_to_string(&source_path).map_err(|e| ForgeError::InvalidSpec {
            path: source_path.clone(),
            reason: format!("cannot read spec: {}", e),
        })?;

        let (spec, missing) = Spec::parse(&content, &source_path)?.expand(lookup);
        if !missing.is_empty() {
            return Err(ForgeError::UnresolvedVariables {
                path: source_path,
                names: missing.into_iter().collect(),
            });
        }
        spec.validate(&source_path)?;

        Ok(Self { spec, source_path })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Directory the spec's relative paths are resolved against.
    pub fn base_dir(&self) -> &Path {
        self.source_path.parent().unwrap_or_else(|| Path::new("/"))
    }

    /// Absolute paths of the declared dependency spec files.
    pub fn dep_paths(&self) -> Vec<PathBuf> {
        self.spec
            .deps
            .iter()
            .map(|d| {
                let p = Path::new(d);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    self.base_dir().join(p)
                }
            })
            .collect()
    }
}

/// Canonical absolute form of `path`, falling back to a lexical join with the
/// current directory when the file cannot be canonicalized.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(p) => Ok(p),
        Err(_) if path.is_absolute() => Ok(path.to_path_buf()),
        Err(_) => Ok(std::env::current_dir()?.join(path)),
    }
}
