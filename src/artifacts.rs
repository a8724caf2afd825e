//! Artifact extraction rules and the shell script that copies them out.
//!
//! Destinations are relative to an artifacts root and are checked lexically:
//! anything that would leave the root is rejected before a script exists.

use crate::error::{ForgeError, Result};
use crate::paths::clean_relative;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const GLOB_CHARS: &[char] = &['*', '?', '['];

/// Shell glob semantics: separators and leading dots must match literally.
const SHELL_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// One extraction rule from a spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    /// Absolute in-container path or glob
    pub src: String,
    /// Host path relative to the artifacts root; a trailing `/` means "into"
    pub dst: String,
    #[serde(default)]
    pub optional: bool,
}

impl Artifact {
    pub fn validate(&self) -> Result<()> {
        if !self.src.starts_with('/') {
            return Err(ForgeError::Extraction(format!(
                "source '{}' must be an absolute in-container path",
                self.src
            )));
        }
        if self.src.contains(['\n', '\r', '\0']) || self.dst.contains(['\n', '\r', '\0']) {
            return Err(ForgeError::Extraction(
                "artifact paths must not contain control characters".to_string(),
            ));
        }
        if self.is_glob() {
            shell_word(&self.src)?;
        }
        clean_relative(&self.dst, Path::new("<artifacts>"))?;
        Ok(())
    }

    pub fn is_glob(&self) -> bool {
        self.src.contains(GLOB_CHARS)
    }

    /// Whether the copy lands inside `dst` rather than replacing it.
    pub fn copies_into_dir(&self) -> bool {
        self.is_glob()
            || self.dst.ends_with('/')
            || clean_relative(&self.dst, Path::new(""))
                .map(|p| p.as_os_str().is_empty())
                .unwrap_or(false)
    }
}

/// Resolve `dst` under `root`, rejecting absolute paths and `..` escapes.
/// The result is always lexically inside `root`.
pub fn resolve_dst(root: &Path, dst: &str) -> Result<PathBuf> {
    Ok(root.join(clean_relative(dst, root)?))
}

/// Shell-glob match of `path` against `pattern`.
pub fn glob_matches(pattern: &str, path: &str) -> bool {
    Pattern::new(pattern)
        .map(|p| p.matches_with(path, SHELL_MATCH))
        .unwrap_or(false)
}

/// Single-quote a literal for POSIX sh.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Render a source path as one shell word. Literal runs are quoted and glob
/// metacharacters stay bare so the shell expands them.
fn shell_word(src: &str) -> Result<String> {
    if !src.contains(GLOB_CHARS) {
        return Ok(quote(src));
    }

    let mut word = String::new();
    let mut literal = String::new();
    let mut chars = src.chars();
    let flush = |literal: &mut String, word: &mut String| {
        if !literal.is_empty() {
            word.push_str(&quote(literal));
            literal.clear();
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '*' | '?' => {
                flush(&mut literal, &mut word);
                word.push(c);
            }
            '[' => {
                flush(&mut literal, &mut word);
                let mut class = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    class.push(c);
                }
                let safe = closed
                    && !class.is_empty()
                    && class
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '!' | '^' | '_' | '.'));
                if !safe {
                    return Err(ForgeError::Extraction(format!(
                        "unsupported bracket expression in '{}'",
                        src
                    )));
                }
                word.push('[');
                word.push_str(&class);
                word.push(']');
            }
            other => literal.push(other),
        }
    }
    flush(&mut literal, &mut word);
    Ok(word)
}

/// One validated copy step.
#[derive(Debug, Clone, PartialEq)]
struct PlannedCopy {
    artifact: Artifact,
    rel_dst: PathBuf,
    into_dir: bool,
    src_word: String,
}

/// Validated artifacts ready to be turned into an extraction script.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionPlan {
    root: PathBuf,
    steps: Vec<PlannedCopy>,
}

/// What one artifact produced on the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedArtifact {
    pub src: String,
    pub dst: PathBuf,
    /// In-container paths, relative to the source's parent, that were copied
    pub matched: Vec<String>,
    pub optional: bool,
}

impl ExtractionPlan {
    /// Validate every artifact against `root`. Nothing is planned if any
    /// artifact is invalid.
    pub fn new(artifacts: &[Artifact], root: &Path) -> Result<Self> {
        let mut steps = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            artifact.validate()?;
            steps.push(PlannedCopy {
                rel_dst: clean_relative(&artifact.dst, root)?,
                into_dir: artifact.copies_into_dir(),
                src_word: shell_word(&artifact.src)?,
                artifact: artifact.clone(),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
            steps,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the `sh` script run inside the image with the artifacts root
    /// mounted at `mount`.
    pub fn script(&self, mount: &str) -> String {
        let mut script = String::from("set -e\n");
        let mount = Path::new(mount);

        for step in &self.steps {
            let target = mount.join(&step.rel_dst);
            let (dir, dest) = if step.into_dir {
                (target.clone(), format!("{}/", target.display()))
            } else {
                let parent = target.parent().unwrap_or(mount).to_path_buf();
                (parent, target.display().to_string())
            };
            let mkdir = format!("mkdir -p {}", quote(&dir.display().to_string()));
            let copy = format!("cp -R {} {}", step.src_word, quote(&dest));

            if step.artifact.optional {
                let warning = format!(
                    "warning: optional artifact {} not found",
                    step.artifact.src
                );
                script.push_str(&format!(
                    "{{ {} && {}; }} 2>/dev/null || echo {} >&2\n",
                    mkdir,
                    copy,
                    quote(&warning)
                ));
            } else {
                script.push_str(&mkdir);
                script.push('\n');
                script.push_str(&copy);
                script.push('\n');
            }
        }
        script
    }

    /// Remove whatever an earlier extraction left where this plan copies to:
    /// a file destination itself, or the entries of an into-directory
    /// destination that the source pattern names. Returns how many paths
    /// were removed.
    pub fn clear_previous(&self) -> Result<usize> {
        let mut removed = 0;
        for step in &self.steps {
            let dst = self.root.join(&step.rel_dst);
            let stale = if step.into_dir {
                top_level_matches(&dst, &step.artifact.src)
                    .into_iter()
                    .map(|name| dst.join(name))
                    .collect()
            } else {
                vec![dst]
            };
            for path in stale {
                let Ok(meta) = std::fs::symlink_metadata(&path) else {
                    continue;
                };
                if meta.is_dir() {
                    std::fs::remove_dir_all(&path)?;
                } else {
                    std::fs::remove_file(&path)?;
                }
                tracing::debug!(path = %path.display(), "Removed previous artifact");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Inspect the host side after the script ran.
    pub fn verify(&self) -> Result<Vec<ExtractedArtifact>> {
        let mut results = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let dst = self.root.join(&step.rel_dst);
            let matched = if step.into_dir {
                top_level_matches(&dst, &step.artifact.src)
            } else if dst.exists() {
                vec![file_name(&step.artifact.src).to_string()]
            } else {
                Vec::new()
            };

            if matched.is_empty() && !step.artifact.optional {
                return Err(ForgeError::Extraction(format!(
                    "required artifact {} produced nothing at {}",
                    step.artifact.src,
                    dst.display()
                )));
            }
            if matched.is_empty() {
                tracing::warn!(src = %step.artifact.src, "optional artifact missing");
            }

            results.push(ExtractedArtifact {
                src: step.artifact.src.clone(),
                dst,
                matched,
                optional: step.artifact.optional,
            });
        }
        Ok(results)
    }
}

fn file_name(src: &str) -> &str {
    src.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(src)
}

/// Names directly under `dir` that the source's last component matches.
fn top_level_matches(dir: &Path, src: &str) -> Vec<String> {
    let pattern = file_name(src);
    let mut names: Vec<String> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| {
            if pattern.contains(GLOB_CHARS) {
                glob_matches(pattern, name)
            } else {
                name == pattern
            }
        })
        .collect();
    names.sort();
    names
}
