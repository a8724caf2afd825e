//! Env-file parsing and the variable lookup threaded through spec loading.
//!
//! Lines are `KEY=value`. A `#` only starts a comment when it appears before
//! the first `=` on the line, so values such as `COLOR=#FF0000` keep their hash.

use crate::error::{ForgeError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Lookup signature used by variable expansion and build-arg resolution.
pub type LookupFn<'a> = dyn Fn(&str) -> Option<String> + 'a;

/// Parse env-file content. `path` is only used for error messages.
pub fn parse_env_file(content: &str, path: &Path) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let eq = line.find('=');
        let hash = line.find('#');
        match (eq, hash) {
            (_, Some(h)) if eq.map_or(true, |e| h < e) => {
                if line[..h].trim().is_empty() {
                    continue;
                }
                return Err(ForgeError::EnvFile {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: "comment after key without '='".to_string(),
                });
            }
            (None, _) => {
                return Err(ForgeError::EnvFile {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: format!("expected KEY=value, got '{}'", line),
                });
            }
            _ => {}
        }

        let (key, value) = line.split_at(eq.unwrap_or_default());
        let key = key.trim();
        let key = key.strip_prefix("export ").map(str::trim).unwrap_or(key);
        if key.is_empty() {
            return Err(ForgeError::EnvFile {
                path: path.to_path_buf(),
                line: idx + 1,
                reason: "empty key".to_string(),
            });
        }

        vars.insert(key.to_string(), unquote(value[1..].trim()).to_string());
    }

    Ok(vars)
}

pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| ForgeError::EnvFile {
        path: path.to_path_buf(),
        line: 0,
        reason: e.to_string(),
    })?;
    parse_env_file(&content, path)
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Env-file values layered over a snapshot of the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvLookup {
    env_file: Option<PathBuf>,
    overrides: BTreeMap<String, String>,
    environment: BTreeMap<String, String>,
}

impl EnvLookup {
    /// Only the given map, no process environment. Used by tests and callers
    /// that need fully deterministic lookups.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self {
            env_file: None,
            overrides: vars,
            environment: BTreeMap::new(),
        }
    }

    /// Snapshot the process environment, then layer `env_file` on top.
    pub fn from_process(env_file: Option<&Path>) -> Result<Self> {
        let environment = std::env::vars().collect();
        Self::with_environment(env_file, environment)
    }

    pub fn with_environment(
        env_file: Option<&Path>,
        environment: BTreeMap<String, String>,
    ) -> Result<Self> {
        let overrides = match env_file {
            Some(path) => load_env_file(path)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            env_file: env_file.map(Path::to_path_buf),
            overrides,
            environment,
        })
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.overrides
            .get(name)
            .or_else(|| self.environment.get(name))
            .cloned()
    }

    /// Strict lookup: a missing variable is an error.
    pub fn require(&self, name: &str) -> Result<String> {
        self.lookup(name)
            .ok_or_else(|| ForgeError::MissingVariable(name.to_string()))
    }

    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }

    /// Borrow as the closure form expected by expansion and graph loading.
    pub fn as_fn(&self) -> impl Fn(&str) -> Option<String> + '_ {
        move |name| self.lookup(name)
    }
}
