//! Lexical path checks that keep sources and artifact destinations inside
//! their roots.

use crate::error::{ForgeError, Result};
use std::path::{Component, Path, PathBuf};

/// Lexically clean a relative path. `..` may not climb above the start and
/// absolute paths are refused; `root` only labels the error.
pub fn clean_relative(path: &str, root: &Path) -> Result<PathBuf> {
    let escape = || ForgeError::PathEscape {
        path: path.to_string(),
        root: root.to_path_buf(),
    };

    let mut cleaned = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    return Err(escape());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    Ok(cleaned)
}

/// `path` relative to `base` as a forward-slash name, refusing anything that
/// leaves `base`.
pub fn relative_name(path: &Path, base: &Path) -> Result<String> {
    let escape = || ForgeError::PathEscape {
        path: path.display().to_string(),
        root: base.to_path_buf(),
    };
    let rel = path.strip_prefix(base).map_err(|_| escape())?;
    let cleaned = clean_relative(&rel.to_string_lossy(), base)?;
    if cleaned.as_os_str().is_empty() {
        return Err(escape());
    }
    Ok(cleaned
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_relative() {
        let root = Path::new("/r");
        assert_eq!(clean_relative("a/./b/../c", root).unwrap(), PathBuf::from("a/c"));
        assert!(clean_relative("../a", root).is_err());
        assert!(clean_relative("/abs", root).is_err());
    }

    #[test]
    fn test_relative_name() {
        let base = Path::new("/repo/app");
        assert_eq!(
            relative_name(Path::new("/repo/app/src/main.py"), base).unwrap(),
            "src/main.py"
        );
        assert!(relative_name(Path::new("/repo/app/../shared/x"), base).is_err());
        assert!(relative_name(Path::new("/elsewhere/x"), base).is_err());
        assert!(relative_name(base, base).is_err());
    }
}
