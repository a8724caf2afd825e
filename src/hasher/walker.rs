use crate::hasher::ignore::IgnoreRules;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Walk `root` and return every regular file not excluded by `ignore`.
/// Ignore rules are evaluated relative to `ignore_base`; symlinks are
/// followed. The result is sorted so callers see a stable order.
pub fn walk_dir(root: &Path, ignore: &IgnoreRules, ignore_base: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            e.into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, msg))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(ignore_base).unwrap_or(entry.path());
        if !ignore.is_ignored(rel) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn spec_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("requirements.txt"), "flask==3.0\n").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM python:3.12\n").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src").join("app.py"), "print()\n").unwrap();
        dir
    }

    #[test]
    fn test_collects_nested_files_in_order() {
        let dir = spec_tree();
        let files = walk_dir(dir.path(), &IgnoreRules::empty(), dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("Dockerfile"),
                PathBuf::from("requirements.txt"),
                PathBuf::from("src/app.py"),
            ]
        );
    }

    #[test]
    fn test_ignore_rules_relative_to_base() {
        let dir = spec_tree();
        let rules = IgnoreRules::parse("src/*.py");
        let files = walk_dir(&dir.path().join("src"), &rules, dir.path()).unwrap();
        assert!(files.is_empty());

        let whole = walk_dir(dir.path(), &IgnoreRules::parse("src"), dir.path()).unwrap();
        assert_eq!(whole.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_follows_symlinks() {
        let dir = spec_tree();
        std::os::unix::fs::symlink(dir.path().join("src"), dir.path().join("linked")).unwrap();
        let files = walk_dir(dir.path(), &IgnoreRules::empty(), dir.path()).unwrap();
        assert!(files.contains(&dir.path().join("linked").join("app.py")));
    }
}
