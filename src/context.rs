//! Deterministic build context.
//!
//! Entries are keyed by their name inside the context, so the serialized
//! order never depends on how sources were listed. The context digest covers
//! per-file records (name, mode, owner, size, content hash) rather than raw
//! tar bytes; the tar stream itself is normalized the same way so identical
//! records always produce identical archives.

use crate::constants::{IGNORE_FILE, MODE_MASK, NORMALIZED_MTIME};
use crate::error::{ForgeError, Result};
use crate::hasher::{self, HashingReader, IgnoreRules};
use crate::paths::{clean_relative, relative_name};
use crate::spec::ResolvedSpec;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};

/// Explicit metadata for one context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
}

#[derive(Debug, Clone)]
struct ContextEntry {
    source: PathBuf,
    meta: Option<EntryMeta>,
}

/// The digestible description of one file in the context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub name: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    entries: BTreeMap<String, ContextEntry>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `source` under `name`. A later add with the same name replaces the
    /// earlier one.
    pub fn add_file(&mut self, name: &str, source: &Path, meta: Option<EntryMeta>) -> Result<()> {
        let cleaned = clean_relative(name, Path::new("<context>"))?;
        if cleaned.as_os_str().is_empty() {
            return Err(ForgeError::PathEscape {
                path: name.to_string(),
                root: PathBuf::from("<context>"),
            });
        }
        let key = cleaned
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        self.entries.insert(
            key,
            ContextEntry {
                source: source.to_path_buf(),
                meta,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Per-file records in name order. Reads every file once.
    pub fn records(&self) -> Result<Vec<FileRecord>> {
        self.entries
            .iter()
            .map(|(name, entry)| record_for(name, entry))
            .collect()
    }

    /// SHA-256 over the JSON list of records.
    pub fn digest(&self) -> Result<String> {
        digest_records(&self.records()?)
    }

    /// Write the normalized tar stream for `records` (as returned by
    /// [`records`](Self::records)) to `out`.
    pub fn write_tar<W: Write>(&self, records: &[FileRecord], out: W) -> Result<()> {
        let mut builder = Builder::new(out);

        for record in records {
            let entry = self.entries.get(&record.name).ok_or_else(|| {
                ForgeError::Other(anyhow::anyhow!("no context entry named {}", record.name))
            })?;

            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(record.size);
            header.set_mode(record.mode);
            header.set_uid(record.uid);
            header.set_gid(record.gid);
            header.set_mtime(NORMALIZED_MTIME);

            let file = File::open(&entry.source)?;
            let mut reader = HashingReader::new(file.take(record.size));
            builder.append_data(&mut header, &record.name, &mut reader)?;
            let (file, sha256) = reader.finish();
            if file.limit() != 0 || sha256 != record.sha256 {
                return Err(ForgeError::Other(anyhow::anyhow!(
                    "{} changed while the context was being written",
                    entry.source.display()
                )));
            }
        }

        builder.into_inner()?.flush()?;
        Ok(())
    }

    /// Assemble the context for a spec: its Dockerfile plus every `srcs`
    /// entry, named relative to the spec's directory.
    pub fn from_spec(spec: &ResolvedSpec) -> Result<Self> {
        let base = spec.base_dir();
        let invalid = |reason: String| ForgeError::InvalidSpec {
            path: spec.source_path.clone(),
            reason,
        };
        let ignore = IgnoreRules::from_file(&base.join(IGNORE_FILE));
        let mut context = Self::new();

        for src in &spec.spec.srcs {
            if src.contains(['*', '?', '[']) {
                // the spec directory is literal text, only `src` is a pattern
                let pattern = format!(
                    "{}/{}",
                    glob::Pattern::escape(&base.to_string_lossy()),
                    src
                );
                let paths = glob::glob(&pattern)
                    .map_err(|e| invalid(format!("bad source pattern '{}': {}", src, e)))?;
                let mut matched = 0usize;
                for path in paths {
                    let path = path.map_err(|e| invalid(e.to_string()))?;
                    if path.is_dir() {
                        matched += context.add_dir(&path, base, &ignore)?;
                        continue;
                    }
                    let name = relative_name(&path, base)?;
                    if !ignore.is_ignored(Path::new(&name)) {
                        context.add_file(&name, &path, None)?;
                        matched += 1;
                    }
                }
                if matched == 0 {
                    return Err(invalid(format!("source pattern '{}' matched no files", src)));
                }
                continue;
            }

            let path = base.join(src);
            if path.is_dir() {
                // `srcs: ["."]` names the spec directory itself
                context.add_dir(&path, base, &ignore)?;
            } else if path.is_file() {
                let name = relative_name(&path, base)?;
                context.add_file(&name, &path, None)?;
            } else {
                return Err(invalid(format!("source '{}' does not exist", src)));
            }
        }

        let dockerfile = base.join(spec.spec.dockerfile_name());
        if !dockerfile.is_file() {
            return Err(invalid(format!(
                "dockerfile '{}' does not exist",
                spec.spec.dockerfile_name()
            )));
        }
        let name = relative_name(&dockerfile, base)?;
        context.add_file(&name, &dockerfile, None)?;

        Ok(context)
    }

    fn add_dir(&mut self, dir: &Path, base: &Path, ignore: &IgnoreRules) -> Result<usize> {
        let rel = dir.strip_prefix(base).map_err(|_| ForgeError::PathEscape {
            path: dir.display().to_string(),
            root: base.to_path_buf(),
        })?;
        let dir = base.join(clean_relative(&rel.to_string_lossy(), base)?);
        let files = hasher::walk_dir(&dir, ignore, base)?;
        for file in &files {
            let name = relative_name(file, base)?;
            self.add_file(&name, file, None)?;
        }
        Ok(files.len())
    }
}

/// A context with its records and digest pinned, so the tar streamed to the
/// builder is the one the cache key was computed from.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    context: BuildContext,
    records: Vec<FileRecord>,
    digest: String,
}

impl ContextSnapshot {
    pub fn new(context: BuildContext) -> Result<Self> {
        let records = context.records()?;
        let digest = digest_records(&records)?;
        Ok(Self {
            context,
            records,
            digest,
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn total_size(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }

    pub fn write_tar<W: Write>(&self, out: W) -> Result<()> {
        self.context.write_tar(&self.records, out)
    }
}

pub fn digest_records(records: &[FileRecord]) -> Result<String> {
    let json = serde_json::to_vec(records)?;
    Ok(hasher::sha256_bytes(&json))
}

fn record_for(name: &str, entry: &ContextEntry) -> Result<FileRecord> {
    let (sha256, size) = hasher::sha256_file(&entry.source).map_err(|e| {
        ForgeError::Other(anyhow::anyhow!(
            "reading context file {}: {}",
            entry.source.display(),
            e
        ))
    })?;

    let meta = match entry.meta {
        Some(meta) => meta,
        None => EntryMeta {
            mode: file_mode(&entry.source)?,
            uid: 0,
            gid: 0,
        },
    };

    Ok(FileRecord {
        name: name.to_string(),
        mode: meta.mode & MODE_MASK,
        uid: meta.uid,
        gid: meta.gid,
        size,
        sha256,
    })
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(std::fs::metadata(path)?.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(path: &Path) -> Result<u32> {
    let readonly = std::fs::metadata(path)?.permissions().readonly();
    Ok(if readonly { 0o444 } else { 0o644 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_digest_independent_of_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.txt", "alpha");
        let b = write(dir.path(), "b.txt", "beta");

        let mut first = BuildContext::new();
        first.add_file("a.txt", &a, None).unwrap();
        first.add_file("b.txt", &b, None).unwrap();

        let mut second = BuildContext::new();
        second.add_file("b.txt", &b, None).unwrap();
        second.add_file("./a.txt", &a, None).unwrap();

        assert_eq!(first.digest().unwrap(), second.digest().unwrap());
        assert_eq!(first.names().collect::<Vec<_>>(), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_digest_changes_with_content_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.txt", "alpha");
        let meta = EntryMeta { mode: 0o644, uid: 0, gid: 0 };

        let mut ctx = BuildContext::new();
        ctx.add_file("a.txt", &a, Some(meta)).unwrap();
        let before = ctx.digest().unwrap();

        fs::write(&a, "alpha2").unwrap();
        let after_content = ctx.digest().unwrap();
        assert_ne!(before, after_content);

        ctx.add_file("a.txt", &a, Some(EntryMeta { uid: 1000, ..meta })).unwrap();
        assert_ne!(after_content, ctx.digest().unwrap());
    }

    #[test]
    fn test_mode_masked_to_permission_bits() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.sh", "#!/bin/sh");
        let mut ctx = BuildContext::new();
        ctx.add_file("a.sh", &a, Some(EntryMeta { mode: 0o104755, uid: 0, gid: 0 }))
            .unwrap();
        assert_eq!(ctx.records().unwrap()[0].mode, 0o755);
    }

    #[test]
    fn test_tar_is_byte_stable_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "src/app.py", "print('hi')\n");
        let d = write(dir.path(), "Dockerfile", "FROM scratch\n");

        let mut ctx = BuildContext::new();
        ctx.add_file("src/app.py", &a, None).unwrap();
        ctx.add_file("Dockerfile", &d, None).unwrap();
        let records = ctx.records().unwrap();

        let mut first = Vec::new();
        ctx.write_tar(&records, &mut first).unwrap();
        let mut second = Vec::new();
        ctx.write_tar(&records, &mut second).unwrap();
        assert_eq!(first, second);

        let mut archive = tar::Archive::new(&first[..]);
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().mtime().unwrap(), 0);
            assert_eq!(entry.header().uid().unwrap(), 0);
            names.push(entry.path().unwrap().display().to_string());
        }
        assert_eq!(names, vec!["Dockerfile", "src/app.py"]);
    }

    #[test]
    fn test_snapshot_digest_matches_context() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.txt", "alpha");
        let mut ctx = BuildContext::new();
        ctx.add_file("a.txt", &a, None).unwrap();
        let expected = ctx.digest().unwrap();

        let snapshot = ContextSnapshot::new(ctx).unwrap();
        assert_eq!(snapshot.digest(), expected);
        assert_eq!(snapshot.total_size(), 5);
    }

    #[test]
    fn test_from_spec_collects_sources_and_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Dockerfile", "FROM scratch\n");
        write(dir.path(), "src/app.py", "x");
        write(dir.path(), "src/cache.pyc", "x");
        write(dir.path(), "requirements.txt", "x");
        write(dir.path(), "docs/a.md", "x");
        write(dir.path(), "docs/b.md", "x");
        write(dir.path(), ".dockerignore", "src/*.pyc\n");
        let spec_path = write(
            dir.path(),
            "forge.yaml",
            "name: app\nsrcs: [src, requirements.txt, 'docs/*.md']\n",
        );

        let spec = ResolvedSpec::load(&spec_path, &|_| None).unwrap();
        let ctx = BuildContext::from_spec(&spec).unwrap();
        assert_eq!(
            ctx.names().collect::<Vec<_>>(),
            vec!["Dockerfile", "docs/a.md", "docs/b.md", "requirements.txt", "src/app.py"]
        );
    }

    #[test]
    fn test_from_spec_applies_dockerignore_exceptions() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Dockerfile", "FROM scratch\n");
        write(dir.path(), "app.log", "x");
        write(dir.path(), "keep.log", "x");
        write(dir.path(), "logs/nested.log", "x");
        write(dir.path(), "build/out.bin", "x");
        write(dir.path(), "build/VERSION", "x");
        write(dir.path(), ".dockerignore", "*.log\n!keep.log\n/build\n!build/VERSION\n");
        let spec_path = write(dir.path(), "forge.yaml", "name: app\nsrcs: ['.']\n");

        let spec = ResolvedSpec::load(&spec_path, &|_| None).unwrap();
        let ctx = BuildContext::from_spec(&spec).unwrap();
        assert_eq!(
            ctx.names().collect::<Vec<_>>(),
            vec![
                ".dockerignore",
                "Dockerfile",
                "build/VERSION",
                "forge.yaml",
                "keep.log",
                "logs/nested.log",
            ]
        );
    }

    #[test]
    fn test_source_glob_under_bracketed_directory() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("proj[1]");
        write(&proj, "Dockerfile", "FROM scratch\n");
        write(&proj, "a.txt", "x");
        write(dir.path(), "proj1/b.txt", "x");
        let spec_path = write(&proj, "forge.yaml", "name: app\nsrcs: ['*.txt']\n");

        let spec = ResolvedSpec::load(&spec_path, &|_| None).unwrap();
        let ctx = BuildContext::from_spec(&spec).unwrap();
        assert_eq!(ctx.names().collect::<Vec<_>>(), vec!["Dockerfile", "a.txt"]);
    }

    #[test]
    fn test_same_size_edit_after_snapshot_fails_tar() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.txt", "alpha");
        let mut ctx = BuildContext::new();
        ctx.add_file("a.txt", &a, None).unwrap();
        let snapshot = ContextSnapshot::new(ctx).unwrap();

        fs::write(&a, "omega").unwrap();
        let err = snapshot.write_tar(Vec::new()).unwrap_err();
        assert!(err.to_string().contains("changed while the context was being written"));
    }

    #[test]
    fn test_from_spec_rejects_missing_and_escaping_sources() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        write(&app, "Dockerfile", "FROM scratch\n");
        write(dir.path(), "secret.txt", "x");

        let missing = write(&app, "missing.yaml", "name: app\nsrcs: [nope.txt]\n");
        let spec = ResolvedSpec::load(&missing, &|_| None).unwrap();
        assert!(BuildContext::from_spec(&spec).is_err());

        let escaping = write(&app, "escape.yaml", "name: app\nsrcs: [../secret.txt]\n");
        let spec = ResolvedSpec::load(&escaping, &|_| None).unwrap();
        assert!(matches!(
            BuildContext::from_spec(&spec),
            Err(ForgeError::PathEscape { .. })
        ));
    }

    #[test]
    fn test_name_escaping_context_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.txt", "x");
        let mut ctx = BuildContext::new();
        assert!(ctx.add_file("../a.txt", &a, None).is_err());
        assert!(ctx.add_file("/abs/a.txt", &a, None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_hashed_as_target_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = write(dir.path(), "real.txt", "payload");
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut direct = BuildContext::new();
        direct.add_file("f", &target, None).unwrap();
        let mut linked = BuildContext::new();
        linked.add_file("f", &link, None).unwrap();

        assert_eq!(
            direct.records().unwrap()[0].sha256,
            linked.records().unwrap()[0].sha256
        );
    }
}
