//! Build-input digest: the cache key for one spec.

use crate::constants::CACHE_TAG_PREFIX;
use crate::error::Result;
use crate::hasher;
use serde::Serialize;
use std::collections::BTreeMap;

/// Everything that determines a spec's image. Maps are `BTreeMap` so the JSON
/// form is key-ordered and identical inputs always serialize identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInputCore {
    pub dockerfile: String,
    /// logical from name -> resolved image identity
    pub froms: BTreeMap<String, String>,
    pub context: String,
    pub build_args: BTreeMap<String, String>,
    pub epoch: String,
}

impl BuildInputCore {
    /// `sha256(JSON(core))` as lowercase hex.
    pub fn digest(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(hasher::sha256_bytes(&json))
    }

    /// `<work_repo>:z-<digest>`
    pub fn cache_tag(&self, work_repo: &str) -> Result<String> {
        Ok(cache_tag_for(work_repo, &self.digest()?))
    }
}

pub fn cache_tag_for(work_repo: &str, digest: &str) -> String {
    format!("{}:{}{}", work_repo, CACHE_TAG_PREFIX, digest)
}

/// Resolve `KEY=value` and bare `KEY` build args. A bare key takes its value
/// from `lookup`, or the empty string when nothing resolves. Later entries
/// for the same key win.
pub fn resolve_build_args(
    args: &[String],
    lookup: &dyn Fn(&str) -> Option<String>,
) -> BTreeMap<String, String> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (arg.clone(), lookup(arg).unwrap_or_default()),
        })
        .collect()
}
