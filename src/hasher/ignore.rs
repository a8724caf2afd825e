use glob::{MatchOptions, Pattern};
use std::path::Path;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug)]
struct Rule {
    pattern: Pattern,
    exception: bool,
}

/// Parsed `.dockerignore` rules, matched against paths relative to the
/// spec directory.
///
/// Matching follows the Docker builder: `*` stays within one path segment,
/// `**` spans any number of them, a leading `/` is the spec directory, and a
/// `!` line re-includes what earlier lines excluded. The last rule matching a
/// path or one of its parents decides.
#[derive(Debug, Default)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

impl IgnoreRules {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load rules from a file; a missing or unreadable file means no rules.
    pub fn from_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::empty(),
        }
    }

    pub fn parse(content: &str) -> Self {
        let rules = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|line| {
                let (exception, body) = match line.strip_prefix('!') {
                    Some(rest) => (true, rest.trim()),
                    None => (false, line),
                };
                let body = body
                    .trim_start_matches('/')
                    .trim_start_matches("./")
                    .trim_end_matches('/');
                if body.is_empty() {
                    return None;
                }
                Pattern::new(body).ok().map(|pattern| Rule { pattern, exception })
            })
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True if the last rule matching `path` or a parent of it excludes.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let candidates: Vec<String> = path
            .ancestors()
            .map(|a| a.to_string_lossy().into_owned())
            .filter(|a| !a.is_empty() && a != ".")
            .collect();

        let mut ignored = false;
        for rule in &self.rules {
            if candidates
                .iter()
                .any(|c| rule.pattern.matches_with(c, MATCH_OPTIONS))
            {
                ignored = !rule.exception;
            }
        }
        ignored
    }
}
