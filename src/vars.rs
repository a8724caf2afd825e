//! `$NAME` substitution for spec fields.
//!
//! `$NAME` and `${NAME}` are replaced through a lookup; names that do not
//! resolve are left verbatim and reported so the caller can fail loudly.
//! `$$` collapses to a single literal `$`.

use std::collections::BTreeSet;

/// Expand variables in `input`, leaving unresolved references untouched.
pub fn expand(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut unresolved = BTreeSet::new();
    expand_tracked(input, lookup, &mut unresolved)
}

/// Like [`expand`], recording every name the lookup could not resolve.
pub fn expand_tracked(
    input: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    unresolved: &mut BTreeSet<String>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }

        if let Some(inner) = after.strip_prefix('{') {
            if let Some(close) = inner.find('}') {
                let name = &inner[..close];
                if is_identifier(name) {
                    substitute(name, &rest[pos..pos + close + 3], lookup, unresolved, &mut out);
                    rest = &inner[close + 1..];
                    continue;
                }
            }
            out.push('$');
            rest = after;
            continue;
        }

        let len = identifier_len(after);
        if len == 0 {
            out.push('$');
            rest = after;
            continue;
        }

        let name = &after[..len];
        substitute(name, &rest[pos..pos + 1 + len], lookup, unresolved, &mut out);
        rest = &after[len..];
    }

    out.push_str(rest);
    out
}

fn substitute(
    name: &str,
    original: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
    unresolved: &mut BTreeSet<String>,
    out: &mut String,
) {
    match lookup(name) {
        Some(value) => out.push_str(&value),
        None => {
            unresolved.insert(name.to_string());
            out.push_str(original);
        }
    }
}

/// Length of the identifier (`[A-Za-z_][A-Za-z0-9_]*`) at the start of `s`.
fn identifier_len(s: &str) -> usize {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return 0,
    }
    chars
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && identifier_len(s) == s.len()
}
