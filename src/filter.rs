//! Blacklist/whitelist classification of methods
//!
//! Names are handled in three shapes:
//!
//! - fully qualified: `Foo::Bar#baz`
//! - path: `Foo::Bar` (namespace and class, or just the class)
//! - method: `baz`
//!
//! Rules land in one of three exact tables depending on which parts they
//! name, and every rule is also kept in a catch-all table. A separate table
//! holds namespace prefixes of known libraries.
//!
//! Lookup order, first hit wins:
//!
//! 1. exact fully-qualified match
//! 2. exact path match
//! 3. exact method match
//! 4. path entries ending in `::` or `#` that prefix the fully-qualified name,
//!    scanned forward from the greatest path entry `<=` the path
//! 5. ancestor prefixes of the path
//! 6. ancestor prefixes of the method
//!
//! An ancestor walk visits matching keys from longest to shortest and keeps
//! the last verdict seen, stopping early on a whitelist. Tiers are never
//! mixed, so a specific blacklist in an earlier tier cannot be overridden by
//! a broader whitelist in a later one.

use crate::error::{Result, TraceError};
use crate::prefix_map::PrefixMap;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Outcome of classifying a method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[repr(u8)]
pub enum Verdict {
    #[default]
    Unlisted = 0,
    Whitelisted = 1,
    Blacklisted = 2,
    WhitelistedNamespace = 3,
    BlacklistedNamespace = 4,
}

impl Verdict {
    pub fn is_blacklisted(self) -> bool {
        matches!(self, Verdict::Blacklisted | Verdict::BlacklistedNamespace)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Unlisted => "unlisted",
            Verdict::Whitelisted => "whitelisted",
            Verdict::Blacklisted => "blacklisted",
            Verdict::WhitelistedNamespace => "whitelisted-namespace",
            Verdict::BlacklistedNamespace => "blacklisted-namespace",
        };
        f.write_str(name)
    }
}

/// Which table a rule was filed under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    FullyQualified,
    Path,
    Method,
}

/// Build the fully-qualified `path#method` key
pub fn fully_qualified(path: &str, method: &str) -> String {
    let mut fq = String::with_capacity(path.len() + 1 + method.len());
    fq.push_str(path);
    fq.push('#');
    fq.push_str(method);
    fq
}

/// Rule tables plus the known-library prefixes
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    all: PrefixMap<Verdict>,
    fully_qualified: PrefixMap<Verdict>,
    paths: PrefixMap<Verdict>,
    methods: PrefixMap<Verdict>,
    libraries: PrefixMap<Verdict>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// File a rule under the table matching the parts it names
    ///
    /// Empty strings count as absent. At least one of `path` and `method`
    /// is required.
    pub fn add_rule(
        &mut self,
        path: Option<&str>,
        method: Option<&str>,
        verdict: Verdict,
    ) -> Result<RuleKind> {
        let path = path.filter(|p| !p.is_empty());
        let method = method.filter(|m| !m.is_empty());

        let (kind, key) = match (path, method) {
            (Some(p), Some(m)) => (RuleKind::FullyQualified, fully_qualified(p, m)),
            (Some(p), None) => (RuleKind::Path, p.to_string()),
            (None, Some(m)) => (RuleKind::Method, m.to_string()),
            (None, None) => {
                return Err(TraceError::InvalidRule(
                    "a rule needs a path or a method".to_string(),
                ))
            }
        };

        let table = match kind {
            RuleKind::FullyQualified => &mut self.fully_qualified,
            RuleKind::Path => &mut self.paths,
            RuleKind::Method => &mut self.methods,
        };
        table.insert(key.as_bytes(), verdict);
        self.all.insert(key.as_bytes(), verdict);
        debug!(rule = %key, ?kind, %verdict, "added classification rule");
        Ok(kind)
    }

    /// Register namespace prefixes that belong to known libraries
    pub fn register_libraries<I, S>(&mut self, prefixes: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for prefix in prefixes {
            let prefix = prefix.as_ref();
            if prefix.is_empty() {
                continue;
            }
            self.libraries
                .insert(prefix.as_bytes(), Verdict::Whitelisted);
            added += 1;
        }
        debug!(added, total = self.libraries.len(), "registered library prefixes");
        added
    }

    /// True when `path` falls under a registered library prefix
    pub fn is_library(&self, path: &str) -> bool {
        walk(&self.libraries, path.as_bytes()) == Verdict::Whitelisted
    }

    /// Classify a method given its fully-qualified name, path and method name
    pub fn classify(&self, fq: &str, path: &str, method: &str) -> Verdict {
        let (fq, path, method) = (fq.as_bytes(), path.as_bytes(), method.as_bytes());

        if let Some(v) = self.fully_qualified.get(fq) {
            return *v;
        }
        if let Some(v) = self.paths.get(path) {
            return *v;
        }
        if let Some(v) = self.methods.get(method) {
            return *v;
        }
        if let Some(v) = self.namespace_suffix_match(fq, path) {
            return v;
        }
        let verdict = walk(&self.paths, path);
        if verdict != Verdict::Unlisted {
            return verdict;
        }
        walk(&self.methods, method)
    }

    fn namespace_suffix_match(&self, fq: &[u8], path: &[u8]) -> Option<Verdict> {
        let first = path.first().copied();
        for (key, verdict) in self.paths.seek_le(path) {
            if let (Some(k), Some(p)) = (key.first(), first) {
                if *k > p {
                    break;
                }
            }
            if key.len() > 2 && (key.ends_with(b"::") || key.ends_with(b"#")) && fq.starts_with(key)
            {
                return Some(*verdict);
            }
        }
        None
    }

    /// Total number of classification rules
    pub fn rule_count(&self) -> usize {
        self.all.len()
    }

    pub fn library_count(&self) -> usize {
        self.libraries.len()
    }

    /// Every rule in key order, as `(pattern, verdict)`
    pub fn rules(&self) -> impl Iterator<Item = (String, Verdict)> + '_ {
        self.all
            .iter()
            .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), *v))
    }
}

/// Ancestor walk over a table: keep the last verdict, stop on a whitelist
fn walk(table: &PrefixMap<Verdict>, needle: &[u8]) -> Verdict {
    let mut verdict = Verdict::Unlisted;
    for (_, v) in table.ancestors(needle) {
        verdict = *v;
        if verdict == Verdict::Whitelisted {
            break;
        }
    }
    verdict
}
