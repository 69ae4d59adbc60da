//! Line-oriented rule files
//!
//! ```text
//! # comment
//! ActiveSupport::             blacklist a namespace
//! -Foo::Bar#baz               blacklist one method
//! +Foo::Bar#keep              whitelist one method
//! to_s                        lowercase: blacklist a bare method name
//! #<Class:Foo>#bar            anonymous class, not a comment
//! Foo.Bar::Baz                .NET style, translated to Foo::Bar / Baz
//! ```

use crate::error::Result;
use crate::filter::{RuleSet, Verdict};
use regex::Regex;
use std::io::BufRead;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// A translated filter: which parts of a name it constrains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePattern {
    pub path: Option<String>,
    pub method: Option<String>,
}

/// One parsed line of a rule file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLine {
    pub verdict: Verdict,
    pub pattern: RulePattern,
}

fn method_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#|\.").expect("static regex"))
}

fn starts_upper(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn starts_lower(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_lowercase())
}

/// Split on `#` or `.`, dropping trailing empty pieces
fn split_method(filter: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = method_separator().split(filter).collect();
    while parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    parts
}

fn translate_ruby(filter: &str) -> Option<RulePattern> {
    if filter.starts_with("#<") {
        let parts = split_method(filter);
        let class = parts.get(1)?;
        return Some(RulePattern {
            path: Some(format!("#{}", class)),
            method: parts.get(2).map(|m| m.to_string()),
        });
    }
    if filter.starts_with('#') {
        return None;
    }

    let (mut path, mut method) = if filter.ends_with('#') {
        (Some(filter.to_string()), None)
    } else {
        let parts = split_method(filter);
        (
            parts.first().map(|p| p.to_string()),
            parts.get(1).map(|m| m.to_string()),
        )
    };

    // Capitalized method names are .NET style, handled by the fallback
    if let Some(m) = &method {
        if starts_upper(m) && !m.starts_with("Ruby") {
            return None;
        }
    }
    if let Some(p) = &path {
        if *p == p.to_lowercase() {
            method = path.take();
        }
    }
    if method.as_deref().is_some_and(|m| m.contains("::")) {
        return None;
    }
    if let Some(p) = path.as_mut() {
        if let Some(last) = p.rsplit("::").next() {
            if starts_lower(last) && p.len() > last.len() {
                let last = last.to_string();
                p.truncate(p.len() - last.len() - 2);
                method = Some(last);
            }
        }
    }
    Some(RulePattern { path, method })
}

fn translate_dotnet(filter: &str) -> Option<RulePattern> {
    if filter.starts_with('#') {
        return None;
    }
    let mut parts = filter.split("::");
    let path = parts.next()?.replace('.', "::");
    Some(RulePattern {
        path: Some(path),
        method: parts.next().map(str::to_string),
    })
}

/// Translate a single filter into a path/method pattern
pub fn translate(filter: &str) -> Option<RulePattern> {
    translate_ruby(filter).or_else(|| translate_dotnet(filter))
}

/// Parse a rule line; `None` for blanks and comments
pub fn parse_line(line: &str) -> Option<RuleLine> {
    let line = line.trim();
    if line.is_empty() || (line.starts_with('#') && !line.starts_with("#<")) {
        return None;
    }
    let (verdict, filter) = if let Some(rest) = line.strip_prefix('+') {
        (Verdict::Whitelisted, rest)
    } else if let Some(rest) = line.strip_prefix('-') {
        (Verdict::Blacklisted, rest)
    } else {
        (Verdict::Blacklisted, line)
    };
    let pattern = translate(filter)?;
    Some(RuleLine { verdict, pattern })
}

impl RuleSet {
    /// Apply every rule in `reader`, returning the number of rules added
    ///
    /// Lines that cannot be translated are logged and skipped.
    pub fn load_rules<R: BufRead>(&mut self, reader: R) -> Result<usize> {
        let mut added = 0;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let Some(rule) = parse_line(&line) else {
                continue;
            };
            match self.add_rule(
                rule.pattern.path.as_deref(),
                rule.pattern.method.as_deref(),
                rule.verdict,
            ) {
                Ok(_) => added += 1,
                Err(e) => warn!(line = index + 1, text = %line.trim(), "skipping rule: {}", e),
            }
        }
        debug!(added, "loaded rule file");
        Ok(added)
    }
}
