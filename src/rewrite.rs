//! Path rewriting with `*` wildcards and positional `$N` substitution.
//!
//! Patterns are literal paths where every `*` captures zero or more
//! non-whitespace characters. A leading `^` is accepted and ignored since
//! every pattern is anchored at both ends. Templates refer to captures as
//! `$1`, `$2`, ... in the order the wildcards appear.
//!
//! Rules are tried in declaration order and the first match wins.

use crate::error::ProxyError;
use regex::{Captures, Regex};
use std::borrow::Cow;

const WILDCARD_CAPTURE: &str = r"(\S*)";

#[derive(Debug, Clone)]
struct CompiledRule {
    pattern: String,
    matcher: Regex,
    template: String,
}

/// An immutable, ordered set of compiled rewrite rules.
#[derive(Debug, Clone, Default)]
pub struct RewriteRules {
    rules: Vec<CompiledRule>,
}

impl RewriteRules {
    /// Compiles `(pattern, template)` pairs, keeping their order.
    pub fn compile<I, P, T>(rules: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = (P, T)>,
        P: Into<String>,
        T: Into<String>,
    {
        let rules = rules
            .into_iter()
            .map(|(pattern, template)| {
                let pattern = pattern.into();
                let matcher = pattern_to_regex(&pattern)?;
                Ok(CompiledRule {
                    pattern,
                    matcher,
                    template: template.into(),
                })
            })
            .collect::<Result<Vec<_>, ProxyError>>()?;

        Ok(Self { rules })
    }

    /// Rewrites `path` with the first matching rule, or returns it untouched.
    pub fn apply<'a>(&self, path: &'a str) -> Cow<'a, str> {
        for rule in &self.rules {
            if let Some(captures) = rule.matcher.captures(path) {
                log::trace!("rewrite {} -> {} via '{}'", path, rule.template, rule.pattern);
                return Cow::Owned(substitute(&rule.template, &captures));
            }
        }
        Cow::Borrowed(path)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.pattern.as_str())
    }
}

fn pattern_to_regex(pattern: &str) -> Result<Regex, ProxyError> {
    let invalid = |reason: &str| ProxyError::Rewrite {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let body = pattern.strip_prefix('^').unwrap_or(pattern);
    let body = body.strip_suffix('$').unwrap_or(body);

    if !body.starts_with('/') {
        return Err(invalid("pattern must start with '/'"));
    }
    if body.chars().any(char::is_whitespace) {
        return Err(invalid("pattern must not contain whitespace"));
    }

    let mut expr = String::with_capacity(body.len() + 16);
    expr.push('^');
    for (i, literal) in body.split('*').enumerate() {
        if i > 0 {
            expr.push_str(WILDCARD_CAPTURE);
        }
        expr.push_str(&regex::escape(literal));
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| invalid(&e.to_string()))
}

/// Replaces each `$N` in `template` with capture `N`. Placeholders without a
/// matching capture are left as written.
fn substitute(template: &str, captures: &Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();

        if digits == 0 {
            out.push('$');
            rest = after;
            continue;
        }

        let index = after[..digits].parse::<usize>().unwrap_or(0);
        match captures.get(index).filter(|_| index > 0) {
            Some(capture) => out.push_str(capture.as_str()),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }

    out.push_str(rest);
    out
}
