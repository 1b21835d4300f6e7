//! Line-anchored rewrite rules.
//!
//! A [`RewriteRule`] matches whole lines only: the pattern is wrapped as
//! `^(?:pattern)$` and tested against each line with its terminator removed.
//! Rules in a set run in listed order, each against the output of the
//! previous one, in a single pass.

use regex::{NoExpand, Regex};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("rule pattern is empty")]
    EmptyPattern,

    #[error("rule '{0}' has no unescaped '=' between pattern and replacement")]
    MissingSeparator(String),

    #[error("invalid rule pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A whole-line pattern and its replacement.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: String,
    regex: Regex,
    replacement: String,
    literal: bool,
}

impl RewriteRule {
    /// Build a rule from a regular expression. The replacement may refer to
    /// capture groups (`$1`, `${name}`).
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, RuleError> {
        Self::build(pattern, pattern, replacement.into(), false)
    }

    /// Build a rule that matches `line` exactly and substitutes `replacement`
    /// verbatim.
    pub fn literal(line: &str, replacement: impl Into<String>) -> Result<Self, RuleError> {
        Self::build(line, &regex::escape(line), replacement.into(), true)
    }

    /// Parse `pattern=replacement`, splitting on the first unescaped `=`.
    ///
    /// `\=` stands for a literal `=` in the pattern; any other backslash is
    /// kept so regex escapes pass through untouched.
    pub fn parse(spec: &str) -> Result<Self, RuleError> {
        let (pattern, replacement) = split_spec(spec)?;
        Self::new(&pattern, replacement)
    }

    /// Like [`RewriteRule::parse`], but the pattern is matched literally.
    pub fn parse_literal(spec: &str) -> Result<Self, RuleError> {
        let (line, replacement) = split_spec(spec)?;
        Self::literal(&line, replacement)
    }

    fn build(
        display: &str,
        expr: &str,
        replacement: String,
        literal: bool,
    ) -> Result<Self, RuleError> {
        if expr.is_empty() {
            return Err(RuleError::EmptyPattern);
        }
        let regex =
            Regex::new(&format!("^(?:{expr})$")).map_err(|source| RuleError::InvalidPattern {
                pattern: display.to_string(),
                source,
            })?;
        Ok(Self {
            pattern: display.to_string(),
            regex,
            replacement,
            literal,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn is_literal(&self) -> bool {
        self.literal
    }

    /// Rewrite a single line (without terminator). Returns `None` when the
    /// rule does not match or the rewrite would leave the line as it is.
    pub fn rewrite_line(&self, line: &str) -> Option<String> {
        if !self.regex.is_match(line) {
            return None;
        }
        let replaced = if self.literal {
            self.regex.replace(line, NoExpand(&self.replacement))
        } else {
            self.regex.replace(line, self.replacement.as_str())
        };
        if replaced == line {
            None
        } else {
            Some(replaced.into_owned())
        }
    }

    /// Apply this rule to every line of `text`, preserving `\n` and `\r\n`
    /// terminators. Returns the new text and the number of lines rewritten.
    pub fn apply_to_text(&self, text: &str) -> (String, usize) {
        let mut out = String::with_capacity(text.len());
        let mut rewritten = 0;
        for segment in text.split_inclusive('\n') {
            let (body, terminator) = split_terminator(segment);
            match self.rewrite_line(body) {
                Some(new_line) => {
                    out.push_str(&new_line);
                    rewritten += 1;
                }
                None => out.push_str(body),
            }
            out.push_str(terminator);
        }
        (out, rewritten)
    }
}

impl fmt::Display for RewriteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.literal { "literal" } else { "regex" };
        write!(f, "{kind} '{}' -> '{}'", self.pattern, self.replacement)
    }
}

/// Outcome of running a rule set over a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub text: String,
    /// Line substitutions performed, summed over all rules.
    pub substitutions: usize,
}

impl Rewrite {
    pub fn changed_from(&self, original: &str) -> bool {
        self.text != original
    }
}

/// Run `rules` over `text` in listed order, each rule seeing the previous
/// rule's output.
pub fn rewrite_text(text: &str, rules: &[RewriteRule]) -> Rewrite {
    let mut current = text.to_string();
    let mut substitutions = 0;
    for rule in rules {
        let (next, count) = rule.apply_to_text(&current);
        current = next;
        substitutions += count;
    }
    Rewrite {
        text: current,
        substitutions,
    }
}

fn split_terminator(segment: &str) -> (&str, &str) {
    if let Some(body) = segment.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = segment.strip_suffix('\n') {
        (body, "\n")
    } else {
        (segment, "")
    }
}

fn split_spec(spec: &str) -> Result<(String, String), RuleError> {
    let mut pattern = String::with_capacity(spec.len());
    let mut chars = spec.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '\\' if matches!(chars.peek(), Some((_, '='))) => {
                pattern.push('=');
                chars.next();
            }
            '=' => {
                let replacement = &spec[idx + ch.len_utf8()..];
                return Ok((pattern, replacement.to_string()));
            }
            other => pattern.push(other),
        }
    }
    Err(RuleError::MissingSeparator(spec.to_string()))
}
