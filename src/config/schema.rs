use crate::filter::LineFilter;
use crate::patcher::RetryPolicy;
use crate::rule::{RewriteRule, RuleError};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// A rules file: rewrite rules, filter settings and retry defaults.
///
/// ```toml
/// [retry]
/// max_attempts = 5
/// sleep_seconds = 2
///
/// [[rules]]
/// id = "relax-gradio-client"
/// pattern = "gradio_client==1.13.1"
/// replacement = "gradio_client>=1.13.1,<2.0"
/// literal = true
///
/// [filter]
/// exclude_prefixes = ["diffusers @"]
/// exclude_packages = ["pip", "setuptools", "wheel"]
/// ```
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    #[serde(default)]
    pub filter: FilterSettings,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub sleep_seconds: Option<f64>,
    #[serde(default)]
    pub deadline_seconds: Option<f64>,
    #[serde(default)]
    pub force_kill: bool,
}

impl RetrySettings {
    /// Overlay these settings on `base`. Assumes [`RulesConfig::compile`]
    /// has accepted them.
    pub fn apply_to(&self, mut base: RetryPolicy) -> RetryPolicy {
        if let Some(max_attempts) = self.max_attempts {
            base.max_attempts = max_attempts;
        }
        if let Some(sleep) = self.sleep_seconds.and_then(seconds) {
            base.sleep = sleep;
        }
        if let Some(deadline) = self.deadline_seconds.and_then(seconds) {
            base.deadline = Some(deadline);
        }
        base
    }

    pub fn is_empty(&self) -> bool {
        *self == RetrySettings::default()
    }
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub pattern: String,
    pub replacement: String,
    /// Match `pattern` as plain text instead of a regular expression.
    #[serde(default)]
    pub literal: bool,
}

impl RuleDefinition {
    pub fn compile(&self) -> Result<RewriteRule, RuleError> {
        if self.literal {
            RewriteRule::literal(&self.pattern, self.replacement.as_str())
        } else {
            RewriteRule::new(&self.pattern, self.replacement.as_str())
        }
    }

    fn label(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| format!("#{}", index + 1))
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FilterSettings {
    #[serde(default)]
    pub exclude_prefixes: Vec<String>,
    #[serde(default)]
    pub exclude_packages: Vec<String>,
}

impl FilterSettings {
    pub fn to_line_filter(&self) -> LineFilter {
        self.exclude_prefixes
            .iter()
            .fold(LineFilter::new(), |filter, prefix| {
                filter.exclude_prefix(prefix.as_str())
            })
            .exclude_packages(&self.exclude_packages)
    }

    pub fn is_empty(&self) -> bool {
        self.exclude_prefixes.is_empty() && self.exclude_packages.is_empty()
    }
}

/// A validated rules file with its rules compiled, in file order.
#[derive(Debug, Default, Clone)]
pub struct RulesFile {
    pub retry: RetrySettings,
    pub filter: FilterSettings,
    pub rules: Vec<RewriteRule>,
}

impl RulesConfig {
    /// Check every section and compile the rules in one pass. All problems
    /// are reported together.
    pub fn compile(self) -> Result<RulesFile, ValidationError> {
        let mut issues = Vec::new();

        if self.rules.is_empty() && self.filter.is_empty() {
            issues.push(ValidationIssue::Empty);
        }

        if self.retry.max_attempts == Some(0) {
            issues.push(ValidationIssue::InvalidRetry {
                field: "retry.max_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        for (field, value) in [
            ("retry.sleep_seconds", self.retry.sleep_seconds),
            ("retry.deadline_seconds", self.retry.deadline_seconds),
        ] {
            if let Some(value) = value {
                if seconds(value).is_none() {
                    issues.push(ValidationIssue::InvalidRetry {
                        field,
                        message: format!("{value} is not a valid number of seconds"),
                    });
                }
            }
        }

        let mut rules = Vec::with_capacity(self.rules.len());
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.pattern.is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule: rule.label(index),
                    field: "pattern",
                });
                continue;
            }
            match rule.compile() {
                Ok(compiled) => rules.push(compiled),
                Err(err) => issues.push(ValidationIssue::InvalidRule {
                    rule: rule.label(index),
                    message: err.to_string(),
                }),
            }
        }

        if self
            .filter
            .exclude_prefixes
            .iter()
            .any(|prefix| prefix.trim().is_empty())
        {
            issues.push(ValidationIssue::MissingField {
                rule: "filter".to_string(),
                field: "exclude_prefixes",
            });
        }

        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }
        Ok(RulesFile {
            retry: self.retry,
            filter: self.filter,
            rules,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    Empty,
    MissingField {
        rule: String,
        field: &'static str,
    },
    InvalidRule {
        rule: String,
        message: String,
    },
    InvalidRetry {
        field: &'static str,
        message: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::Empty => write!(f, "rules file defines no rules and no filter"),
            ValidationIssue::MissingField { rule, field } => {
                write!(f, "rule '{rule}' has an empty '{field}'")
            }
            ValidationIssue::InvalidRule { rule, message } => {
                write!(f, "rule '{rule}' is invalid: {message}")
            }
            ValidationIssue::InvalidRetry { field, message } => {
                write!(f, "'{field}' {message}")
            }
        }
    }
}
