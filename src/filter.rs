//! Derived, filtered copies of line-oriented files.
//!
//! The source is never modified. The derived file is written atomically so
//! readers of the output path never see a partial file.

use crate::atomic::atomic_write;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("source file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output path {0} is the source file")]
    OutputIsSource(PathBuf),
}

/// Counts from one filtering run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub output: PathBuf,
    pub kept: usize,
    pub removed: usize,
}

/// Keep the lines of `text` for which `keep` holds. Lines are passed without
/// their terminator; kept lines retain theirs.
pub fn filter_text<P>(text: &str, keep: P) -> (String, usize, usize)
where
    P: Fn(&str) -> bool,
{
    let mut out = String::with_capacity(text.len());
    let (mut kept, mut removed) = (0, 0);
    for segment in text.split_inclusive('\n') {
        let line = segment
            .strip_suffix('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .unwrap_or(segment);
        if keep(line) {
            out.push_str(segment);
            kept += 1;
        } else {
            removed += 1;
        }
    }
    (out, kept, removed)
}

/// Write the lines of `source` for which `keep` holds to `output`.
pub fn filter_lines<P>(source: &Path, output: &Path, keep: P) -> Result<FilterReport, FilterError>
where
    P: Fn(&str) -> bool,
{
    let text = fs::read_to_string(source).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => FilterError::NotFound(source.to_path_buf()),
        _ => FilterError::Read {
            path: source.to_path_buf(),
            source: err,
        },
    })?;

    if same_file(source, output) {
        return Err(FilterError::OutputIsSource(output.to_path_buf()));
    }

    let (filtered, kept, removed) = filter_text(&text, keep);
    atomic_write(output, filtered.as_bytes()).map_err(|source| FilterError::Write {
        path: output.to_path_buf(),
        source,
    })?;

    tracing::debug!(
        source = %source.display(),
        output = %output.display(),
        kept,
        removed,
        "derived file written"
    );
    Ok(FilterReport {
        output: output.to_path_buf(),
        kept,
        removed,
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Packaging tools a derived requirements file usually leaves out.
pub const BUILD_TOOL_PACKAGES: [&str; 3] = ["pip", "setuptools", "wheel"];

/// Exclusion predicates for requirement-style files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineFilter {
    exclude_prefixes: Vec<String>,
    exclude_packages: Vec<String>,
}

impl LineFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop lines starting with `prefix` (leading whitespace ignored).
    pub fn exclude_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.exclude_prefixes.push(prefix.into());
        self
    }

    /// Drop requirement lines naming any of `names`, compared after
    /// normalization. Editable and URL requirements are always kept.
    pub fn exclude_packages<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exclude_packages.extend(
            names
                .into_iter()
                .map(|n| normalize_name(n.as_ref().trim()))
                .filter(|n| !n.is_empty()),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exclude_prefixes.is_empty() && self.exclude_packages.is_empty()
    }

    pub fn keeps(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        if self
            .exclude_prefixes
            .iter()
            .any(|prefix| trimmed.starts_with(prefix.as_str()))
        {
            return false;
        }
        if self.exclude_packages.is_empty() || is_unnamed_requirement(trimmed) {
            return true;
        }
        match requirement_name(trimmed) {
            Some(name) => !self.exclude_packages.contains(&name),
            None => true,
        }
    }
}

fn is_unnamed_requirement(line: &str) -> bool {
    line.starts_with("-e ") || line.starts_with("git+") || line.starts_with("http")
}

/// The distribution name at the start of a requirement line, normalized.
/// Comments and blank lines have none.
pub fn requirement_name(line: &str) -> Option<String> {
    let line = line.trim_start();
    if line.starts_with('#') {
        return None;
    }
    let end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(line.len());
    let name = normalize_name(&line[..end]);
    (!name.is_empty()).then_some(name)
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase().replace(['_', '.'], "-")
}
