//! Reading rules files from disk or memory.

use crate::config::schema::{RulesConfig, RulesFile, ValidationError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read rules file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("rules file{} is not valid TOML: {source}", origin(.path))]
    Syntax {
        path: Option<PathBuf>,
        #[source]
        source: toml_edit::de::Error,
    },

    #[error("invalid rules file{}: {source}", origin(.path))]
    Invalid {
        path: Option<PathBuf>,
        #[source]
        source: ValidationError,
    },
}

fn origin(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|path| format!(" {}", path.display()))
        .unwrap_or_default()
}

/// Parse and compile a rules file held in memory.
pub fn load_from_str(input: &str) -> Result<RulesFile, ConfigError> {
    parse(input, None)
}

/// Read, parse and compile the rules file at `path`. Errors name the file.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RulesFile, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&contents, Some(path))
}

fn parse(input: &str, path: Option<&Path>) -> Result<RulesFile, ConfigError> {
    let raw: RulesConfig =
        toml_edit::de::from_str(input).map_err(|source| ConfigError::Syntax {
            path: path.map(Path::to_path_buf),
            source,
        })?;
    raw.compile().map_err(|source| ConfigError::Invalid {
        path: path.map(Path::to_path_buf),
        source,
    })
}
