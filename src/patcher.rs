//! The patch engine: rewrite, back up, write temp, publish, verify.
//!
//! `apply` walks the whole state machine:
//!
//! ```text
//! Read -> Rewrite -> Unchanged                      (done, nothing written)
//!                 -> Backup -> WriteTemp -> Publish -> Verify -> Applied
//!                                             |
//!                                             +-> retry loop: diagnose holders,
//!                                                 [terminate], sleep, retry
//!                                             +-> LockedError (temp + backup kept)
//! ```
//!
//! The only cross-process guarantee is the same-directory rename in the
//! publish step.

use crate::atomic::{backup_path, create_backup, write_sibling_temp};
use crate::holder::{default_lister, LockHolder, ProcessLister};
use crate::rule::{rewrite_text, Rewrite, RewriteRule};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(2);

/// Bounds for the publish retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total publish attempts, including the first. Values below 1 act as 1.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub sleep: Duration,
    /// Wall-clock budget for the whole loop, checked before each sleep.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            sleep: DEFAULT_SLEEP,
            deadline: None,
        }
    }
}

/// The commit primitive used by [`Patcher::publish`].
pub trait FileReplacer {
    fn replace(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Plain `rename(2)`: atomic when both paths share a filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameReplacer;

impl FileReplacer for RenameReplacer {
    fn replace(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

impl<F> FileReplacer for F
where
    F: Fn(&Path, &Path) -> io::Result<()>,
{
    fn replace(&self, from: &Path, to: &Path) -> io::Result<()> {
        self(from, to)
    }
}

/// A holder that could not be terminated in force mode. Non-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("failed to terminate {holder}: {reason}")]
pub struct TerminateFailed {
    pub holder: LockHolder,
    pub reason: String,
}

/// What happened during a publish, successful or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub attempts: u32,
    /// Holders found after the most recent failed attempt.
    pub last_holders: Vec<LockHolder>,
    pub terminated: Vec<LockHolder>,
    pub termination_failures: Vec<TerminateFailed>,
}

/// Publish gave up. The target is untouched; the pending content sits in
/// `temp_path` and the pre-patch content in `backup_path`.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error(
    "could not publish {target} after {attempts} attempt(s): {last_error}; pending content left at {temp_path}"
)]
pub struct LockedError {
    pub target: PathBuf,
    pub attempts: u32,
    pub holders: Vec<LockHolder>,
    pub temp_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub last_error: String,
    pub terminated: Vec<LockHolder>,
    pub termination_failures: Vec<TerminateFailed>,
}

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("target file not found: {0}")]
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

    #[error(transparent)]
    Locked(#[from] LockedError),

    #[error("published content of {path} does not match the rewrite; restore from {backup}")]
    VerificationFailed { path: PathBuf, backup: PathBuf },
}

/// Outcome of [`Patcher::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
#[must_use = "PatchResult should be checked for applied/unchanged"]
pub enum PatchResult {
    /// No rule changed the text; nothing was written.
    Unchanged { file: PathBuf },
    /// The rewrite was published and verified.
    Applied {
        file: PathBuf,
        backup: PathBuf,
        substitutions: usize,
        publish: PublishReport,
    },
}

impl fmt::Display for PatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchResult::Unchanged { file } => write!(f, "Unchanged: {}", file.display()),
            PatchResult::Applied {
                file,
                substitutions,
                publish,
                ..
            } => write!(
                f,
                "Applied {} substitution(s) to {} ({} attempt(s))",
                substitutions,
                file.display(),
                publish.attempts
            ),
        }
    }
}

/// Read-only view of what `apply` would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub file: PathBuf,
    pub original: String,
    pub rewrite: Rewrite,
}

impl Preview {
    pub fn is_changed(&self) -> bool {
        self.rewrite.changed_from(&self.original)
    }
}

/// Applies rule sets to files and publishes the result atomically.
pub struct Patcher {
    policy: RetryPolicy,
    force_terminate: bool,
    lister: Box<dyn ProcessLister>,
    replacer: Box<dyn FileReplacer>,
}

impl Default for Patcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Patcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patcher")
            .field("policy", &self.policy)
            .field("force_terminate", &self.force_terminate)
            .finish_non_exhaustive()
    }
}

impl Patcher {
    /// Default policy, platform process lister, plain rename, no force mode.
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
            force_terminate: false,
            lister: default_lister(),
            replacer: Box::new(RenameReplacer),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Terminate identified holders between attempts. Destructive.
    pub fn with_force_terminate(mut self, enabled: bool) -> Self {
        self.force_terminate = enabled;
        self
    }

    pub fn with_lister(mut self, lister: impl ProcessLister + 'static) -> Self {
        self.lister = Box::new(lister);
        self
    }

    pub fn with_replacer(mut self, replacer: impl FileReplacer + 'static) -> Self {
        self.replacer = Box::new(replacer);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Compute the rewrite for `target` without touching the filesystem.
    pub fn preview(&self, target: &Path, rules: &[RewriteRule]) -> Result<Preview, PatchError> {
        let file = resolve_target(target)?;
        let original = read_target(&file)?;
        let rewrite = rewrite_text(&original, rules);
        Ok(Preview {
            file,
            original,
            rewrite,
        })
    }

    /// Rewrite `target` with `rules` and publish the result in place.
    pub fn apply(&self, target: &Path, rules: &[RewriteRule]) -> Result<PatchResult, PatchError> {
        let Preview {
            file,
            original,
            rewrite,
        } = self.preview(target, rules)?;

        if !rewrite.changed_from(&original) {
            debug!(file = %file.display(), "no rule changed the file");
            return Ok(PatchResult::Unchanged { file });
        }

        if rewrite_text(&rewrite.text, rules).changed_from(&rewrite.text) {
            warn!(
                file = %file.display(),
                "rule set is not idempotent: a second run would change the file again"
            );
        }

        let backup = create_backup(&file).map_err(|source| PatchError::Write {
            path: backup_path(&file),
            source,
        })?;
        debug!(backup = %backup.display(), "backup written");

        let temp = write_sibling_temp(&file, rewrite.text.as_bytes())
            .and_then(|temp| copy_permissions(&file, &temp).map(|()| temp))
            .map_err(|source| PatchError::Write {
                path: file.clone(),
                source,
            })?;
        debug!(temp = %temp.display(), "rewrite staged");

        let publish = self.publish(&temp, &file)?;

        let published = fs::read(&file).map_err(|source| PatchError::Read {
            path: file.clone(),
            source,
        })?;
        if xxh3_64(&published) != xxh3_64(rewrite.text.as_bytes()) {
            return Err(PatchError::VerificationFailed { path: file, backup });
        }

        info!(
            file = %file.display(),
            substitutions = rewrite.substitutions,
            attempts = publish.attempts,
            "patch published"
        );
        Ok(PatchResult::Applied {
            file,
            backup,
            substitutions: rewrite.substitutions,
            publish,
        })
    }

    /// Move `temp_path` onto `target`, retrying while the target is locked.
    ///
    /// After every failed attempt the process list is searched for commands
    /// that mention the absolute path of `target`. On exhaustion `temp_path`
    /// is left on disk.
    pub fn publish(&self, temp_path: &Path, target: &Path) -> Result<PublishReport, LockedError> {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let needle = absolute_path(target).to_string_lossy().into_owned();
        let mut report = PublishReport::default();
        let mut last_error;

        loop {
            report.attempts += 1;
            let err = match self.replacer.replace(temp_path, target) {
                Ok(()) => return Ok(report),
                Err(err) => err,
            };

            warn!(
                file = %target.display(),
                attempt = report.attempts,
                max_attempts,
                error = %err,
                "publish failed"
            );
            last_error = err.to_string();
            report.last_holders = self.lister.find_by_command_line_substring(&needle);
            for holder in &report.last_holders {
                warn!(%holder, "possible lock holder");
            }

            if report.attempts >= max_attempts || self.deadline_reached(started) {
                break;
            }

            if self.force_terminate {
                self.terminate_holders(&mut report);
            }

            thread::sleep(self.policy.sleep);
        }

        let backup = backup_path(target);
        Err(LockedError {
            target: target.to_path_buf(),
            attempts: report.attempts,
            holders: report.last_holders,
            temp_path: temp_path.to_path_buf(),
            backup_path: backup.exists().then_some(backup),
            last_error,
            terminated: report.terminated,
            termination_failures: report.termination_failures,
        })
    }

    fn deadline_reached(&self, started: Instant) -> bool {
        match self.policy.deadline {
            Some(deadline) => started.elapsed() + self.policy.sleep >= deadline,
            None => false,
        }
    }

    fn terminate_holders(&self, report: &mut PublishReport) {
        for holder in &report.last_holders {
            match self.lister.terminate(holder) {
                Ok(()) => {
                    warn!(%holder, "terminated lock holder");
                    report.terminated.push(holder.clone());
                }
                Err(err) => {
                    let failure = TerminateFailed {
                        holder: holder.clone(),
                        reason: err.to_string(),
                    };
                    warn!("{failure}");
                    report.termination_failures.push(failure);
                }
            }
        }
    }
}

fn resolve_target(target: &Path) -> Result<PathBuf, PatchError> {
    target.canonicalize().map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => PatchError::NotFound(target.to_path_buf()),
        _ => PatchError::Read {
            path: target.to_path_buf(),
            source,
        },
    })
}

/// Canonical when `path` exists, otherwise made absolute against the cwd.
fn absolute_path(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn read_target(file: &Path) -> Result<String, PatchError> {
    fs::read_to_string(file).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => PatchError::NotFound(file.to_path_buf()),
        _ => PatchError::Read {
            path: file.to_path_buf(),
            source,
        },
    })
}

fn copy_permissions(from: &Path, to: &Path) -> io::Result<()> {
    let permissions = fs::metadata(from)?.permissions();
    fs::set_permissions(to, permissions)
}
