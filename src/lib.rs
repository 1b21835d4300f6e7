//! patch-file: idempotent in-place text patching with atomic publish
//!
//! Rewrites line-oriented text files (dependency manifests, config lists)
//! with whole-line rules, and publishes the result without ever exposing a
//! partially written file.
//!
//! # Architecture
//!
//! - [`rule`]: line-anchored [`RewriteRule`]s and the pure rewrite pass
//! - [`patcher`]: the [`Patcher`] state machine (backup, temp, publish,
//!   verify) and its retry loop
//! - [`holder`]: the [`ProcessLister`] capability used to name processes
//!   that may be holding the target open
//! - [`filter`]: filtered, derived copies of a file
//! - [`config`]: TOML rules files
//!
//! # Safety
//!
//! - Unchanged files are never written, backed up or touched
//! - Single-generation backup at `<target>.bak` before any publish
//! - Temp file in the target's directory, fsync, then rename
//! - Published content is re-read and hash-verified
//! - Process termination only in explicit force mode
//!
//! # Example
//!
//! ```no_run
//! use patch_file::{Patcher, PatchResult, RewriteRule};
//! use std::path::Path;
//!
//! let rule = RewriteRule::literal("gradio_client==1.13.1", "gradio_client>=1.13.1,<2.0")?;
//!
//! match Patcher::new().apply(Path::new("requirements.txt"), &[rule])? {
//!     PatchResult::Applied { backup, .. } => println!("patched, backup at {}", backup.display()),
//!     PatchResult::Unchanged { .. } => println!("already patched"),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod atomic;
pub mod config;
pub mod filter;
pub mod holder;
pub mod patcher;
pub mod rule;

// Re-exports
pub use config::{load_from_path, load_from_str, ConfigError, RulesFile};
pub use filter::{filter_lines, FilterError, FilterReport, LineFilter};
pub use holder::{default_lister, LockHolder, NullLister, ProcessLister};
pub use patcher::{
    FileReplacer, LockedError, PatchError, PatchResult, Patcher, Preview, PublishReport,
    RenameReplacer, RetryPolicy, TerminateFailed,
};
pub use rule::{rewrite_text, Rewrite, RewriteRule, RuleError};

#[cfg(target_os = "linux")]
pub use holder::ProcfsLister;
