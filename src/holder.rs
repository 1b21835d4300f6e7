//! Lock-holder diagnostics.
//!
//! When a publish fails, the patcher asks a [`ProcessLister`] which running
//! processes mention the target path on their command line. Platforms
//! without process introspection use [`NullLister`] and the patcher simply
//! retries without diagnostics.

use serde::Serialize;
use std::fmt;
use std::io;

/// A process suspected of keeping the target file open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub process_id: u32,
    pub process_name: String,
    pub command_line: String,
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid {} ({}): {}",
            self.process_id, self.process_name, self.command_line
        )
    }
}

/// Capability for finding, and optionally terminating, holder processes.
pub trait ProcessLister {
    /// Processes whose command line contains `needle`, excluding the
    /// current process.
    fn find_by_command_line_substring(&self, needle: &str) -> Vec<LockHolder>;

    /// Terminate `holder`. Destructive; only called in force mode.
    fn terminate(&self, holder: &LockHolder) -> io::Result<()> {
        let _ = holder;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process termination is not supported on this platform",
        ))
    }
}

/// Lister for platforms without process introspection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLister;

impl ProcessLister for NullLister {
    fn find_by_command_line_substring(&self, _needle: &str) -> Vec<LockHolder> {
        Vec::new()
    }
}

/// Linux lister backed by `/proc/<pid>/cmdline` and `/proc/<pid>/comm`.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcfsLister {
    root: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
impl Default for ProcfsLister {
    fn default() -> Self {
        Self {
            root: std::path::PathBuf::from("/proc"),
        }
    }
}

#[cfg(target_os = "linux")]
impl ProcfsLister {
    /// Scan a procfs-shaped directory other than `/proc` (for testing).
    pub fn with_root(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_holder(dir: &std::path::Path, pid: u32) -> Option<LockHolder> {
        let raw = std::fs::read(dir.join("cmdline")).ok()?;
        // Kernel threads have an empty cmdline.
        if raw.is_empty() {
            return None;
        }
        let command_line = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join(" ");
        let process_name = std::fs::read_to_string(dir.join("comm"))
            .map(|name| name.trim_end().to_string())
            .unwrap_or_default();
        Some(LockHolder {
            process_id: pid,
            process_name,
            command_line,
        })
    }
}

#[cfg(target_os = "linux")]
impl ProcessLister for ProcfsLister {
    fn find_by_command_line_substring(&self, needle: &str) -> Vec<LockHolder> {
        let own_pid = std::process::id();
        let mut holders = Vec::new();

        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            // The process may exit between listing and reading.
            let Some(holder) = Self::read_holder(entry.path(), pid) else {
                continue;
            };
            if holder.command_line.contains(needle) {
                holders.push(holder);
            }
        }

        holders.sort_by_key(|h| h.process_id);
        tracing::debug!(needle, found = holders.len(), "scanned process list");
        holders
    }

    fn terminate(&self, holder: &LockHolder) -> io::Result<()> {
        signal_terminate(holder.process_id)
    }
}

/// Send `SIGTERM` to `pid`.
#[cfg(unix)]
pub fn signal_terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: `kill(2)` is memory-safe for any pid; invalid pids yield ESRCH.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// The best lister available on this platform.
pub fn default_lister() -> Box<dyn ProcessLister> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcfsLister::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(NullLister)
    }
}
