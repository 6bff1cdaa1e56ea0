//! Provisioning error taxonomy.
//!
//! Callers need to distinguish "retry might help" (transient I/O) from
//! "this version's packaging is broken" (structural). Everything the
//! provisioner returns is one of these variants.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while provisioning a runtime version.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The package file for a required bundle is not on disk.
    #[error("package for bundle `{bundle}` not found at {path}")]
    PackageMissing { bundle: String, path: PathBuf },

    /// The package exists but its archive layers could not be decoded.
    #[error("corrupt archive in bundle `{bundle}`: {reason}")]
    CorruptArchive { bundle: String, reason: String },

    /// Neither symlink creation nor file copy succeeded for a library
    /// the runtime cannot start without.
    #[error("link repair failed for `{library}`: {reason}")]
    LinkRepair { library: String, reason: String },

    /// Plain filesystem failure writing into the runtime root.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A blocking extraction task panicked or was cancelled.
    #[error("extraction task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ProvisionError {
    /// Whether retrying the install could plausibly succeed without any
    /// change to the package source.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvisionError::Io(_) | ProvisionError::Task(_))
    }
}
