//! Post-extraction link repair.
//!
//! The host sandbox cannot represent every link the packages assume:
//! the C++ runtime shared object lives on the host system instead of in
//! the bundles, and versioned libraries frequently ship without their
//! unversioned alias. Both are fixed up here after extraction.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::ProvisionError;

/// How a link request was ultimately satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Symlinked,
    /// Symlink creation was refused by the environment — the target's
    /// content was copied instead. The binary stays runnable.
    Copied,
}

/// Create `link` pointing at `target`, falling back to a file copy when
/// the environment refuses symlink creation.
pub fn link_or_copy(target: &Path, link: &Path) -> std::io::Result<LinkOutcome> {
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::os::unix::fs::symlink(target, link) {
        Ok(()) => Ok(LinkOutcome::Symlinked),
        Err(e) => {
            warn!(
                "symlink {} -> {} refused ({}), copying instead",
                link.display(),
                target.display(),
                e
            );
            // Relative targets resolve against the link's directory.
            let resolved = if target.is_absolute() {
                target.to_path_buf()
            } else {
                link.parent().unwrap_or(Path::new(".")).join(target)
            };
            std::fs::copy(&resolved, link)?;
            Ok(LinkOutcome::Copied)
        }
    }
}

/// Repairs the `lib/` directory of a freshly extracted runtime root.
pub struct LinkRepairer;

impl LinkRepairer {
    /// Run both repair passes over `lib_dir`.
    pub fn repair(lib_dir: &Path, host_lib_dirs: &[PathBuf]) -> Result<(), ProvisionError> {
        Self::ensure_cxx_runtime(lib_dir, host_lib_dirs)?;
        Self::create_versioned_aliases(lib_dir)?;
        Ok(())
    }

    /// Make sure the C++ runtime shared object is reachable under the name
    /// the runtime binaries expect, sourcing it from a host system location
    /// when the bundles did not ship it.
    ///
    /// This is deliberately a single hard-coded library — the only one the
    /// bundles are known to omit. It is not a general dependency resolver.
    pub fn ensure_cxx_runtime(
        lib_dir: &Path,
        host_lib_dirs: &[PathBuf],
    ) -> Result<(), ProvisionError> {
        let name = pkg_constants::runtime::CXX_RUNTIME_LIB;
        let dest = lib_dir.join(name);
        if non_empty_file(&dest) {
            debug!("{} already present in {}", name, lib_dir.display());
            return Ok(());
        }

        let Some(source) = host_lib_dirs
            .iter()
            .map(|d| d.join(name))
            .find(|p| non_empty_file(p))
        else {
            return Err(ProvisionError::LinkRepair {
                library: name.to_string(),
                reason: format!(
                    "not bundled and not found in any of: {}",
                    host_lib_dirs
                        .iter()
                        .map(|d| d.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        };

        match link_or_copy(&source, &dest) {
            Ok(outcome) => {
                info!(
                    "repaired {} from {} ({:?})",
                    name,
                    source.display(),
                    outcome
                );
                Ok(())
            }
            Err(e) => Err(ProvisionError::LinkRepair {
                library: name.to_string(),
                reason: format!("neither symlink nor copy from {} succeeded: {e}", source.display()),
            }),
        }
    }

    /// For every versioned shared library in `lib_dir` (e.g. `libz.so.1.3`)
    /// that lacks an unversioned alias (`libz.so`), create the alias.
    /// Alias failures are logged but never fatal — the versioned file is
    /// still loadable by its full name.
    pub fn create_versioned_aliases(lib_dir: &Path) -> Result<(), ProvisionError> {
        let mut created = 0usize;
        for entry in std::fs::read_dir(lib_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(alias) = unversioned_alias(name) else {
                continue;
            };
            let alias_path = lib_dir.join(&alias);
            if alias_path.exists() {
                continue;
            }
            // Relative target keeps the runtime root relocatable.
            match link_or_copy(Path::new(name), &alias_path) {
                Ok(_) => created += 1,
                Err(e) => warn!("could not alias {} -> {}: {}", alias, name, e),
            }
        }
        if created > 0 {
            info!("created {} unversioned library aliases in {}", created, lib_dir.display());
        }
        Ok(())
    }
}

/// `libfoo.so.1.2.3` → `libfoo.so`. `None` for anything unversioned.
fn unversioned_alias(file_name: &str) -> Option<String> {
    let idx = file_name.find(".so.")?;
    let suffix = &file_name[idx + 4..];
    if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    Some(format!("{}.so", &file_name[..idx]))
}

fn non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
