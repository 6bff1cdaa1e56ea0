//! Package archive extraction.
//!
//! A runtime package is a layered container: an outer (uncompressed) tar
//! wrapper holding metadata members plus a `data.tar.gz` payload, which is
//! itself a gzip-compressed tar of the actual files. Extraction streams
//! the inner tar straight out of the outer entry — the payload is never
//! materialized on disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::layout::LayoutMapper;
use crate::links::link_or_copy;

/// Decodes runtime packages into a destination runtime root.
///
/// Carries a call counter so provisioning idempotence is observable:
/// a second `ensure_installed` for an already-valid version must not
/// touch the extraction path at all.
#[derive(Debug, Default)]
pub struct BundleExtractor {
    extractions: AtomicU64,
}

impl BundleExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `extract` has run since construction.
    pub fn extraction_count(&self) -> u64 {
        self.extractions.load(Ordering::Relaxed)
    }

    /// Extract `package` into `dest_root`, remapping every entry path via
    /// `mapper`. Entries the mapper cannot place are silently skipped.
    /// Returns the number of filesystem entries written.
    pub async fn extract(
        &self,
        bundle: &str,
        package: &Path,
        mapper: &LayoutMapper,
        dest_root: &Path,
    ) -> Result<u64, ProvisionError> {
        self.extractions.fetch_add(1, Ordering::Relaxed);

        let bundle = bundle.to_string();
        let package = package.to_path_buf();
        let mapper = mapper.clone();
        let dest_root = dest_root.to_path_buf();

        let written = tokio::task::spawn_blocking(move || {
            extract_blocking(&bundle, &package, &mapper, &dest_root)
        })
        .await??;

        Ok(written)
    }
}

fn extract_blocking(
    bundle: &str,
    package: &Path,
    mapper: &LayoutMapper,
    dest_root: &Path,
) -> Result<u64, ProvisionError> {
    let corrupt = |reason: String| ProvisionError::CorruptArchive {
        bundle: bundle.to_string(),
        reason,
    };

    let file = std::fs::File::open(package).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProvisionError::PackageMissing {
                bundle: bundle.to_string(),
                path: package.to_path_buf(),
            }
        } else {
            ProvisionError::Io(e)
        }
    })?;

    // Walk the outer wrapper looking for the compressed payload.
    let mut outer = tar::Archive::new(file);
    for entry in outer.entries().map_err(|e| corrupt(e.to_string()))? {
        let entry = entry.map_err(|e| corrupt(e.to_string()))?;
        let is_payload = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_os_string()))
            .is_some_and(|n| n == pkg_constants::paths::PACKAGE_DATA_MEMBER);
        if is_payload {
            let decoder = flate2::read::GzDecoder::new(entry);
            return extract_payload(bundle, decoder, mapper, dest_root);
        }
    }

    Err(corrupt(format!(
        "no {} member in package wrapper",
        pkg_constants::paths::PACKAGE_DATA_MEMBER
    )))
}

fn extract_payload(
    bundle: &str,
    reader: impl std::io::Read,
    mapper: &LayoutMapper,
    dest_root: &Path,
) -> Result<u64, ProvisionError> {
    let corrupt = |reason: String| ProvisionError::CorruptArchive {
        bundle: bundle.to_string(),
        reason,
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut written = 0u64;

    // Both link kinds can appear before the entry they point at within the
    // same tar, and the tar crate's unpack() resolves hard link targets
    // against the current working directory. Collect both and create them
    // in a second pass using absolute paths, once every regular file is on
    // disk. Same approach as layered-image extraction.
    let mut deferred_hard_links: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut deferred_symlinks: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry in archive.entries().map_err(|e| corrupt(e.to_string()))? {
        let mut entry = entry.map_err(|e| corrupt(e.to_string()))?;
        let entry_path = entry.path().map_err(|e| corrupt(e.to_string()))?.into_owned();

        let Some(rel) = mapper.map(&entry_path) else {
            debug!("skipping unmapped entry {}", entry_path.display());
            continue;
        };
        let dest = dest_root.join(&rel);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&dest)?;
            }
            tar::EntryType::Link => {
                let Some(link_name) = entry.link_name().map_err(|e| corrupt(e.to_string()))?
                else {
                    continue;
                };
                // Hard link targets must land inside the runtime root too.
                if let Some(src_rel) = mapper.map(&link_name) {
                    deferred_hard_links.push((dest_root.join(src_rel), dest));
                } else {
                    debug!("skipping hard link to unmapped target {}", link_name.display());
                }
            }
            tar::EntryType::Symlink => {
                let Some(link_name) = entry.link_name().map_err(|e| corrupt(e.to_string()))?
                else {
                    continue;
                };
                // Absolute vendor targets are remapped; relative targets
                // stay relative so the runtime root remains relocatable.
                let target = if link_name.is_absolute() {
                    match mapper.map(&link_name) {
                        Some(rel) => dest_root.join(rel),
                        None => {
                            debug!(
                                "skipping symlink to unmapped target {}",
                                link_name.display()
                            );
                            continue;
                        }
                    }
                } else {
                    link_name.into_owned()
                };
                deferred_symlinks.push((dest, target));
            }
            _ => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                // A previous partial extraction may have left a read-only
                // file the tar crate cannot overwrite.
                if dest.exists() && !dest.is_dir() {
                    let _ = std::fs::set_permissions(
                        &dest,
                        std::os::unix::fs::PermissionsExt::from_mode(0o644),
                    );
                    let _ = std::fs::remove_file(&dest);
                }
                if let Err(e) = entry.unpack(&dest) {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        continue;
                    }
                    return Err(corrupt(format!(
                        "failed to unpack `{}`: {e}",
                        dest.display()
                    )));
                }
                written += 1;
            }
        }
    }

    // Hard links: every regular file is on disk now.
    for (link_src, dest) in deferred_hard_links {
        if dest.exists() {
            continue;
        }
        if link_src.exists() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::hard_link(&link_src, &dest)?;
            written += 1;
        }
        // If link_src still doesn't exist the target was skipped — skip too.
    }

    // Symlinks: creation failures degrade to a copy of the target, and a
    // copy failure is only a warning — the versioned file stays usable.
    for (link, target) in deferred_symlinks {
        if link.exists() {
            continue;
        }
        match link_or_copy(&target, &link) {
            Ok(_) => written += 1,
            Err(e) => warn!(
                "could not create link {} -> {}: {}",
                link.display(),
                target.display(),
                e
            ),
        }
    }

    info!("extracted {} entries from bundle `{}`", written, bundle);
    Ok(written)
}
