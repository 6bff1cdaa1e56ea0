//! Idempotent runtime provisioning.
//!
//! `ensure_installed(version)` owns the on-device runtime directory tree.
//! An installation is all-or-nothing: any failure removes the partial
//! directory entirely before the error is returned, so a directory that
//! exists and passes the validity check is always usable.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ProvisionError;
use crate::extract::BundleExtractor;
use crate::layout::LayoutMapper;
use crate::links::LinkRepairer;

/// Directory layout the provisioner operates on.
#[derive(Debug, Clone)]
pub struct ProvisionerPaths {
    /// Where downloaded runtime packages live (`<bundle>.pkg`).
    pub packages_dir: PathBuf,
    /// Where provisioned runtime roots are created.
    pub runtimes_dir: PathBuf,
    /// Host directories searched during link repair, in priority order.
    pub host_lib_dirs: Vec<PathBuf>,
}

impl ProvisionerPaths {
    /// Standard layout under a data directory.
    pub fn under(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            packages_dir: data_dir.join(pkg_constants::paths::PACKAGES_SUBDIR),
            runtimes_dir: data_dir.join(pkg_constants::paths::RUNTIMES_SUBDIR),
            host_lib_dirs: pkg_constants::paths::SYSTEM_LIB_DIRS
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

impl Default for ProvisionerPaths {
    fn default() -> Self {
        Self::under(pkg_constants::paths::DEFAULT_DATA_DIR)
    }
}

/// Orchestrates extraction, layout normalization and link repair into a
/// single "ensure runtime version V is installed" operation.
pub struct RuntimeProvisioner {
    paths: ProvisionerPaths,
    mapper: LayoutMapper,
    extractor: BundleExtractor,
    /// One async lock per version — racing installs of the same version
    /// are serialized across the check-and-install window.
    install_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RuntimeProvisioner {
    pub fn new(paths: ProvisionerPaths) -> Self {
        Self {
            paths,
            mapper: LayoutMapper::vendor(),
            extractor: BundleExtractor::new(),
            install_locks: DashMap::new(),
        }
    }

    /// Mapper override for tests that build packages against a short prefix.
    pub fn with_mapper(paths: ProvisionerPaths, mapper: LayoutMapper) -> Self {
        Self {
            paths,
            mapper,
            extractor: BundleExtractor::new(),
            install_locks: DashMap::new(),
        }
    }

    /// Root directory of a runtime version (whether or not installed).
    pub fn runtime_root(&self, version: &str) -> PathBuf {
        self.paths
            .runtimes_dir
            .join(pkg_constants::runtime::runtime_dir_name(version))
    }

    /// How many archive extractions this provisioner has performed.
    /// A repeated `ensure_installed` for a valid version adds zero.
    pub fn extraction_count(&self) -> u64 {
        self.extractor.extraction_count()
    }

    /// Whether a version is fully installed. Directory existence alone is
    /// not enough — a previous run may have been interrupted mid-write.
    /// Checks the entry point (present, executable, non-empty) and the
    /// repaired C++ runtime library (present, non-empty).
    pub fn is_installed(&self, version: &str) -> bool {
        let root = self.runtime_root(version);
        let entrypoint = root.join("bin").join(pkg_constants::runtime::RUNTIME_ENTRYPOINT);
        let Ok(meta) = std::fs::metadata(&entrypoint) else {
            return false;
        };
        use std::os::unix::fs::PermissionsExt;
        if meta.len() == 0 || meta.permissions().mode() & 0o111 == 0 {
            return false;
        }
        let cxx = root.join("lib").join(pkg_constants::runtime::CXX_RUNTIME_LIB);
        std::fs::metadata(&cxx).map(|m| m.len() > 0).unwrap_or(false)
    }

    /// Ensure runtime `version` is installed, reporting progress as a
    /// monotonically non-decreasing percentage. Idempotent: a valid
    /// existing install returns immediately without touching the
    /// extraction path.
    pub async fn ensure_installed<F>(
        &self,
        version: &str,
        mut progress: F,
    ) -> Result<PathBuf, ProvisionError>
    where
        F: FnMut(u8) + Send,
    {
        let root = self.runtime_root(version);

        // A concurrent install of the same version must not wipe a root
        // another caller was already told is valid. The loser of the race
        // waits here, then hits the installed check and returns early.
        let lock = self
            .install_locks
            .entry(version.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if self.is_installed(version) {
            info!("runtime {} already installed at {}", version, root.display());
            progress(100);
            return Ok(root);
        }

        // Monotonic wrapper — steps below can only push the needle forward.
        let mut last = 0u8;
        let mut report = move |pct: u8| {
            if pct > last {
                last = pct;
            }
            progress(last);
        };

        match self.install(version, &root, &mut report).await {
            Ok(()) => {
                info!("runtime {} installed at {}", version, root.display());
                Ok(root)
            }
            Err(e) => {
                // No partial state survives a failed install.
                warn!("install of runtime {} failed: {} — removing partial directory", version, e);
                let _ = std::fs::remove_dir_all(&root);
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        version: &str,
        root: &Path,
        report: &mut (dyn FnMut(u8) + Send),
    ) -> Result<(), ProvisionError> {
        report(0);

        // Wipe whatever an interrupted run left behind.
        if root.exists() {
            std::fs::remove_dir_all(root)?;
        }
        std::fs::create_dir_all(root)?;
        report(5);

        // Dependency bundles first — they stay within the first half of
        // the progress range, reserving the rest for the runtime itself.
        let deps = pkg_constants::runtime::DEPENDENCY_BUNDLES;
        for (i, dep) in deps.iter().enumerate() {
            self.extract_bundle(dep, root).await?;
            report(5 + ((i + 1) * 45 / deps.len().max(1)) as u8);
        }

        let main = pkg_constants::runtime::runtime_bundle_name(version);
        self.extract_bundle(&main, root).await?;
        report(85);

        LinkRepairer::repair(&root.join("lib"), &self.paths.host_lib_dirs)?;
        report(95);

        mark_executable(&root.join("bin"))?;
        report(100);
        Ok(())
    }

    async fn extract_bundle(&self, bundle: &str, root: &Path) -> Result<(), ProvisionError> {
        let package = self
            .paths
            .packages_dir
            .join(format!("{bundle}.{}", pkg_constants::paths::PACKAGE_EXTENSION));
        if !package.exists() {
            return Err(ProvisionError::PackageMissing {
                bundle: bundle.to_string(),
                path: package,
            });
        }
        let written = self
            .extractor
            .extract(bundle, &package, &self.mapper, root)
            .await?;
        info!("bundle `{}`: {} entries into {}", bundle, written, root.display());
        Ok(())
    }
}

/// Mark every regular file directly under `bin_dir` executable.
fn mark_executable(bin_dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if !bin_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(bin_dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            let mode = meta.permissions().mode() | 0o755;
            std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testpkg::{TestEntry, temp_dir, write_package};

    const PREFIX: &str = "data/data/com.termux/files/usr";

    /// Build a complete fake package source: all dependency bundles plus
    /// the main runtime bundle, and a host lib dir with the C++ runtime.
    fn fake_source(base: &Path, version: &str) -> ProvisionerPaths {
        let packages_dir = base.join("packages");
        std::fs::create_dir_all(&packages_dir).unwrap();

        for dep in pkg_constants::runtime::DEPENDENCY_BUNDLES {
            write_package(
                &packages_dir.join(format!("{dep}.pkg")),
                &[TestEntry::File {
                    path: &format!("{PREFIX}/lib/{dep}.so.1"),
                    data: b"support-lib",
                    mode: 0o644,
                }],
            );
        }

        write_package(
            &packages_dir.join(format!("openjdk-{version}.pkg")),
            &[
                TestEntry::File {
                    path: &format!("{PREFIX}/opt/openjdk-{version}/bin/java"),
                    data: b"#!jvm-launcher",
                    mode: 0o644, // chmod step must fix this up
                },
                TestEntry::File {
                    path: &format!("{PREFIX}/opt/openjdk-{version}/lib/server/libjvm.so"),
                    data: b"jvm",
                    mode: 0o644,
                },
            ],
        );

        let host_libs = base.join("system-libs");
        std::fs::create_dir_all(&host_libs).unwrap();
        std::fs::write(
            host_libs.join(pkg_constants::runtime::CXX_RUNTIME_LIB),
            b"host cxx",
        )
        .unwrap();

        ProvisionerPaths {
            packages_dir,
            runtimes_dir: base.join("runtimes"),
            host_lib_dirs: vec![host_libs],
        }
    }

    fn provisioner(paths: ProvisionerPaths) -> RuntimeProvisioner {
        RuntimeProvisioner::with_mapper(paths, LayoutMapper::new(PREFIX))
    }

    #[tokio::test]
    async fn test_full_install() {
        let base = temp_dir("install-full");
        let p = provisioner(fake_source(&base, "21"));

        assert!(!p.is_installed("21"));
        let root = p.ensure_installed("21", |_| {}).await.unwrap();
        assert!(p.is_installed("21"));

        use std::os::unix::fs::PermissionsExt;
        let java = std::fs::metadata(root.join("bin/java")).unwrap();
        assert_ne!(java.permissions().mode() & 0o111, 0);
        assert!(root.join("lib/server/libjvm.so").exists());
        // Link repair ran: C++ runtime sourced from the host dir, and the
        // versioned support libs got unversioned aliases.
        assert!(root.join("lib").join(pkg_constants::runtime::CXX_RUNTIME_LIB).exists());
        for dep in pkg_constants::runtime::DEPENDENCY_BUNDLES {
            assert!(root.join(format!("lib/{dep}.so")).exists(), "alias for {dep}");
        }
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_idempotent_provisioning() {
        let base = temp_dir("install-idempotent");
        let p = provisioner(fake_source(&base, "21"));

        p.ensure_installed("21", |_| {}).await.unwrap();
        let after_first = p.extraction_count();
        assert!(after_first > 0);

        // Second call must not touch the extraction path.
        let root = p.ensure_installed("21", |_| {}).await.unwrap();
        assert_eq!(p.extraction_count(), after_first);
        assert!(root.join("bin/java").exists());
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_all_or_nothing_on_failure() {
        let base = temp_dir("install-atomic");
        let mut paths = fake_source(&base, "21");
        // Remove the main bundle: dependency extraction succeeds, then
        // the install fails partway through.
        std::fs::remove_file(paths.packages_dir.join("openjdk-21.pkg")).unwrap();
        let p = provisioner(paths.clone());

        let err = p.ensure_installed("21", |_| {}).await.unwrap_err();
        assert!(matches!(err, ProvisionError::PackageMissing { .. }));
        assert!(!p.runtime_root("21").exists(), "partial install must be removed");

        // A later run starts fresh rather than resuming.
        paths = fake_source(&base, "21");
        let p2 = provisioner(paths);
        p2.ensure_installed("21", |_| {}).await.unwrap();
        assert!(p2.is_installed("21"));
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_racing_installs_do_not_wipe_a_valid_root() {
        let base = temp_dir("install-race");
        let p = provisioner(fake_source(&base, "21"));

        let (a, b) = tokio::join!(
            p.ensure_installed("21", |_| {}),
            p.ensure_installed("21", |_| {}),
        );
        a.unwrap();
        b.unwrap();

        // Exactly one install ran: the loser of the race waited on the
        // version lock, then saw the winner's valid root and returned
        // without touching the extraction path.
        let per_install = pkg_constants::runtime::DEPENDENCY_BUNDLES.len() as u64 + 1;
        assert_eq!(p.extraction_count(), per_install);
        assert!(p.is_installed("21"));
        assert!(p.runtime_root("21").join("bin/java").exists());
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_interrupted_install_is_not_reported_installed() {
        let base = temp_dir("install-partial");
        let p = provisioner(fake_source(&base, "21"));

        // Simulate a prior interrupted run: directory exists, entry point
        // is an empty file.
        let root = p.runtime_root("21");
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("bin/java"), b"").unwrap();
        assert!(!p.is_installed("21"));

        // ensure_installed recovers with a full fresh extraction.
        p.ensure_installed("21", |_| {}).await.unwrap();
        assert!(p.is_installed("21"));
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_completes() {
        let base = temp_dir("install-progress");
        let p = provisioner(fake_source(&base, "17"));

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
        let sink = seen.clone();
        p.ensure_installed("17", move |pct| sink.lock().unwrap().push(pct))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
        assert_eq!(*seen.last().unwrap(), 100);
        // Dependency extraction stays within the first half of the range.
        let dep_count = pkg_constants::runtime::DEPENDENCY_BUNDLES.len();
        assert!(seen.iter().take(1 + dep_count + 1).all(|&p| p <= 50));
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_missing_dependency_bundle_is_structural() {
        let base = temp_dir("install-missing-dep");
        let paths = fake_source(&base, "21");
        let dep = pkg_constants::runtime::DEPENDENCY_BUNDLES[0];
        std::fs::remove_file(paths.packages_dir.join(format!("{dep}.pkg"))).unwrap();

        let p = provisioner(paths);
        let err = p.ensure_installed("21", |_| {}).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(!p.runtime_root("21").exists());
        let _ = std::fs::remove_dir_all(&base);
    }
}
