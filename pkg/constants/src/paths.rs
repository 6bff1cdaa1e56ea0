//! Filesystem path constants.

// ─── Data directory ───────────────────────────────────────────────────────

/// Default data directory for packages, runtimes and workload state.
pub const DEFAULT_DATA_DIR: &str = "/data/data/dev.ember.app/files";

/// Subdirectory of the data dir that holds downloaded runtime packages.
pub const PACKAGES_SUBDIR: &str = "packages";

/// Subdirectory of the data dir that holds provisioned runtime roots.
pub const RUNTIMES_SUBDIR: &str = "runtimes";

// ─── Package layout ───────────────────────────────────────────────────────

/// Installation prefix the vendor packages are built against. Entry paths
/// inside a package's data archive live under this prefix and must be
/// remapped onto the flat runtime root.
pub const VENDOR_INSTALL_PREFIX: &str = "data/data/com.termux/files/usr";

/// Name of the compressed payload member inside the outer package wrapper.
pub const PACKAGE_DATA_MEMBER: &str = "data.tar.gz";

/// File extension of runtime packages on disk.
pub const PACKAGE_EXTENSION: &str = "pkg";

// ─── Host system libraries ────────────────────────────────────────────────

/// Host system directories searched for shared objects that are expected
/// by the runtime binaries but not shipped in the bundles.
pub const SYSTEM_LIB_DIRS: &[&str] = &["/system/lib64", "/system/lib"];
