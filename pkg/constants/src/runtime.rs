//! Runtime provisioning constants.

/// Runtime versions the provisioner knows how to install.
pub const SUPPORTED_RUNTIME_VERSIONS: &[&str] = &["17", "21"];

/// Default runtime version when none is specified.
pub const DEFAULT_RUNTIME_VERSION: &str = "21";

/// Support bundles that must be extracted into the runtime root before
/// the main runtime bundle (shared libraries the runtime links against).
pub const DEPENDENCY_BUNDLES: &[&str] = &["libandroid-support", "libiconv"];

/// Entry-point binary inside the runtime root's `bin/` directory.
pub const RUNTIME_ENTRYPOINT: &str = "java";

/// C++ runtime shared object the runtime binaries expect under `lib/`.
/// Not shipped in the bundles — repaired from a host system location.
pub const CXX_RUNTIME_LIB: &str = "libc++_shared.so";

/// Directory name of a provisioned runtime root: `openjdk-<version>`.
pub fn runtime_dir_name(version: &str) -> String {
    format!("openjdk-{version}")
}

/// Package file name of the main runtime bundle for a version.
pub fn runtime_bundle_name(version: &str) -> String {
    format!("openjdk-{version}")
}
