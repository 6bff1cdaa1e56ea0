//! Maps vendor package paths onto the flat runtime root.
//!
//! Package archives are built against an absolute installation prefix
//! (see `pkg_constants::paths::VENDOR_INSTALL_PREFIX`). The runtime root
//! we launch from is flat: just `bin/` and `lib/`. Any entry path this
//! mapper cannot confidently place into one of those two trees gets no
//! destination and is skipped by the extractor.

use std::path::{Component, Path, PathBuf};

/// Translates archive entry paths into runtime-root-relative paths.
#[derive(Debug, Clone)]
pub struct LayoutMapper {
    prefix: Vec<String>,
}

impl LayoutMapper {
    /// Mapper for a custom installation prefix (tests).
    pub fn new(prefix: impl AsRef<Path>) -> Self {
        let prefix = prefix
            .as_ref()
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        Self { prefix }
    }

    /// Mapper for the vendor prefix the packages are actually built against.
    pub fn vendor() -> Self {
        Self::new(pkg_constants::paths::VENDOR_INSTALL_PREFIX)
    }

    /// Map an archive entry path onto `bin/…` or `lib/…` under the runtime
    /// root. Returns `None` for anything that cannot be placed safely:
    /// paths outside the prefix, paths with `..` components, and files the
    /// runtime does not need (docs, share/, etc.).
    pub fn map(&self, entry_path: &Path) -> Option<PathBuf> {
        let mut parts: Vec<&str> = Vec::new();
        for component in entry_path.components() {
            match component {
                Component::Normal(s) => parts.push(s.to_str()?),
                // Leading `./` and `/` are tolerated, traversal is not.
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => return None,
            }
        }

        if parts.len() < self.prefix.len() {
            return None;
        }
        let (head, rest) = parts.split_at(self.prefix.len());
        if head.iter().zip(&self.prefix).any(|(a, b)| a != b) {
            return None;
        }

        // Two shapes exist in practice: dependency bundles install straight
        // into `<prefix>/{bin,lib}`, the runtime itself installs under
        // `<prefix>/opt/<pkg>/{bin,lib}`.
        let (tree, tail) = match rest {
            ["bin", tail @ ..] => ("bin", tail),
            ["lib", tail @ ..] => ("lib", tail),
            ["opt", _pkg, "bin", tail @ ..] => ("bin", tail),
            ["opt", _pkg, "lib", tail @ ..] => ("lib", tail),
            _ => return None,
        };

        let mut dest = PathBuf::from(tree);
        for part in tail {
            dest.push(part);
        }
        Some(dest)
    }
}

impl Default for LayoutMapper {
    fn default() -> Self {
        Self::vendor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> LayoutMapper {
        LayoutMapper::new("data/data/com.termux/files/usr")
    }

    #[test]
    fn test_map_runtime_bin_and_lib() {
        let m = mapper();
        assert_eq!(
            m.map(Path::new(
                "data/data/com.termux/files/usr/opt/openjdk-21/bin/java"
            )),
            Some(PathBuf::from("bin/java"))
        );
        assert_eq!(
            m.map(Path::new(
                "data/data/com.termux/files/usr/opt/openjdk-21/lib/server/libjvm.so"
            )),
            Some(PathBuf::from("lib/server/libjvm.so"))
        );
    }

    #[test]
    fn test_map_dependency_bundle_paths() {
        let m = mapper();
        assert_eq!(
            m.map(Path::new(
                "data/data/com.termux/files/usr/lib/libandroid-support.so"
            )),
            Some(PathBuf::from("lib/libandroid-support.so"))
        );
        assert_eq!(
            m.map(Path::new("data/data/com.termux/files/usr/bin/iconv")),
            Some(PathBuf::from("bin/iconv"))
        );
    }

    #[test]
    fn test_leading_dot_and_root_are_tolerated() {
        let m = mapper();
        assert_eq!(
            m.map(Path::new(
                "./data/data/com.termux/files/usr/opt/openjdk-21/bin/java"
            )),
            Some(PathBuf::from("bin/java"))
        );
        assert_eq!(
            m.map(Path::new(
                "/data/data/com.termux/files/usr/opt/openjdk-21/bin/java"
            )),
            Some(PathBuf::from("bin/java"))
        );
    }

    #[test]
    fn test_traversal_has_no_destination() {
        let m = mapper();
        assert_eq!(
            m.map(Path::new(
                "data/data/com.termux/files/usr/bin/../../../../etc/passwd"
            )),
            None
        );
        assert_eq!(m.map(Path::new("../../outside")), None);
    }

    #[test]
    fn test_paths_outside_prefix_have_no_destination() {
        let m = mapper();
        assert_eq!(m.map(Path::new("etc/passwd")), None);
        assert_eq!(m.map(Path::new("data/data/other.app/files/usr/bin/java")), None);
        // Inside the prefix but not under bin/ or lib/ — docs, licences.
        assert_eq!(
            m.map(Path::new(
                "data/data/com.termux/files/usr/share/doc/openjdk/README"
            )),
            None
        );
        assert_eq!(
            m.map(Path::new(
                "data/data/com.termux/files/usr/opt/openjdk-21/man/man1/java.1"
            )),
            None
        );
    }

    #[test]
    fn test_bare_tree_directories_map_to_themselves() {
        let m = mapper();
        assert_eq!(
            m.map(Path::new("data/data/com.termux/files/usr/lib")),
            Some(PathBuf::from("lib"))
        );
    }
}
