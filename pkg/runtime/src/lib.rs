//! Runtime provisioning: materialize an execution runtime on-device from
//! packaged distributions, normalize its layout, and repair the links the
//! host sandbox cannot produce during extraction.

pub mod error;
pub mod extract;
pub mod installer;
pub mod layout;
pub mod links;

pub use error::ProvisionError;
pub use extract::BundleExtractor;
pub use installer::{ProvisionerPaths, RuntimeProvisioner};
pub use layout::LayoutMapper;
pub use links::{LinkOutcome, LinkRepairer};

#[cfg(test)]
pub(crate) mod testpkg {
    //! Builds real layered packages for tests: outer tar wrapper with a
    //! metadata member plus a gzip-compressed `data.tar.gz` payload.

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::path::{Path, PathBuf};
    use tar::{Builder, EntryType, Header};

    pub enum TestEntry<'a> {
        File { path: &'a str, data: &'a [u8], mode: u32 },
        Dir { path: &'a str },
        Symlink { path: &'a str, target: &'a str },
        HardLink { path: &'a str, target: &'a str },
    }

    pub fn write_package(pkg_path: &Path, entries: &[TestEntry]) {
        // Inner payload: gzip-compressed tar.
        let mut inner = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for entry in entries {
            match entry {
                TestEntry::File { path, data, mode } => {
                    let mut header = Header::new_gnu();
                    header.set_size(data.len() as u64);
                    header.set_mode(*mode);
                    if path.contains("..") {
                        // append_data validates away `..` components; write
                        // the name bytes into the header directly so
                        // traversal entries can still be produced.
                        let name = &mut header.as_gnu_mut().unwrap().name;
                        name[..path.len()].copy_from_slice(path.as_bytes());
                        header.set_cksum();
                        inner.append(&header, *data).unwrap();
                    } else {
                        inner.append_data(&mut header, path, *data).unwrap();
                    }
                }
                TestEntry::Dir { path } => {
                    let mut header = Header::new_gnu();
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    inner.append_data(&mut header, format!("{path}/"), &[][..]).unwrap();
                }
                TestEntry::Symlink { path, target } => {
                    let mut header = Header::new_gnu();
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    inner.append_link(&mut header, path, target).unwrap();
                }
                TestEntry::HardLink { path, target } => {
                    let mut header = Header::new_gnu();
                    header.set_entry_type(EntryType::Link);
                    header.set_size(0);
                    inner.append_link(&mut header, path, target).unwrap();
                }
            }
        }
        let payload = inner.into_inner().unwrap().finish().unwrap();

        // Outer wrapper: uncompressed tar with metadata + payload members.
        let file = std::fs::File::create(pkg_path).unwrap();
        let mut outer = Builder::new(file);

        let meta = b"2.0\n";
        let mut header = Header::new_gnu();
        header.set_size(meta.len() as u64);
        header.set_mode(0o644);
        outer.append_data(&mut header, "metadata", &meta[..]).unwrap();

        let mut header = Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        outer
            .append_data(
                &mut header,
                pkg_constants::paths::PACKAGE_DATA_MEMBER,
                payload.as_slice(),
            )
            .unwrap();
        outer.finish().unwrap();
    }

    pub fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ember-runtime-{}-{}",
            tag,
            chrono::Utc::now().timestamp_millis()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
