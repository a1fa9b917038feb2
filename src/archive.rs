//! Byte-stable tar.gz writing and extraction
//!
//! Entries are appended in sorted path order with normalized headers (mtime 0,
//! uid/gid 0, no owner names, 0644/0755 modes) and the gzip header carries no
//! timestamp or file name, so the same tree always produces the same bytes.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path};
use tar::{Builder, EntryType, Header};
use tracing::debug;

/// Version-control metadata never captured into snapshots or bundles
pub const VCS_METADATA_DIRS: &[&str] = &[".git", ".hg"];

pub struct DeterministicArchive<W: Write> {
    builder: Builder<GzEncoder<W>>,
}

fn base_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// Joins archive path segments with `/`, refusing anything that escapes the root
pub fn archive_path(prefix: &str, relative: &Path) -> Result<String> {
    let mut parts: Vec<String> = prefix
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .with_context(|| format!("Non UTF-8 path {}", relative.display()))?
                    .to_string(),
            ),
            Component::CurDir => {}
            _ => anyhow::bail!("Refusing to archive path {}", relative.display()),
        }
    }
    Ok(parts.join("/"))
}

impl<W: Write> DeterministicArchive<W> {
    pub fn new(writer: W) -> Self {
        let encoder = GzBuilder::new()
            .mtime(0)
            .operating_system(255)
            .write(writer, Compression::default());
        let mut builder = Builder::new(encoder);
        builder.mode(tar::HeaderMode::Deterministic);
        builder.follow_symlinks(false);
        Self { builder }
    }

    pub fn append_dir(&mut self, path: &str) -> Result<()> {
        let mut header = base_header(EntryType::Directory, 0o755, 0);
        self.builder
            .append_data(&mut header, path, io::empty())
            .with_context(|| format!("Failed to append directory {}", path))
    }

    pub fn append_bytes(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut header = base_header(EntryType::Regular, 0o644, data.len() as u64);
        self.builder
            .append_data(&mut header, path, data)
            .with_context(|| format!("Failed to append {}", path))
    }

    pub fn append_file(&mut self, path: &str, source: &Path) -> Result<()> {
        let metadata = fs::metadata(source)
            .with_context(|| format!("Failed to stat {}", source.display()))?;
        let mode = if is_executable(&metadata) { 0o755 } else { 0o644 };
        let mut header = base_header(EntryType::Regular, mode, metadata.len());
        let file =
            File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
        self.builder
            .append_data(&mut header, path, file)
            .with_context(|| format!("Failed to append {}", path))
    }

    /// Appends every entry under `root` below `prefix`, in sorted path order
    pub fn append_tree(&mut self, prefix: &str, root: &Path, exclude: &[&str]) -> Result<()> {
        let excluded: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        let walker = WalkBuilder::new(root)
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_path(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !excluded.iter().any(|ex| ex == name))
                    .unwrap_or(true)
            })
            .build();

        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .context("Failed to relativize path")?;
            if relative.as_os_str().is_empty() {
                if !prefix.is_empty() {
                    self.append_dir(prefix)?;
                }
                continue;
            }
            let target = archive_path(prefix, relative)?;
            let metadata = fs::symlink_metadata(path)
                .with_context(|| format!("Failed to stat {}", path.display()))?;
            let file_type = metadata.file_type();

            if file_type.is_dir() {
                self.append_dir(&target)?;
            } else if file_type.is_symlink() {
                let link = fs::read_link(path)
                    .with_context(|| format!("Failed to read symlink {}", path.display()))?;
                let mut header = base_header(EntryType::Symlink, 0o777, 0);
                self.builder
                    .append_link(&mut header, &target, &link)
                    .with_context(|| format!("Failed to append symlink {}", target))?;
            } else if file_type.is_file() {
                self.append_file(&target, path)?;
            } else {
                debug!(path = %path.display(), "Skipping special file");
            }
        }
        Ok(())
    }

    /// Writes the tar trailer and gzip footer, returning the inner writer
    pub fn finish(self) -> Result<W> {
        let encoder = self
            .builder
            .into_inner()
            .context("Failed to finish tar stream")?;
        encoder.finish().context("Failed to finish gzip stream")
    }
}

/// Extracts a tar.gz archive into `dest`
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let file =
        File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_mtime(false);
    tar.unpack(dest)
        .with_context(|| format!("Failed to extract {}", archive.display()))
}

/// Moves a fully written staging file to its final name
///
/// The file is fsynced before the rename and the parent directory after it.
pub fn publish(staging: &Path, target: &Path) -> Result<()> {
    File::open(staging)
        .and_then(|file| file.sync_all())
        .with_context(|| format!("Failed to sync {}", staging.display()))?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::rename(staging, target).with_context(|| {
        format!(
            "Failed to publish {} to {}",
            staging.display(),
            target.display()
        )
    })?;
    if let Some(parent) = target.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// True when the file is a readable tar.gz stream
pub fn is_readable(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    match tar.entries() {
        Ok(entries) => entries.into_iter().all(|entry| {
            entry
                .and_then(|mut entry| io::copy(&mut entry, &mut io::sink()))
                .is_ok()
        }),
        Err(_) => false,
    }
}

/// Lists the entry paths of a tar.gz stream, in archive order
pub fn list_entries(data: &[u8]) -> Result<Vec<String>> {
    let mut tar = tar::Archive::new(GzDecoder::new(data));
    let mut paths = Vec::new();
    for entry in tar.entries().context("Failed to read tar entries")? {
        let entry = entry.context("Failed to read tar entry")?;
        let path = entry.path().context("Failed to read entry path")?;
        paths.push(path.to_string_lossy().trim_end_matches('/').to_string());
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        fs::write(dir.path().join("b/nested/z.txt"), "z").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        dir
    }

    fn build(root: &Path) -> Vec<u8> {
        let mut archive = DeterministicArchive::new(Vec::new());
        archive.append_tree("app", root, VCS_METADATA_DIRS).unwrap();
        archive.finish().unwrap()
    }

    #[test]
    fn test_same_tree_same_bytes() {
        let tree = sample_tree();
        let first = build(tree.path());
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(tree.path().join("a.txt"), "a").unwrap();
        let second = build(tree.path());
        assert_eq!(first, second);
    }

    #[test]
    fn test_identical_trees_in_different_places_match() {
        let one = sample_tree();
        let two = sample_tree();
        assert_eq!(build(one.path()), build(two.path()));
    }

    #[test]
    fn test_entries_sorted_and_vcs_excluded() {
        let tree = sample_tree();
        let entries = list_entries(&build(tree.path())).unwrap();
        assert_eq!(
            entries,
            vec!["app", "app/a.txt", "app/b", "app/b/nested", "app/b/nested/z.txt"]
        );
    }

    #[test]
    fn test_extract_round_trip() {
        let tree = sample_tree();
        let data = build(tree.path());
        let out = TempDir::new().unwrap();
        let archive_file = out.path().join("src.tar.gz");
        fs::write(&archive_file, &data).unwrap();

        let dest = out.path().join("extracted");
        extract(&archive_file, &dest).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("app/b/nested/z.txt")).unwrap(),
            "z"
        );
        assert!(!dest.join("app/.git").exists());
    }

    #[test]
    fn test_archive_path_rejects_parent_components() {
        assert_eq!(archive_path("deps/npm", Path::new("a/b.tgz")).unwrap(), "deps/npm/a/b.tgz");
        assert!(archive_path("deps", Path::new("../escape")).is_err());
    }

    #[test]
    fn test_is_readable() {
        let tree = sample_tree();
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.tar.gz");
        fs::write(&good, build(tree.path())).unwrap();
        let bad = dir.path().join("bad.tar.gz");
        fs::write(&bad, b"not an archive").unwrap();

        assert!(is_readable(&good));
        assert!(!is_readable(&bad));
        assert!(!is_readable(&dir.path().join("missing.tar.gz")));
    }

    #[test]
    fn test_publish_moves_staging_file() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("tmp/x.part");
        fs::create_dir_all(staging.parent().unwrap()).unwrap();
        fs::write(&staging, "bytes").unwrap();

        let target = dir.path().join("out/nested/x.tar.gz");
        publish(&staging, &target).unwrap();
        assert!(!staging.exists());
        assert_eq!(fs::read_to_string(&target).unwrap(), "bytes");
    }

    #[test]
    fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
