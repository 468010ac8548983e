//! Path-sandboxed file browsing and streaming over a mounted restore.
//! Every caller-supplied path is resolved against the
//! mount root before anything touches the filesystem; a path that
//! escapes, after normalisation or symlink resolution, is refused.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::io::SyncIoBridge;

const RECURSIVE_MAX_ENTRIES: usize = 50_000;
const RECURSIVE_MAX_DEPTH: usize = 64;
/// Applied only to archive downloads; a hit produces a truncation marker
/// rather than an error.
const ARCHIVE_MAX_UNCOMPRESSED_BYTES: u64 = 32 * 1024 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum BrowseError {
    #[error("path escapes mount root: {0}")]
    PathEscape(String),
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub size: u64,
    pub mode: String,
    pub modified_time: DateTime<Utc>,
    pub is_symlink: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub entries: Vec<FileEntry>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zip" => Some(Self::Zip),
            "tar.gz" => Some(Self::TarGz),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::TarGz => "application/gzip",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

/// Resolves `user_path` (API-relative, `/` is the mount root) against
/// `mount_root`, rejecting anything that normalises or symlinks outside
/// of it.
///
/// `/` is the mount root, not the host root: an absolute host path is
/// never accepted, only `/`-prefixed paths meaning "relative to this
/// mount". A `..` component anywhere is rejected outright rather than
/// collapsed, so `/../etc/passwd` fails even though naive normalisation
/// of `/a/../../etc` would stay syntactically rooted.
pub fn resolve_path(mount_root: &Path, user_path: &str) -> Result<PathBuf, BrowseError> {
    if !user_path.starts_with('/') {
        return Err(BrowseError::PathEscape(user_path.to_string()));
    }

    let mut joined = mount_root.to_path_buf();
    for component in Path::new(user_path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                return Err(BrowseError::PathEscape(user_path.to_string()));
            }
            Component::Normal(part) => joined.push(part),
            Component::Prefix(_) => {
                return Err(BrowseError::PathEscape(user_path.to_string()));
            }
        }
    }

    // Resolve symlinks and relative segments the filesystem itself
    // introduces; the canonical form must still live under the mount root.
    let canonical_root = mount_root
        .canonicalize()
        .map_err(|_| BrowseError::NotFound(mount_root.display().to_string()))?;

    match joined.canonicalize() {
        Ok(canonical) => {
            if canonical.starts_with(&canonical_root) {
                Ok(canonical)
            } else {
                Err(BrowseError::PathEscape(user_path.to_string()))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(BrowseError::NotFound(user_path.to_string()))
        }
        Err(e) => Err(BrowseError::Io(e)),
    }
}

fn mount_relative_path(mount_root: &Path, absolute: &Path) -> String {
    let rel = absolute.strip_prefix(mount_root).unwrap_or(absolute);
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel.is_empty() {
        "/".to_string()
    } else {
        format!("/{rel}")
    }
}

async fn entry_for(mount_root: &Path, absolute: &Path) -> Result<FileEntry, BrowseError> {
    let symlink_meta = tokio::fs::symlink_metadata(absolute).await?;
    let is_symlink = symlink_meta.file_type().is_symlink();
    let meta = tokio::fs::metadata(absolute).await?;

    let entry_type = if meta.is_dir() {
        EntryType::Directory
    } else {
        EntryType::File
    };
    let modified_time: DateTime<Utc> = meta.modified()?.into();
    let name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "/".to_string());

    Ok(FileEntry {
        name,
        path: mount_relative_path(mount_root, absolute),
        entry_type,
        size: if meta.is_dir() { 0 } else { meta.len() },
        mode: format_mode(meta.permissions().mode()),
        modified_time,
        is_symlink,
    })
}

/// POSIX-style `rwxrwxrwx` rendering of a mode, the form the API
/// contracts to return.
fn format_mode(mode: u32) -> String {
    let bits = [
        (0o400, 'r'), (0o200, 'w'), (0o100, 'x'),
        (0o040, 'r'), (0o020, 'w'), (0o010, 'x'),
        (0o004, 'r'), (0o002, 'w'), (0o001, 'x'),
    ];
    bits.iter()
        .map(|(mask, ch)| if mode & mask != 0 { *ch } else { '-' })
        .collect()
}

/// Lists a directory's immediate entries, case-insensitive by name.
/// With `recursive`, walks the whole subtree, capping at
/// `RECURSIVE_MAX_ENTRIES` entries and `RECURSIVE_MAX_DEPTH` levels and
/// reporting truncation rather than erroring.
pub async fn list_dir(
    mount_root: &Path,
    target: &Path,
    recursive: bool,
) -> Result<ListResult, BrowseError> {
    let meta = tokio::fs::metadata(target).await?;
    if !meta.is_dir() {
        return Err(BrowseError::NotFound(target.display().to_string()));
    }

    let mut entries = Vec::new();
    let mut truncated = false;
    if recursive {
        walk_recursive(mount_root, target, 0, &mut entries, &mut truncated).await?;
    } else {
        let mut reader = tokio::fs::read_dir(target).await?;
        while let Some(child) = reader.next_entry().await? {
            entries.push(entry_for(mount_root, &child.path()).await?);
        }
    }

    entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    Ok(ListResult { entries, truncated })
}

async fn walk_recursive(
    mount_root: &Path,
    dir: &Path,
    depth: usize,
    out: &mut Vec<FileEntry>,
    truncated: &mut bool,
) -> Result<(), BrowseError> {
    if depth >= RECURSIVE_MAX_DEPTH {
        *truncated = true;
        return Ok(());
    }
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(child) = reader.next_entry().await? {
        if out.len() >= RECURSIVE_MAX_ENTRIES {
            *truncated = true;
            return Ok(());
        }
        let path = child.path();
        let entry = entry_for(mount_root, &path).await?;
        let is_dir = entry.entry_type == EntryType::Directory;
        out.push(entry);
        if is_dir && !out.last().map(|e| e.is_symlink).unwrap_or(false) {
            Box::pin(walk_recursive(mount_root, &path, depth + 1, out, truncated)).await?;
        }
    }
    Ok(())
}

pub async fn file_info(mount_root: &Path, target: &Path) -> Result<FileEntry, BrowseError> {
    entry_for(mount_root, target).await
}

/// Streams a single file's bytes. Content length and a filename-preserving
/// disposition header are the caller's responsibility (the HTTP layer
/// knows the response type); this just hands back an open async reader
/// and the size.
pub async fn open_file(target: &Path) -> Result<(tokio::fs::File, u64), BrowseError> {
    let meta = tokio::fs::metadata(target).await?;
    if meta.is_dir() {
        return Err(BrowseError::NotFound(target.display().to_string()));
    }
    let file = tokio::fs::File::open(target).await?;
    Ok((file, meta.len()))
}

/// Walks `dir` and returns `(archive_relative_name, absolute_path, size)`
/// for every regular file under it -- unreadable entries are skipped by
/// the caller with a warning rather than aborting the whole archive.
async fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf, u64)>) {
    let Ok(mut reader) = tokio::fs::read_dir(dir).await else { return };
    while let Ok(Some(child)) = reader.next_entry().await {
        let path = child.path();
        let Ok(meta) = tokio::fs::metadata(&path).await else { continue };
        if meta.is_dir() {
            Box::pin(collect_files(root, &path, out)).await;
        } else if meta.is_file() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push((rel, path, meta.len()));
        }
    }
}

/// Generates a streamed archive of everything under `target`, written on
/// the fly into a pipe: the archive writer runs on a blocking thread
/// (`zip`/`tar` are synchronous `Write` APIs) while the async side reads
/// as bytes become available, so nothing buffers the whole archive in
/// memory.
pub async fn stream_directory(
    target: PathBuf,
    format: ArchiveFormat,
) -> Result<tokio::io::DuplexStream, BrowseError> {
    let meta = tokio::fs::metadata(&target).await?;
    if !meta.is_dir() {
        return Err(BrowseError::NotFound(target.display().to_string()));
    }

    let mut files = Vec::new();
    collect_files(&target, &target, &mut files).await;

    let (reader, writer) = tokio::io::duplex(64 * 1024);
    tokio::task::spawn_blocking(move || {
        let bridge = SyncIoBridge::new(writer);
        let result = match format {
            ArchiveFormat::Zip => write_zip(bridge, files),
            ArchiveFormat::TarGz => write_tar_gz(bridge, files),
        };
        if let Err(e) = result {
            log::warn!("directory archive generation failed partway through: {e}");
        }
    });

    Ok(reader)
}

fn write_zip(
    writer: SyncIoBridge<tokio::io::DuplexStream>,
    files: Vec<(String, PathBuf, u64)>,
) -> std::io::Result<()> {
    use std::io::{Read, Write};
    use zip::write::SimpleFileOptions;

    let mut zip = zip::ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut total: u64 = 0;

    for (name, path, size) in files {
        if total + size > ARCHIVE_MAX_UNCOMPRESSED_BYTES {
            zip.start_file("TRUNCATED.txt", options)?;
            zip.write_all(b"archive truncated: uncompressed size cap reached")?;
            break;
        }
        let Ok(mut file) = std::fs::File::open(&path) else {
            log::warn!("skipping unreadable archive entry {}", path.display());
            continue;
        };
        if zip.start_file(&name, options).is_err() {
            log::warn!("skipping archive entry with invalid name {name}");
            continue;
        }
        if std::io::copy(&mut file, &mut zip).is_err() {
            log::warn!("skipping archive entry that failed to read fully: {name}");
            continue;
        }
        total += size;
    }
    zip.finish()?;
    Ok(())
}

fn write_tar_gz(
    writer: SyncIoBridge<tokio::io::DuplexStream>,
    files: Vec<(String, PathBuf, u64)>,
) -> std::io::Result<()> {
    use std::io::Write;

    let encoder = flate2::write::GzEncoder::new(writer, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut total: u64 = 0;

    for (name, path, size) in files {
        if total + size > ARCHIVE_MAX_UNCOMPRESSED_BYTES {
            let mut header = tar::Header::new_gnu();
            let marker = b"archive truncated: uncompressed size cap reached";
            header.set_size(marker.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, "TRUNCATED.txt", &marker[..])?;
            break;
        }
        let Ok(mut file) = std::fs::File::open(&path) else {
            log::warn!("skipping unreadable archive entry {}", path.display());
            continue;
        };
        if builder.append_file(&name, &mut file).is_err() {
            log::warn!("skipping archive entry that failed to append: {name}");
            continue;
        }
        total += size;
    }
    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(())
}

/// Disposition header value preserving the original filename, per
/// RFC 6266's simple form (no non-ASCII handling beyond quoting -- this
/// system's filenames come from NTFS/ext/xfs trees, not attacker input).
pub fn content_disposition(filename: &str) -> String {
    format!("attachment; filename=\"{}\"", filename.replace('"', "'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_mount() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vmbak-browse-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("root.txt"), b"hello").unwrap();
        fs::write(dir.join("sub/nested.txt"), b"world").unwrap();
        dir
    }

    #[test]
    fn rejects_parent_dir_component() {
        let root = tmp_mount();
        let err = resolve_path(&root, "/../etc/passwd").unwrap_err();
        assert!(matches!(err, BrowseError::PathEscape(_)));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn rejects_path_not_starting_with_slash() {
        let root = tmp_mount();
        let err = resolve_path(&root, "etc/passwd").unwrap_err();
        assert!(matches!(err, BrowseError::PathEscape(_)));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn normalises_dot_segments_and_accepts() {
        let root = tmp_mount();
        let resolved = resolve_path(&root, "/sub/./nested.txt").unwrap();
        assert_eq!(resolved, root.canonicalize().unwrap().join("sub/nested.txt"));
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn mode_renders_rwx_string() {
        assert_eq!(format_mode(0o644), "rw-r--r--");
        assert_eq!(format_mode(0o755), "rwxr-xr-x");
    }

    #[tokio::test]
    async fn list_dir_sorts_case_insensitively() {
        let root = tmp_mount();
        fs::write(root.join("Apple.txt"), b"x").unwrap();
        fs::write(root.join("banana.txt"), b"x").unwrap();
        let result = list_dir(&root, &root, false).await.unwrap();
        let names: Vec<&str> = result.entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.iter().position(|n| *n == "Apple.txt").unwrap()
            < names.iter().position(|n| *n == "banana.txt").unwrap());
        fs::remove_dir_all(root).unwrap();
    }
}
