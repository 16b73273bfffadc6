//! The scanner interface: how directory trees enter the blob engine.
//!
//! The library has no intrinsic knowledge of any filesystem. A
//! [`TreeSource`] delivers a fully described entry tree; stream contents
//! stay lazy (a path or a buffer) so capture does not read file data until
//! the write actually happens. [`DirTreeSource`] scans a local directory;
//! [`MemTreeSource`] builds trees from in-memory specs and is what the
//! tests use.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ErrorInner, IoOp, IoResultExt, Result};
use crate::metadata::filetime_from_unix;

/// The content of one stream delivered by a scanner.
#[derive(Debug, Clone)]
pub enum StreamData {
    /// Read lazily from this file when written.
    File(PathBuf),
    /// In-memory content.
    Bytes(Arc<[u8]>),
}

impl StreamData {
    pub(crate) fn size(&self) -> Result<u64> {
        match self {
            StreamData::File(path) => Ok(fs::metadata(path).io_ctx(IoOp::Stat)?.len()),
            StreamData::Bytes(b) => Ok(b.len() as u64),
        }
    }
}

/// A named or unnamed stream of a scanned entry.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    /// Empty for the unnamed (default) stream.
    pub name: String,
    pub data: StreamData,
    /// Set when the producer already knows the SHA-1, letting the writer
    /// skip hashing.
    pub known_hash: Option<crate::Sha1Hash>,
}

/// One scanned directory entry.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub name: String,
    pub is_directory: bool,
    pub attributes: Option<u32>,
    /// Windows FILETIME timestamps.
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub security_descriptor: Option<Vec<u8>>,
    pub streams: Vec<StreamSpec>,
    pub children: Vec<TreeEntry>,
}

impl TreeEntry {
    pub fn directory(name: impl Into<String>) -> Self {
        TreeEntry {
            name: name.into(),
            is_directory: true,
            attributes: None,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
            security_descriptor: None,
            streams: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn file(name: impl Into<String>, data: StreamData) -> Self {
        TreeEntry {
            is_directory: false,
            streams: vec![StreamSpec {
                name: String::new(),
                data,
                known_hash: None,
            }],
            ..Self::directory(name)
        }
    }
}

/// A source of one directory tree to capture.
pub trait TreeSource {
    /// A human-readable description for progress messages.
    fn describe(&self) -> String;

    /// Produce the root entry (its name is ignored).
    fn capture(&mut self) -> Result<TreeEntry>;
}

/// Scans a directory on the local filesystem. Attributes and security
/// descriptors are not captured; timestamps come from the filesystem.
#[derive(Debug)]
pub struct DirTreeSource {
    root: PathBuf,
}

impl DirTreeSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirTreeSource { root: root.into() }
    }

    fn scan_dir(path: &Path) -> Result<TreeEntry> {
        let mut entry = TreeEntry::directory(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        Self::fill_times(&mut entry, path)?;

        let mut names = Vec::new();
        for dirent in fs::read_dir(path).io_ctx(IoOp::Open)? {
            names.push(dirent.io_ctx(IoOp::Read)?.path());
        }
        names.sort();

        for child_path in names {
            let meta = fs::symlink_metadata(&child_path).io_ctx(IoOp::Stat)?;
            if meta.is_dir() {
                entry.children.push(Self::scan_dir(&child_path)?);
            } else if meta.is_file() {
                let name = child_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut child = TreeEntry::file(name, StreamData::File(child_path.clone()));
                Self::fill_times(&mut child, &child_path)?;
                entry.children.push(child);
            }
            // Symlinks and special files are skipped; capturing them needs
            // filesystem-specific handling this interface does not model.
        }
        Ok(entry)
    }

    fn fill_times(entry: &mut TreeEntry, path: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(path).io_ctx(IoOp::Stat)?;
        let to_filetime = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(0, |d| filetime_from_unix(d.as_secs()))
        };
        entry.last_write_time = to_filetime(meta.modified());
        entry.last_access_time = to_filetime(meta.accessed());
        entry.creation_time = to_filetime(meta.created());
        if entry.creation_time == 0 {
            entry.creation_time = entry.last_write_time;
        }
        Ok(())
    }
}

impl TreeSource for DirTreeSource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn capture(&mut self) -> Result<TreeEntry> {
        if !self.root.is_dir() {
            return Err(ErrorInner::InvalidParam("capture source is not a directory").into());
        }
        Self::scan_dir(&self.root)
    }
}

/// Builds a tree from `(path, contents)` pairs; directories are created
/// implicitly. Intended for tests and programmatic image construction.
#[derive(Debug, Default)]
pub struct MemTreeSource {
    files: Vec<(String, Arc<[u8]>)>,
}

impl MemTreeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> &mut Self {
        self.files.push((path.into(), contents.into().into()));
        self
    }
}

impl TreeSource for MemTreeSource {
    fn describe(&self) -> String {
        format!("<memory: {} files>", self.files.len())
    }

    fn capture(&mut self) -> Result<TreeEntry> {
        let mut root = TreeEntry::directory("");
        for (path, contents) in &self.files {
            let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
            let Some((file_name, dirs)) = parts.split_last() else {
                return Err(ErrorInner::InvalidParam("empty file path").into());
            };

            let mut cur = &mut root;
            for dir in dirs {
                let pos = cur.children.iter().position(|c| c.name == *dir);
                let idx = match pos {
                    Some(i) => i,
                    None => {
                        cur.children.push(TreeEntry::directory(*dir));
                        cur.children.len() - 1
                    }
                };
                cur = &mut cur.children[idx];
                if !cur.is_directory {
                    return Err(ErrorInner::InvalidParam("file used as directory").into());
                }
            }
            cur.children.push(TreeEntry::file(
                *file_name,
                StreamData::Bytes(contents.clone()),
            ));
        }
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_tree_builds_nested_dirs() {
        let mut src = MemTreeSource::new();
        src.add_file("a/b/c.txt", b"c".to_vec())
            .add_file("a/d.txt", b"d".to_vec())
            .add_file("top.txt", b"t".to_vec());
        let root = src.capture().unwrap();
        assert_eq!(root.children.len(), 2);
        let a = root.children.iter().find(|c| c.name == "a").unwrap();
        assert!(a.is_directory);
        assert_eq!(a.children.len(), 2);
        let b = a.children.iter().find(|c| c.name == "b").unwrap();
        assert_eq!(b.children[0].name, "c.txt");
    }

    #[test]
    fn dir_tree_scans_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/x.bin"), b"xyz").unwrap();
        fs::write(dir.path().join("root.txt"), b"hello").unwrap();

        let mut src = DirTreeSource::new(dir.path());
        let root = src.capture().unwrap();
        assert_eq!(root.children.len(), 2);
        let file = root.children.iter().find(|c| c.name == "root.txt").unwrap();
        assert!(!file.is_directory);
        assert_eq!(file.streams.len(), 1);
        assert!(file.last_write_time > 0);
    }
}
