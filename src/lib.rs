pub mod bitreader;
pub mod cache;
pub mod checkpoint;
pub mod compression;
pub mod container;
pub mod crypto;
pub mod deflate;
pub mod error;
pub mod fletcher;
pub mod name;
pub mod object;
pub mod superblock;
pub mod btree;
pub mod omap;
pub mod catalog;
pub mod extents;

pub use error::{ApfsError, Result};

use std::io::{Read, Seek, Write};

use container::{Container, Directory};

/// Entry kind in the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A directory entry returned by list_directory
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub oid: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub create_time: i64,
    pub modify_time: i64,
}

/// Detailed file/directory metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    pub oid: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub nlink: u32,
}

/// Entry from walk() — includes full path
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: String,
    pub entry: DirEntry,
}

/// Volume information
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub block_size: u32,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
}

/// High-level read-only APFS volume reader.
///
/// A thin convenience wrapper over `Container`/`Volume` (`container.rs`) that
/// mounts the first volume and hides the container/volume split for the
/// common single-volume case. Every read is routed through
/// `Container::read_inode`/`resolve_path`, so this façade gets decmpfs
/// decompression, volume decryption, and symlink following for free instead
/// of duplicating that logic against the catalog directly.
pub struct ApfsVolume<R: Read + Seek> {
    container: Container<R>,
    volume: container::Volume,
    info: VolumeInfo,
}

impl<R: Read + Seek> ApfsVolume<R> {
    /// Open an APFS container and mount its first volume.
    pub fn open(reader: R) -> Result<Self> {
        let mut container = Container::open(reader)?;
        let volume = container.open_volume(0)?;
        let (num_files, num_directories, num_symlinks) = volume.stats();

        let info = VolumeInfo {
            name: volume.name().to_string(),
            block_size: container.block_size(),
            num_files,
            num_directories,
            num_symlinks,
        };

        Ok(ApfsVolume { container, volume, info })
    }

    /// Get volume metadata
    pub fn volume_info(&self) -> &VolumeInfo {
        &self.info
    }

    /// List entries in a directory by path
    pub fn list_directory(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = if path == "/" || path.is_empty() {
            self.volume.root_directory()
        } else {
            let inode = self.container.resolve_path(&self.volume, path)?;
            if inode.val.kind() != catalog::INODE_DIR_TYPE {
                return Err(ApfsError::NotADirectory(path.to_string()));
            }
            Directory { oid: inode.oid }
        };

        self.container.list_directory(&self.volume, &dir)
    }

    /// Read an entire file into memory
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_file_to(path, &mut buf)?;
        Ok(buf)
    }

    /// Stream a file to a writer, applying decryption and decmpfs
    /// decompression as needed and following symlink path components.
    pub fn read_file_to<W: Write>(&mut self, path: &str, writer: &mut W) -> Result<u64> {
        let inode = self.container.resolve_path(&self.volume, path)?;
        let size = inode.size();

        let mut offset = 0u64;
        let mut chunk = vec![0u8; self.info.block_size.max(1) as usize];
        while offset < size {
            let want = (chunk.len() as u64).min(size - offset) as usize;
            let n = self.container.read_inode(&self.volume, &inode, offset, &mut chunk[..want])?;
            if n == 0 {
                break;
            }
            writer.write_all(&chunk[..n])?;
            offset += n as u64;
        }

        Ok(offset)
    }

    /// Get metadata for a file or directory
    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        let inode = self.container.resolve_path(&self.volume, path)?;
        Ok(inode.attributes())
    }

    /// Recursive walk of all entries
    pub fn walk(&mut self) -> Result<Vec<WalkEntry>> {
        let mut entries = Vec::new();
        self.walk_recursive(self.volume.root_directory(), "", &mut entries)?;
        Ok(entries)
    }

    /// Check if a path exists
    pub fn exists(&mut self, path: &str) -> Result<bool> {
        match self.container.resolve_path(&self.volume, path) {
            Ok(_) => Ok(true),
            Err(ApfsError::FileNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn walk_recursive(
        &mut self,
        parent: Directory,
        parent_path: &str,
        entries: &mut Vec<WalkEntry>,
    ) -> Result<()> {
        let dir_entries = self.container.list_directory(&self.volume, &parent)?;

        for entry in dir_entries {
            let full_path = if parent_path.is_empty() {
                format!("/{}", entry.name)
            } else {
                format!("{}/{}", parent_path, entry.name)
            };

            let is_dir = entry.kind == EntryKind::Directory;
            let oid = entry.oid;

            entries.push(WalkEntry {
                path: full_path.clone(),
                entry,
            });

            if is_dir {
                self.walk_recursive(Directory { oid }, &full_path, entries)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    /// Requires ../tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_volume_open() {
        let file = std::fs::File::open("../tests/appfs.raw").unwrap();
        let reader = BufReader::new(file);

        let mut vol = ApfsVolume::open(reader).unwrap();
        let info = vol.volume_info();

        assert!(!info.name.is_empty(), "Volume name should not be empty");
        assert_eq!(info.block_size, 4096);

        let entries = vol.list_directory("/").unwrap();
        assert!(!entries.is_empty(), "Root directory should have entries");

        let walk_entries = vol.walk().unwrap();
        assert!(!walk_entries.is_empty());
    }

    /// Requires ../tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_read_file_data() {
        let file = std::fs::File::open("../tests/appfs.raw").unwrap();
        let reader = BufReader::new(file);

        let mut vol = ApfsVolume::open(reader).unwrap();

        let walk = vol.walk().unwrap();
        let small_file = walk.iter()
            .find(|e| e.entry.kind == EntryKind::File && e.entry.size > 0 && e.entry.size < 1_000_000);

        let entry = small_file.expect("Should find a small file in the test image");
        let data = vol.read_file(&entry.path).unwrap();
        assert_eq!(data.len() as u64, entry.entry.size,
            "Read size should match stat size");

        let stat = vol.stat(&entry.path).unwrap();
        assert_eq!(stat.size, entry.entry.size);
    }

    /// Requires ../tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn test_symlink_is_followed_by_stat() {
        let file = std::fs::File::open("../tests/appfs.raw").unwrap();
        let reader = BufReader::new(file);
        let mut vol = ApfsVolume::open(reader).unwrap();

        let walk = vol.walk().unwrap();
        if let Some(entry) = walk.iter().find(|e| e.entry.kind == EntryKind::Symlink) {
            // A symlink component must resolve to its target, not error
            // with NotADirectory the way the old catalog-only path did.
            let _ = vol.stat(&entry.path).unwrap();
        }
    }
}
