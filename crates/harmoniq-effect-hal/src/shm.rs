use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::{MmapOptions, MmapRaw};
use tempfile::TempPath;

/// File-backed memory region mapped by exactly two parties.
///
/// The region does no synchronization of its own. Users agree on a role split
/// (which side writes which bytes) and publish writes with explicit fences or
/// atomics placed inside the region.
pub struct SharedRegion {
    map: MmapRaw,
    path: PathBuf,
    _file: File,
    // Set only for the creator; removes the backing file on drop.
    _temp_path: Option<TempPath>,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("len", &self.map.len())
            .finish()
    }
}

impl SharedRegion {
    /// Allocates a zeroed region; the backing file is removed when the creator drops it.
    pub fn create(prefix: &str, len: usize) -> Result<Self> {
        let (file, temp_path) = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile()
            .context("failed to allocate shared region backing file")?
            .into_parts();
        file.set_len(len as u64)
            .context("failed to size shared region")?;
        let map = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .context("failed to map shared region")?;
        Ok(Self {
            map,
            path: temp_path.to_path_buf(),
            _file: file,
            _temp_path: Some(temp_path),
        })
    }

    /// Maps a region created by the other party.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open shared region {}", path.display()))?;
        let map = MmapOptions::new()
            .map_raw(&file)
            .with_context(|| format!("failed to map shared region {}", path.display()))?;
        Ok(Self {
            map,
            path: path.to_path_buf(),
            _file: file,
            _temp_path: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opened_region_aliases_created_region() {
        let created = SharedRegion::create("harmoniq-shm-test", 64).unwrap();
        let opened = SharedRegion::open(created.path()).unwrap();
        assert_eq!(opened.len(), 64);
        unsafe {
            created.as_mut_ptr().add(7).write(0x5a);
            assert_eq!(opened.as_ptr().add(7).read(), 0x5a);
        }
    }

    #[test]
    fn backing_file_lives_as_long_as_the_creator() {
        let created = SharedRegion::create("harmoniq-shm-test", 16).unwrap();
        let path = created.path().to_path_buf();
        let opened = SharedRegion::open(&path).unwrap();
        drop(opened);
        assert!(path.exists());
        drop(created);
        assert!(!path.exists());
    }
}
