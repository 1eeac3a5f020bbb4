//! A4: maps a cache image path onto a destination file inside the output
//! folder, and deduplicates images that share a `mach_header` address via
//! relative symlinks instead of writing the same bytes twice.

use crate::error::{DecacheError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct OutputLayout {
    root: PathBuf,
    written: HashMap<u64, PathBuf>,
}

impl OutputLayout {
    pub fn new(root: PathBuf) -> Self {
        OutputLayout {
            root,
            written: HashMap::new(),
        }
    }

    /// Destination path for `image_path` (a cache-internal path, always
    /// absolute), with parent directories created.
    pub fn destination_for(&self, image_path: &str) -> Result<PathBuf> {
        let stripped = image_path.trim_start_matches('/');
        let dest = self.root.join(stripped);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(dest)
    }

    /// Records that the image whose `mach_header` sits at `header_addr` was
    /// written out to `dest`, so a later path referring to the same merged
    /// image can be linked to it instead of rewritten.
    pub fn record_written(&mut self, header_addr: u64, dest: PathBuf) {
        self.written.insert(header_addr, dest);
    }

    pub fn already_written(&self, header_addr: u64) -> Option<&Path> {
        self.written.get(&header_addr).map(|p| p.as_path())
    }

    /// Creates `dest` as a relative symlink to `target`, both given as
    /// absolute paths under the output root. The relative prefix is built
    /// from `dest`'s depth under the root minus the two components
    /// contributed by its own filename and the root itself.
    pub fn symlink_dup(&self, dest: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let dest_depth = dest
            .strip_prefix(&self.root)
            .unwrap_or(dest)
            .components()
            .count();
        let up_count = dest_depth.saturating_sub(1);
        let mut relative = PathBuf::new();
        for _ in 0..up_count {
            relative.push("..");
        }
        let target_relative = target.strip_prefix(&self.root).unwrap_or(target);
        relative.push(target_relative);

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&relative, dest).map_err(|source| DecacheError::SymlinkCollision {
                link: dest.to_path_buf(),
                target: relative.clone(),
                source,
            })?;
        }
        #[cfg(not(unix))]
        {
            std::fs::copy(target, dest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_strips_leading_slash_and_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(tmp.path().to_path_buf());
        let dest = layout.destination_for("/usr/lib/libfoo.dylib").unwrap();
        assert_eq!(dest, tmp.path().join("usr/lib/libfoo.dylib"));
        assert!(dest.parent().unwrap().is_dir());
    }

    #[test]
    fn already_written_tracks_by_inode() {
        let tmp = tempfile::tempdir().unwrap();
        let mut layout = OutputLayout::new(tmp.path().to_path_buf());
        assert!(layout.already_written(42).is_none());
        layout.record_written(42, tmp.path().join("a"));
        assert_eq!(layout.already_written(42), Some(tmp.path().join("a").as_path()));
    }

    #[test]
    #[cfg(unix)]
    fn symlink_dup_creates_relative_link() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(tmp.path().to_path_buf());
        let target = layout.destination_for("/usr/lib/libfoo.dylib").unwrap();
        std::fs::write(&target, b"data").unwrap();
        let dest = layout.destination_for("/usr/lib/system/libfoo.dylib").unwrap();
        layout.symlink_dup(&dest, &target).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
    }
}
