//! Memory-mapped image files.
//!
//! [`Output`] creates the target file at its final size, maps it and lets the writer fill
//! sections at arbitrary offsets. The image writer stores the header last, so a file whose
//! writing was interrupted never carries a valid header over a truncated body.
//!
//! An output that is dropped without [`Output::finalize`] is flushed and left in place; the
//! caller decides whether to remove it.

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

fn mapping_error(path: &Path, action: &str, err: impl std::fmt::Display) -> Error {
    Error::MmapFailed(format!("{action} {}: {err}", path.display()))
}

/// An image file mapped writable at its final size.
pub struct Output {
    map: MmapMut,
    path: PathBuf,
    done: bool,
}

impl Output {
    /// Creates (or truncates) `path`, grows it to `len` bytes and maps it.
    ///
    /// # Errors
    /// Returns [`crate::Error::MmapFailed`] if the file cannot be created, sized or mapped.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| mapping_error(&path, "cannot open", e))?;
        file.set_len(len)
            .map_err(|e| mapping_error(&path, "cannot resize", e))?;

        // SAFETY: the file was truncated by this process above and no other mapping of it exists.
        let map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(|e| mapping_error(&path, "cannot map", e))?;

        Ok(Output {
            map,
            path,
            done: false,
        })
    }

    /// Copies `bytes` into the file at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::MmapFailed`] if the range does not fit into the file.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(bytes.len())?))
            .filter(|range| range.end <= self.map.len())
            .ok_or_else(|| {
                Error::MmapFailed(format!(
                    "{} bytes at {offset:#x} do not fit into {} ({} bytes)",
                    bytes.len(),
                    self.path.display(),
                    self.map.len()
                ))
            })?;
        self.map[range].copy_from_slice(bytes);
        Ok(())
    }

    /// File length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// `true` for a zero-length file.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Flushes every write to disk and closes the file.
    ///
    /// # Errors
    /// Returns [`crate::Error::FinalizationFailed`] if the flush fails.
    pub fn finalize(mut self) -> Result<()> {
        self.done = true;
        self.map.flush().map_err(|e| {
            Error::FinalizationFailed(format!("flushing {}: {e}", self.path.display()))
        })
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.map.flush() {
            log::warn!("Unfinished image file {} could not be flushed: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_sections_land_at_their_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("boot.art");

        let mut output = Output::create(&path, 64).unwrap();
        assert_eq!(output.len(), 64);
        assert_eq!(output.path(), path.as_path());
        output.write_at(8, b"payload").unwrap();
        output.write_at(0, b"art\n").unwrap();
        output.finalize().unwrap();

        let contents = fs::read(&path).unwrap();
        assert_eq!(contents.len(), 64);
        assert_eq!(&contents[0..4], b"art\n");
        assert_eq!(&contents[8..15], b"payload");
        assert!(contents[15..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_past_end_is_rejected() {
        let dir = tempdir().unwrap();
        let mut output = Output::create(dir.path().join("small.art"), 4).unwrap();

        assert!(matches!(output.write_at(2, b"abc"), Err(Error::MmapFailed(_))));
        assert!(matches!(output.write_at(u64::MAX, b"a"), Err(Error::MmapFailed(_))));
        assert!(output.write_at(1, b"abc").is_ok());
    }

    #[test]
    fn test_existing_file_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.art");
        fs::write(&path, vec![0xffu8; 32]).unwrap();

        Output::create(&path, 8).unwrap().finalize().unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn test_unfinished_file_is_left_for_caller() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.art");
        {
            let mut output = Output::create(&path, 16).unwrap();
            output.write_at(0, b"body").unwrap();
        }
        assert_eq!(&fs::read(&path).unwrap()[0..4], b"body");
    }
}
