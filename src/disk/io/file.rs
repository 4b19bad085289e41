use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use crate::{error::disk::*, storage_info::FileInfo};

/// A single torrent file opened on disk, read and written using positioned
/// IO (`pread`/`pwrite`) so concurrent pieces touching the same file never
/// need to coordinate a shared cursor.
///
/// Padding files (BEP 47) never reach this type: the storage writer
/// synthesizes their bytes and skips them on write.
pub struct TorrentFile {
    pub info: FileInfo,
    pub handle: File,
}

impl TorrentFile {
    /// Opens the file in create, read, and write modes at the path of
    /// combining download directory and the path defined in the file info,
    /// creating any missing parent directories.
    pub fn new(download_dir: &Path, info: FileInfo) -> Result<Self, NewTorrentError> {
        log::trace!(
            "Opening and creating file {:?}, in dir {:?}",
            info,
            download_dir
        );

        let path = download_dir.join(&info.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(NewTorrentError::Io)?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .map_err(|e| {
                log::warn!("Failed to open file {:?}", path);
                NewTorrentError::Io(e)
            })?;

        if self_len(&info) > 0 {
            handle.set_len(self_len(&info)).map_err(NewTorrentError::Io)?;
        }

        debug_assert!(path.exists());
        Ok(Self { info, handle })
    }

    /// Writes `data` at `offset` bytes into the file.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), WriteError> {
        self.handle.write_all_at(data, offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WriteZero {
                WriteError::ShortWrite {
                    written: 0,
                    expected: data.len() as u64,
                }
            } else {
                WriteError::from(e)
            }
        })
    }

    /// Reads exactly `buf.len()` bytes starting at `offset` bytes into the
    /// file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        self.handle
            .read_exact_at(buf, offset)
            .map_err(ReadError::Io)
    }
}

fn self_len(info: &FileInfo) -> u64 {
    info.len
}
