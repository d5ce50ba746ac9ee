//! Filesystem statistics seam.
//!
//! The allocator only ever asks four questions about the filesystem; this
//! trait answers them and keeps the allocator testable without a disk.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Filesystem facts the allocator needs.
pub trait FsStats: Send + Sync {
    /// Mount point of the filesystem holding `path`.
    fn mount_point(&self, path: &Path) -> io::Result<PathBuf>;

    /// Total size of the filesystem mounted at `mount`.
    fn total_size(&self, mount: &Path) -> io::Result<u64>;

    /// Currently available bytes on the filesystem mounted at `mount`.
    fn available_size(&self, mount: &Path) -> io::Result<u64>;

    /// Recursive size of a directory tree.
    fn dir_size(&self, path: &Path) -> io::Result<u64>;
}

/// `statvfs`-backed implementation for the host filesystem.
pub struct HostFs;

impl HostFs {
    fn statvfs(path: &Path) -> io::Result<libc::statvfs> {
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stat)
    }

    fn device_of(path: &Path) -> io::Result<u64> {
        use std::os::unix::fs::MetadataExt;
        Ok(std::fs::metadata(path)?.dev())
    }
}

impl FsStats for HostFs {
    fn mount_point(&self, path: &Path) -> io::Result<PathBuf> {
        // Walk up until the parent lives on a different device.
        let mut current = path.canonicalize()?;
        let device = Self::device_of(&current)?;

        while let Some(parent) = current.parent() {
            if Self::device_of(parent)? != device {
                break;
            }
            current = parent.to_path_buf();
        }

        Ok(current)
    }

    fn total_size(&self, mount: &Path) -> io::Result<u64> {
        let stat = Self::statvfs(mount)?;
        Ok(stat.f_blocks as u64 * stat.f_frsize as u64)
    }

    fn available_size(&self, mount: &Path) -> io::Result<u64> {
        let stat = Self::statvfs(mount)?;
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    fn dir_size(&self, path: &Path) -> io::Result<u64> {
        let mut total = 0;
        for entry in walkdir::WalkDir::new(path).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }
}
