//! Exclusive image lock for the duration of a pipeline run.
//!
//! Concurrent runs against the same disk image would race on the loop
//! attachment, the hash partition, and the boot entries, so the image file
//! itself is locked with `flock` for the whole pipeline. The lock is
//! released when the guard is dropped, or by the OS if the process dies.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::ResolutionError;

/// Exclusive lock on the disk image.
#[derive(Debug)]
pub struct ImageLock {
    #[allow(dead_code)] // held for lifetime, not directly accessed
    file: File,
    path: PathBuf,
}

impl ImageLock {
    /// Acquire the lock, non-blocking.
    ///
    /// A held lock maps to [`ResolutionError::ImageBusy`]; a missing or
    /// unreadable image maps to [`ResolutionError::Image`].
    pub fn acquire(image: &Path) -> Result<Self, ResolutionError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(image)
            .map_err(|e| ResolutionError::Image {
                path: image.to_path_buf(),
                source: e,
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let fd = file.as_raw_fd();
            let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Err(ResolutionError::ImageBusy {
                        path: image.to_path_buf(),
                    });
                }
                return Err(ResolutionError::Lock {
                    path: image.to_path_buf(),
                    source: err,
                });
            }
        }

        tracing::debug!(image = %image.display(), "Acquired image lock");

        Ok(ImageLock {
            file,
            path: image.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ImageLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file closes; unlock explicitly
        // for clarity.
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = self.file.as_raw_fd();
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }

        tracing::debug!(image = %self.path.display(), "Released image lock");
    }
}
