//! Scoped boot-partition mount.

use std::path::{Path, PathBuf};

use crate::errors::ResolutionError;
use crate::runner::CommandRunner;

/// Boot-partition mount held for the duration of the rewrite stage.
///
/// The success path is the explicit [`MountGuard::unmount`], which surfaces
/// failures. If the guard is dropped while still mounted (an error path), a
/// blocking best-effort `umount` runs so the partition is never left
/// mounted behind a failed run.
#[derive(Debug)]
pub struct MountGuard {
    mountpoint: PathBuf,
    mounted: bool,
}

impl MountGuard {
    /// Recreate `mountpoint` and mount `device` on it.
    pub async fn mount(
        runner: &dyn CommandRunner,
        device: &Path,
        mountpoint: &Path,
    ) -> Result<Self, ResolutionError> {
        // A leftover mountpoint from an earlier run is stale state.
        if mountpoint.exists() {
            std::fs::remove_dir_all(mountpoint).map_err(|e| ResolutionError::Mountpoint {
                path: mountpoint.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::create_dir_all(mountpoint).map_err(|e| ResolutionError::Mountpoint {
            path: mountpoint.to_path_buf(),
            source: e,
        })?;

        let device_arg = device.to_string_lossy();
        let mountpoint_arg = mountpoint.to_string_lossy();
        runner
            .run_checked("mount", &[&device_arg, &mountpoint_arg])
            .await
            .map_err(|e| ResolutionError::MountBoot {
                device: device.to_path_buf(),
                mountpoint: mountpoint.to_path_buf(),
                source: e,
            })?;

        tracing::debug!(
            device = %device.display(),
            mountpoint = %mountpoint.display(),
            "Mounted boot partition"
        );
        Ok(Self {
            mountpoint: mountpoint.to_path_buf(),
            mounted: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount explicitly, surfacing failures.
    pub async fn unmount(mut self, runner: &dyn CommandRunner) -> Result<(), ResolutionError> {
        self.mounted = false;
        let mountpoint_arg = self.mountpoint.to_string_lossy().into_owned();
        runner
            .run_checked("umount", &[&mountpoint_arg])
            .await
            .map_err(|e| ResolutionError::UnmountBoot {
                mountpoint: self.mountpoint.clone(),
                source: e,
            })?;
        tracing::debug!(mountpoint = %self.mountpoint.display(), "Unmounted boot partition");
        Ok(())
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        match std::process::Command::new("umount")
            .arg(&self.mountpoint)
            .status()
        {
            Ok(status) if status.success() => {
                tracing::debug!(
                    mountpoint = %self.mountpoint.display(),
                    "Unmounted boot partition on drop"
                );
            }
            Ok(status) => {
                tracing::warn!(
                    "umount {} on drop exited with {}",
                    self.mountpoint.display(),
                    status
                );
            }
            Err(e) => {
                tracing::warn!(
                    "failed to run umount for {} on drop: {}",
                    self.mountpoint.display(),
                    e
                );
            }
        }
    }
}
