//! Loop-device attachment and partition path derivation.
//!
//! Two partition namespaces exist and must never be conflated: the
//! provisioning host sees the image through a loop device
//! (`/dev/loop0p3`), while the booted target machine sees the real disk
//! (`/dev/sda3`). [`HostPartitions`] and [`TargetPartitions`] keep them
//! apart at the type level; only the latter may appear in the generated
//! init script.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::errors::ResolutionError;
use crate::options::PartitionIndices;
use crate::runner::CommandRunner;

/// Partition device paths as seen from the provisioning host.
#[derive(Clone, Debug, Serialize)]
pub struct HostPartitions {
    /// Loop device the image is attached as.
    pub base: PathBuf,
    pub boot: PathBuf,
    pub data: PathBuf,
    pub hash: PathBuf,
}

impl HostPartitions {
    pub fn derive(base: &Path, indices: PartitionIndices) -> Self {
        Self {
            base: base.to_path_buf(),
            boot: partition_path(base, indices.boot),
            data: partition_path(base, indices.data),
            hash: partition_path(base, indices.hash),
        }
    }
}

/// Data and hash partition paths as the booted target machine sees them.
#[derive(Clone, Debug, Serialize)]
pub struct TargetPartitions {
    pub data: PathBuf,
    pub hash: PathBuf,
}

impl TargetPartitions {
    pub fn derive(disk: &Path, indices: PartitionIndices) -> Self {
        Self {
            data: partition_path(disk, indices.data),
            hash: partition_path(disk, indices.hash),
        }
    }
}

/// `<base>p<n>` when the base name ends in a digit (loop devices),
/// `<base><n>` otherwise (whole disks).
pub fn partition_path(base: &Path, index: u32) -> PathBuf {
    let base = base.to_string_lossy();
    let separator = if base.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    PathBuf::from(format!("{base}{separator}{index}"))
}

/// Attach the disk image as a loop device with partition scanning and
/// derive the partition device paths.
///
/// The attachment is system-wide and deliberately outlives the run; an
/// external collaborator detaches it. Attach failure is fatal, there is
/// no retry.
///
/// # Arguments
/// * `runner` - Command runner the attach is executed through
/// * `image` - Path to the disk image
/// * `indices` - Partition numbers for the boot/data/hash partitions
///
/// # Returns
/// * `Ok(HostPartitions)` - Loop device plus the derived partition paths
/// * `Err(...)` - The attach command failed or printed no device node
pub async fn attach_image(
    runner: &dyn CommandRunner,
    image: &Path,
    indices: PartitionIndices,
) -> Result<HostPartitions, ResolutionError> {
    let image_arg = image.to_string_lossy();
    let output = runner
        .run_checked("losetup", &["-f", "-P", "--show", &image_arg])
        .await
        .map_err(|e| ResolutionError::Attach {
            path: image.to_path_buf(),
            source: e,
        })?;

    let base = parse_attach_output(&output.stdout).ok_or_else(|| ResolutionError::NoDeviceNode {
        path: image.to_path_buf(),
        output: output.stdout.clone(),
    })?;

    let partitions = HostPartitions::derive(&base, indices);
    tracing::info!(
        image = %image.display(),
        device = %base.display(),
        "Attached image (loop device left attached for external cleanup)"
    );
    Ok(partitions)
}

/// Pick the device node out of the attach command's stdout.
///
/// The node is normally the only line, but warnings may precede it; the
/// last `/dev/`-prefixed line wins.
fn parse_attach_output(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("/dev/"))
        .next_back()
        .map(PathBuf::from)
}
