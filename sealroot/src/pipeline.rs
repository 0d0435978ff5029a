//! Pipeline driver: sequences the provisioning stages.
//!
//! Strictly sequential; each stage completes (including its external tool
//! invocations) before the next begins, and nothing is retried. The driver
//! has no logic of its own beyond ordering, resource scoping, and the run
//! report.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::bootentry::{self, RewriteOutcome};
use crate::device::{self, HostPartitions, TargetPartitions};
use crate::errors::{ProvisionError, ProvisionResult, ResolutionError, RewriteError};
use crate::initramfs;
use crate::lock::ImageLock;
use crate::mount::MountGuard;
use crate::options::ProvisionOptions;
use crate::runner::{CommandRunner, HostRunner};
use crate::verity::{self, HashTreeRecord};

/// Everything a completed run produced.
#[derive(Debug, Serialize)]
pub struct ProvisionReport {
    /// Loop device the image was attached as (left attached).
    pub loop_device: PathBuf,
    pub partitions: HostPartitions,
    pub record: HashTreeRecord,
    /// Installed init script.
    pub init_script: PathBuf,
    pub rewrite: RewriteOutcome,
}

/// Runs the verified-boot provisioning pipeline over a disk image.
pub struct Provisioner<R = HostRunner> {
    options: ProvisionOptions,
    runner: R,
}

impl Provisioner<HostRunner> {
    /// Provisioner backed by real host commands, with the configured
    /// per-invocation timeout.
    pub fn new(options: ProvisionOptions) -> Self {
        let runner = HostRunner::new(options.tool_timeout);
        Self { options, runner }
    }
}

impl<R: CommandRunner> Provisioner<R> {
    /// Provisioner with an injected runner; used by tests to exercise the
    /// pipeline without real devices.
    pub fn with_runner(options: ProvisionOptions, runner: R) -> Self {
        Self { options, runner }
    }

    pub fn options(&self) -> &ProvisionOptions {
        &self.options
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run the full pipeline: resolve devices, format the hash tree,
    /// synthesize the init script, rewrite the boot entries, update the
    /// boot files.
    ///
    /// The image is locked exclusively for the whole run. Every artifact
    /// is regenerated; nothing from a previous run is reused (a new salt
    /// means a new root hash, so stale artifacts would be unbootable).
    ///
    /// # Arguments
    /// * `image` - Path to the disk image to provision
    ///
    /// # Returns
    /// * `Ok(ProvisionReport)` - Everything the completed run produced
    /// * `Err(...)` - The stage that failed, mapped to an exit code via
    ///   [`ProvisionError::exit_code`]
    ///
    /// # Example
    /// ```rust,no_run
    /// use std::path::Path;
    /// use sealroot::{ProvisionOptions, Provisioner};
    ///
    /// # async fn provision() -> Result<(), sealroot::ProvisionError> {
    /// let provisioner = Provisioner::new(ProvisionOptions::default());
    /// let report = provisioner.run(Path::new("clear.img")).await?;
    /// println!("root hash: {}", report.record.root_hash);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(&self, image: &Path) -> ProvisionResult<ProvisionReport> {
        self.options.sanitize()?;

        let image = image.canonicalize().map_err(|e| ResolutionError::Image {
            path: image.to_path_buf(),
            source: e,
        })?;
        let _lock = ImageLock::acquire(&image)?;

        tracing::info!(image = %image.display(), "Provisioning verified-boot chain");

        let partitions =
            device::attach_image(&self.runner, &image, self.options.partitions).await?;

        let record = verity::format_hash_tree(&self.runner, &partitions, &self.options).await?;
        if self.options.verify_after_format {
            verity::verify_hash_tree(&self.runner, &partitions, &record).await?;
        }

        let target = TargetPartitions::derive(&self.options.target_disk, self.options.partitions);
        let init_script =
            initramfs::synthesize(&self.runner, &record, &target, &self.options).await?;

        let rewrite = self.rewrite_entries(&partitions).await?;
        self.update_boot_files(&partitions).await?;

        tracing::info!(
            rewritten = rewrite.rewritten.len(),
            failed = rewrite.failures.len(),
            "Provisioning complete"
        );
        Ok(ProvisionReport {
            loop_device: partitions.base.clone(),
            partitions,
            record,
            init_script,
            rewrite,
        })
    }

    /// Rewrite stage, with the boot partition mounted for its duration.
    async fn rewrite_entries(
        &self,
        partitions: &HostPartitions,
    ) -> ProvisionResult<RewriteOutcome> {
        let guard =
            MountGuard::mount(&self.runner, &partitions.boot, &self.options.mount_dir).await?;

        let entries_dir = guard.path().join(&self.options.entries_dir);
        let initrd_ref = format!("EFI/{}", self.options.initramfs_name);
        let result =
            bootentry::rewrite_entries(&entries_dir, &self.options.entry_pattern, &initrd_ref);

        match result {
            Ok(outcome) => {
                guard.unmount(&self.runner).await?;
                Ok(outcome)
            }
            // The guard's drop unmounts best-effort on the error path.
            Err(e) => Err(e.into()),
        }
    }

    /// Run the external boot-files update hook: packs the staging tree and
    /// installs the archive on the boot partition.
    async fn update_boot_files(&self, partitions: &HostPartitions) -> Result<(), ProvisionError> {
        let script = self.options.boot_script.to_string_lossy();
        let boot_dev = partitions.boot.to_string_lossy();

        self.runner
            .run_checked("sh", &[&script, &boot_dev, &self.options.initramfs_name])
            .await
            .map_err(|e| ProvisionError::Rewrite(RewriteError::BootUpdate(e)))?;
        Ok(())
    }
}
