use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, ValueEnum};

use sealroot::options::{HashAlgorithm, PartitionIndices, ProvisionOptions};
use sealroot::pipeline::{ProvisionReport, Provisioner};

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Path to the disk image
    pub image: PathBuf,

    /// Boot partition number
    #[arg(long, default_value_t = 1)]
    pub boot_part: u32,

    /// Data (root filesystem) partition number
    #[arg(long, default_value_t = 3)]
    pub data_part: u32,

    /// Hash-tree partition number
    #[arg(long, default_value_t = 4)]
    pub hash_part: u32,

    /// dm-verity data/hash block size in bytes
    #[arg(long, default_value_t = 1024)]
    pub block_size: u32,

    /// Hash algorithm used to validate the extracted root hash
    #[arg(long, value_enum, default_value = "sha256")]
    pub hash: HashArg,

    /// Pin the hash-tree salt (hex); omit for a randomized salt
    #[arg(long)]
    pub salt: Option<String>,

    /// Verify the hash tree against the root hash after formatting
    #[arg(long)]
    pub verify: bool,

    /// Name of the verity mapping activated at boot
    #[arg(long, default_value = "vroot1")]
    pub mapping_name: String,

    /// Whole-disk device the target machine boots from
    #[arg(long, default_value = "/dev/sda")]
    pub target_disk: PathBuf,

    /// Initramfs staging directory (init script lands at <DIR>/init)
    #[arg(long, default_value = "initramfs")]
    pub staging_dir: PathBuf,

    /// Script that builds the initramfs staging tree
    #[arg(long, default_value = "initramfs.sh")]
    pub initramfs_script: PathBuf,

    /// Script that packs the staging tree and installs it on the boot partition
    #[arg(long, default_value = "boot.sh")]
    pub boot_script: PathBuf,

    /// File name of the initramfs archive referenced from boot entries
    #[arg(long, default_value = "custom_initramfs.cpio.gz")]
    pub initramfs_name: String,

    /// Mountpoint used for the boot partition during the rewrite
    #[arg(long, default_value = "mnt")]
    pub mount_dir: PathBuf,

    /// Entry directory, relative to the boot partition root
    #[arg(long, default_value = "loader/entries")]
    pub entries_dir: PathBuf,

    /// Glob pattern selecting the entry files to rewrite
    #[arg(long, default_value = "Clear-*")]
    pub entry_pattern: String,

    /// Per-invocation timeout for external tools, in seconds
    #[arg(long, default_value_t = 120)]
    pub tool_timeout: u64,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum HashArg {
    Sha256,
    Sha512,
}

impl From<HashArg> for HashAlgorithm {
    fn from(arg: HashArg) -> Self {
        match arg {
            HashArg::Sha256 => HashAlgorithm::Sha256,
            HashArg::Sha512 => HashAlgorithm::Sha512,
        }
    }
}

impl ProvisionArgs {
    fn options(&self) -> ProvisionOptions {
        ProvisionOptions {
            partitions: PartitionIndices {
                boot: self.boot_part,
                data: self.data_part,
                hash: self.hash_part,
            },
            block_size: self.block_size,
            hash_algorithm: self.hash.into(),
            salt: self.salt.clone(),
            verify_after_format: self.verify,
            mapping_name: self.mapping_name.clone(),
            target_disk: self.target_disk.clone(),
            staging_dir: self.staging_dir.clone(),
            initramfs_script: self.initramfs_script.clone(),
            boot_script: self.boot_script.clone(),
            initramfs_name: self.initramfs_name.clone(),
            mount_dir: self.mount_dir.clone(),
            entries_dir: self.entries_dir.clone(),
            entry_pattern: self.entry_pattern.clone(),
            tool_timeout: Duration::from_secs(self.tool_timeout),
        }
    }
}

pub async fn execute(args: ProvisionArgs) -> anyhow::Result<u8> {
    tracing::debug!(image = %args.image.display(), "Starting provisioning run");
    let provisioner = Provisioner::new(args.options());

    match provisioner.run(&args.image).await {
        Ok(report) => {
            print_report(&report, args.json)?;
            if report.rewrite.failures.is_empty() {
                Ok(0)
            } else {
                // The run completed, but scripted callers must notice.
                Ok(5)
            }
        }
        Err(err) => {
            eprintln!("Error: {err}");
            Ok(err.exit_code() as u8)
        }
    }
}

fn print_report(report: &ProvisionReport, json: bool) -> anyhow::Result<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(report).context("serializing provision report")?;
        println!("{rendered}");
        return Ok(());
    }

    println!("loop device:  {}", report.loop_device.display());
    println!("root hash:    {}", report.record.root_hash);
    println!("salt:         {}", report.record.salt);
    println!("init script:  {}", report.init_script.display());
    println!("entries:      {} rewritten", report.rewrite.rewritten.len());
    for failure in &report.rewrite.failures {
        eprintln!(
            "warning: entry {} not rewritten: {}",
            failure.path.display(),
            failure.error
        );
    }
    Ok(())
}
