//! Pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Options failed validation before the pipeline started.
#[derive(Debug, Error)]
#[error("invalid options: {0}")]
pub struct InvalidOptions(pub String);

/// Hash algorithm the integrity tool builds the tree with.
///
/// Drives validation of the extracted root hash; the format invocation
/// itself keeps the tool's default algorithm selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn digest_bytes(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Expected root-hash length in hex characters.
    pub fn digest_hex_len(&self) -> usize {
        self.digest_bytes() * 2
    }
}

/// Partition numbers inside the disk image.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PartitionIndices {
    /// FAT boot partition holding the loader entries.
    pub boot: u32,
    /// Root filesystem partition the hash tree protects.
    pub data: u32,
    /// Companion partition the hash tree is written to.
    pub hash: u32,
}

impl Default for PartitionIndices {
    fn default() -> Self {
        Self {
            boot: 1,
            data: 3,
            hash: 4,
        }
    }
}

/// Configuration for one provisioning run.
///
/// Defaults carry the fixed values of the reference image layout: a
/// four-partition disk with the boot partition first and the data/hash
/// pair at 3/4, 1 KiB verity blocks, and systemd-boot style entries under
/// `loader/entries`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvisionOptions {
    /// Partition numbers for the boot/data/hash partitions.
    #[serde(default)]
    pub partitions: PartitionIndices,

    /// dm-verity block size in bytes, used for both data and hash blocks.
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Hash algorithm used to validate the extracted root hash.
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,

    /// Pinned hash-tree salt (hex). `None` lets the tool randomize it, so
    /// two runs over the same image produce different root hashes.
    #[serde(default)]
    pub salt: Option<String>,

    /// Run the integrity tool's verify operation right after format.
    #[serde(default)]
    pub verify_after_format: bool,

    /// Name of the verity mapping the init script activates.
    #[serde(default = "default_mapping_name")]
    pub mapping_name: String,

    /// Whole-disk device the target machine boots from. Partition paths in
    /// the generated init script are derived from this, never from the
    /// provisioning-time loop device.
    #[serde(default = "default_target_disk")]
    pub target_disk: PathBuf,

    /// Initramfs staging directory; the init script lands at
    /// `<staging_dir>/init`.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Generator script that builds the initramfs staging tree, run before
    /// the init script is written.
    #[serde(default = "default_initramfs_script")]
    pub initramfs_script: PathBuf,

    /// Update script that packs the staging tree and installs the archive
    /// on the boot partition, run after the entries are rewritten.
    #[serde(default = "default_boot_script")]
    pub boot_script: PathBuf,

    /// File name of the initramfs archive referenced from boot entries.
    #[serde(default = "default_initramfs_name")]
    pub initramfs_name: String,

    /// Mountpoint for the boot partition during the rewrite stage,
    /// recreated on every run.
    #[serde(default = "default_mount_dir")]
    pub mount_dir: PathBuf,

    /// Boot-entry directory, relative to the boot partition root.
    #[serde(default = "default_entries_dir")]
    pub entries_dir: PathBuf,

    /// Glob pattern selecting the entry files to rewrite.
    #[serde(default = "default_entry_pattern")]
    pub entry_pattern: String,

    /// Per-invocation timeout for external tools.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout: Duration,
}

fn default_block_size() -> u32 {
    1024
}

fn default_mapping_name() -> String {
    "vroot1".to_string()
}

fn default_target_disk() -> PathBuf {
    PathBuf::from("/dev/sda")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("initramfs")
}

fn default_initramfs_script() -> PathBuf {
    PathBuf::from("initramfs.sh")
}

fn default_boot_script() -> PathBuf {
    PathBuf::from("boot.sh")
}

fn default_initramfs_name() -> String {
    "custom_initramfs.cpio.gz".to_string()
}

fn default_mount_dir() -> PathBuf {
    PathBuf::from("mnt")
}

fn default_entries_dir() -> PathBuf {
    PathBuf::from("loader/entries")
}

fn default_entry_pattern() -> String {
    "Clear-*".to_string()
}

fn default_tool_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            partitions: PartitionIndices::default(),
            block_size: default_block_size(),
            hash_algorithm: HashAlgorithm::default(),
            salt: None,
            verify_after_format: false,
            mapping_name: default_mapping_name(),
            target_disk: default_target_disk(),
            staging_dir: default_staging_dir(),
            initramfs_script: default_initramfs_script(),
            boot_script: default_boot_script(),
            initramfs_name: default_initramfs_name(),
            mount_dir: default_mount_dir(),
            entries_dir: default_entries_dir(),
            entry_pattern: default_entry_pattern(),
            tool_timeout: default_tool_timeout(),
        }
    }
}

impl ProvisionOptions {
    /// Validate option combinations before a run.
    pub fn sanitize(&self) -> Result<(), InvalidOptions> {
        let p = self.partitions;
        if p.boot == 0 || p.data == 0 || p.hash == 0 {
            return Err(InvalidOptions("partition numbers start at 1".into()));
        }
        if p.boot == p.data || p.boot == p.hash || p.data == p.hash {
            return Err(InvalidOptions(format!(
                "partition numbers must be distinct (boot={}, data={}, hash={})",
                p.boot, p.data, p.hash
            )));
        }
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(InvalidOptions(format!(
                "block size must be a power of two >= 512, got {}",
                self.block_size
            )));
        }
        if let Some(salt) = &self.salt {
            if salt.is_empty() || hex::decode(salt).is_err() {
                return Err(InvalidOptions(format!(
                    "pinned salt must be a non-empty hex string, got {salt:?}"
                )));
            }
        }
        if self.mapping_name.is_empty()
            || self
                .mapping_name
                .contains(|c: char| c.is_whitespace() || c == '/')
        {
            return Err(InvalidOptions(format!(
                "mapping name must be a single path-free word, got {:?}",
                self.mapping_name
            )));
        }
        if self.entry_pattern.is_empty() {
            return Err(InvalidOptions("entry pattern must not be empty".into()));
        }
        if let Err(e) = glob::Pattern::new(&self.entry_pattern) {
            return Err(InvalidOptions(format!(
                "entry pattern {:?} is not a valid glob: {e}",
                self.entry_pattern
            )));
        }
        if self.initramfs_name.is_empty() {
            return Err(InvalidOptions("initramfs name must not be empty".into()));
        }
        if self.tool_timeout.is_zero() {
            return Err(InvalidOptions("tool timeout must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_layout() {
        let opts = ProvisionOptions::default();
        assert_eq!(opts.partitions.boot, 1);
        assert_eq!(opts.partitions.data, 3);
        assert_eq!(opts.partitions.hash, 4);
        assert_eq!(opts.block_size, 1024);
        assert_eq!(opts.mapping_name, "vroot1");
        assert_eq!(opts.initramfs_name, "custom_initramfs.cpio.gz");
        assert_eq!(opts.entries_dir, PathBuf::from("loader/entries"));
        assert_eq!(opts.entry_pattern, "Clear-*");
        assert!(opts.sanitize().is_ok());
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(HashAlgorithm::Sha256.digest_hex_len(), 64);
        assert_eq!(HashAlgorithm::Sha512.digest_hex_len(), 128);
    }

    #[test]
    fn test_sanitize_rejects_overlapping_partitions() {
        let opts = ProvisionOptions {
            partitions: PartitionIndices {
                boot: 1,
                data: 3,
                hash: 3,
            },
            ..Default::default()
        };
        assert!(opts.sanitize().is_err());
    }

    #[test]
    fn test_sanitize_rejects_bad_block_size() {
        for block_size in [0, 100, 1000] {
            let opts = ProvisionOptions {
                block_size,
                ..Default::default()
            };
            assert!(opts.sanitize().is_err(), "block size {block_size}");
        }
    }

    #[test]
    fn test_sanitize_rejects_non_hex_salt() {
        let opts = ProvisionOptions {
            salt: Some("not-hex".into()),
            ..Default::default()
        };
        assert!(opts.sanitize().is_err());

        let opts = ProvisionOptions {
            salt: Some("deadbeef".into()),
            ..Default::default()
        };
        assert!(opts.sanitize().is_ok());
    }

    #[test]
    fn test_sanitize_rejects_bad_entry_pattern() {
        let opts = ProvisionOptions {
            entry_pattern: "Clear-[".into(),
            ..Default::default()
        };
        assert!(opts.sanitize().is_err());
    }

    #[test]
    fn test_sanitize_rejects_bad_mapping_name() {
        let opts = ProvisionOptions {
            mapping_name: "v root".into(),
            ..Default::default()
        };
        assert!(opts.sanitize().is_err());
    }

    #[test]
    fn test_options_serde_defaults() {
        let opts: ProvisionOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.block_size, 1024);
        assert_eq!(opts.mapping_name, "vroot1");
        assert_eq!(opts.tool_timeout, Duration::from_secs(120));
    }
}
