//! dm-verity hash-tree provisioning.
//!
//! Drives the integrity tool's `format` operation over the data and hash
//! partitions and extracts the salt and root hash from its textual report.
//! A report the parser cannot account for is fatal: later stages must
//! never run with an empty or guessed root hash.

mod report;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::HostPartitions;
use crate::errors::ProvisioningError;
use crate::options::ProvisionOptions;
use crate::runner::CommandRunner;

/// Salt and root hash extracted from the format report.
///
/// Both fields hold the literal hex strings the tool printed, trimmed of
/// surrounding whitespace only. The root hash is the exact value the
/// boot-time `create` operation must receive; any re-encoding would make
/// the image unbootable at verification time, not at build time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashTreeRecord {
    pub salt: String,
    pub root_hash: String,
    /// Block size the tree was formatted with (data and hash blocks).
    pub block_size: u32,
}

/// Format the hash tree over the data/hash partition pair and parse the
/// resulting report.
///
/// # Arguments
/// * `runner` - Command runner the format is executed through
/// * `partitions` - Host-side partition paths from the attach stage
/// * `options` - Block size, pinned salt, and the hash algorithm the
///   extracted root hash is validated against
///
/// # Returns
/// * `Ok(HashTreeRecord)` - Salt and root hash, verbatim from the report
/// * `Err(...)` - The tool failed or its report lacked the labeled fields
pub async fn format_hash_tree(
    runner: &dyn CommandRunner,
    partitions: &HostPartitions,
    options: &ProvisionOptions,
) -> Result<HashTreeRecord, ProvisioningError> {
    let data = partitions.data.to_string_lossy().into_owned();
    let hash = partitions.hash.to_string_lossy().into_owned();

    let mut args = vec![
        "--verbose".to_string(),
        format!("--data-block-size={}", options.block_size),
        format!("--hash-block-size={}", options.block_size),
    ];
    if let Some(salt) = &options.salt {
        args.push(format!("--salt={salt}"));
    }
    args.push("format".to_string());
    args.push(data);
    args.push(hash);

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = runner
        .run_checked("veritysetup", &arg_refs)
        .await
        .map_err(|e| ProvisioningError::Format {
            data: partitions.data.clone(),
            source: e,
        })?;

    let record = report::parse(&output.stdout, options)?;
    tracing::info!(
        root_hash = %record.root_hash,
        salt = %record.salt,
        "Hash tree formatted"
    );
    Ok(record)
}

/// Verify the freshly formatted tree against its own root hash.
///
/// Optional sanity pass; catches a corrupted write before the image
/// ships, at the cost of re-reading the data partition.
pub async fn verify_hash_tree(
    runner: &dyn CommandRunner,
    partitions: &HostPartitions,
    record: &HashTreeRecord,
) -> Result<(), ProvisioningError> {
    let data = partitions.data.to_string_lossy().into_owned();
    let hash = partitions.hash.to_string_lossy().into_owned();

    runner
        .run_checked(
            "veritysetup",
            &["--verbose", "verify", &data, &hash, &record.root_hash],
        )
        .await
        .map_err(|e| ProvisioningError::Verify {
            data: partitions.data.clone(),
            source: e,
        })?;

    tracing::debug!("Hash tree verified against root hash");
    Ok(())
}

/// Render the boot-time activation command for the init script.
///
/// This is the `create` counterpart of [`format_hash_tree`]: it is never
/// executed by the pipeline itself, only emitted into the init sequence,
/// over target-machine device paths.
pub fn activation_command(
    mapping_name: &str,
    data_device: &Path,
    hash_device: &Path,
    record: &HashTreeRecord,
) -> String {
    format!(
        "veritysetup --verbose --data-block-size={block} --hash-block-size={block} create {name} {data} {hash} {root}",
        block = record.block_size,
        name = mapping_name,
        data = data_device.display(),
        hash = hash_device.display(),
        root = record.root_hash,
    )
}
