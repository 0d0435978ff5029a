//! Pipeline error taxonomy.
//!
//! Errors are categorized by stage:
//! - [`ResolutionError`]: image attach / boot partition mount (fatal)
//! - [`ProvisioningError`]: hash-tree format and report parsing (fatal)
//! - [`SynthesisError`]: init script generation (fatal)
//! - [`RewriteError`]: boot-entry rewriting (per-entry failures are
//!   collected in the rewrite outcome; the variants here abort the stage)

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::options::InvalidOptions;
use crate::runner::CommandError;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Errors that can abort a provisioning run.
///
/// Categorized into stage sub-enums so callers can tell which stage failed:
/// ```ignore
/// match provisioner.run(&image).await {
///     Err(ProvisionError::Resolution(_)) => { /* device/mount problem */ }
///     Err(ProvisionError::Provisioning(_)) => { /* hash tree problem */ }
///     _ => {}
/// }
/// ```
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Options failed validation before the pipeline started.
    #[error("config: {0}")]
    Config(#[from] InvalidOptions),

    /// Device attach or boot-partition mount failed.
    #[error("resolve: {0}")]
    Resolution(#[from] ResolutionError),

    /// Hash-tree construction or report parsing failed.
    #[error("provision: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// Init script synthesis failed.
    #[error("synthesize: {0}")]
    Synthesis(#[from] SynthesisError),

    /// Boot-entry rewrite stage failed.
    #[error("rewrite: {0}")]
    Rewrite(#[from] RewriteError),
}

impl ProvisionError {
    /// Process exit code for this failure.
    ///
    /// Contract: 0 success, 1 config/usage, 2 resolution, 3 provisioning,
    /// 4 synthesis, 5 rewrite.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Resolution(_) => 2,
            Self::Provisioning(_) => 3,
            Self::Synthesis(_) => 4,
            Self::Rewrite(_) => 5,
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

// ============================================================================
// Resolution Errors (loop attach, boot partition mount)
// ============================================================================

/// Errors resolving the disk image into usable device paths, or acquiring
/// the boot partition.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Disk image missing or unreadable.
    #[error("disk image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another run holds the exclusive lock on the image.
    #[error("disk image {path} is locked by another provisioning run")]
    ImageBusy { path: PathBuf },

    /// Locking the image failed for a reason other than contention.
    #[error("lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Loop-device attach command failed.
    #[error("attach {path}: {source}")]
    Attach {
        path: PathBuf,
        #[source]
        source: CommandError,
    },

    /// Attach succeeded but no device node could be found in its output.
    #[error("attach {path}: no device node in losetup output: {output:?}")]
    NoDeviceNode { path: PathBuf, output: String },

    /// Preparing the boot-partition mountpoint failed.
    #[error("mountpoint {path}: {source}")]
    Mountpoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Mounting the boot partition failed.
    #[error("mount {device} on {mountpoint}: {source}")]
    MountBoot {
        device: PathBuf,
        mountpoint: PathBuf,
        #[source]
        source: CommandError,
    },

    /// Unmounting the boot partition failed.
    #[error("unmount {mountpoint}: {source}")]
    UnmountBoot {
        mountpoint: PathBuf,
        #[source]
        source: CommandError,
    },
}

// ============================================================================
// Provisioning Errors (hash-tree format + report parsing)
// ============================================================================

/// Errors building the hash tree or extracting the root hash from the
/// integrity tool's report.
///
/// Parse failures quote the full report so tool output drift can be
/// diagnosed from the error alone.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The format operation failed.
    #[error("hash-tree format on {data}: {source}")]
    Format {
        data: PathBuf,
        #[source]
        source: CommandError,
    },

    /// The post-format verify operation failed.
    #[error("hash-tree verify on {data}: {source}")]
    Verify {
        data: PathBuf,
        #[source]
        source: CommandError,
    },

    /// A labeled field is absent from the report.
    #[error("report field {label:?} not found; full report:\n{report}")]
    MissingField {
        label: &'static str,
        report: String,
    },

    /// A labeled field appears more than once.
    #[error("report field {label:?} appears {count} times; full report:\n{report}")]
    AmbiguousField {
        label: &'static str,
        count: usize,
        report: String,
    },

    /// A labeled field was found but holds no value.
    #[error("report field {label:?} is empty")]
    EmptyField { label: &'static str },

    /// A labeled field is not a hexadecimal string.
    #[error("report field {label:?} is not hexadecimal: {value:?}")]
    NotHex { label: &'static str, value: String },

    /// The root hash does not have the configured algorithm's digest length.
    #[error("root hash is {actual} hex chars, {algorithm} digests are {expected}")]
    DigestLength {
        algorithm: &'static str,
        actual: usize,
        expected: usize,
    },
}

// ============================================================================
// Synthesis Errors (init script generation)
// ============================================================================

/// Errors producing the verified-boot init script.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The external initramfs generator failed.
    #[error("initramfs generator: {0}")]
    Generator(#[source] CommandError),

    /// Creating the staging directory failed.
    #[error("staging dir {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing the init script failed.
    #[error("write init script {path}: {source}")]
    WriteScript {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Marking the init script executable failed.
    #[error("chmod init script {path}: {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The built init sequence violates its own ordering invariants.
    #[error("init sequence invalid: {0}")]
    InvalidSequence(String),
}

// ============================================================================
// Rewrite Errors (boot entries, finalize)
// ============================================================================

/// Errors in the boot-entry rewrite stage.
///
/// Single-entry read/write failures do NOT surface here; they are collected
/// into [`crate::bootentry::RewriteOutcome::failures`] and the remaining
/// entries are still processed. These variants abort the stage.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// The entry name pattern is not a valid glob.
    #[error("entry pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// The entries directory itself could not be listed.
    #[error("list entries dir {path}: {source}")]
    ListEntries {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading one entry failed (carried inside the per-entry outcome).
    #[error("read entry {path}: {source}")]
    ReadEntry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing one entry failed (carried inside the per-entry outcome).
    #[error("write entry {path}: {source}")]
    WriteEntry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The boot-files update hook failed after the entries were rewritten.
    #[error("boot files update: {0}")]
    BootUpdate(#[source] CommandError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_failure() -> CommandError {
        CommandError::Spawn {
            command: "veritysetup format".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        }
    }

    #[test]
    fn test_exit_codes_by_stage() {
        let resolution: ProvisionError = ResolutionError::ImageBusy {
            path: PathBuf::from("/img"),
        }
        .into();
        assert_eq!(resolution.exit_code(), 2);

        let provisioning: ProvisionError = ProvisioningError::Format {
            data: PathBuf::from("/dev/loop0p3"),
            source: command_failure(),
        }
        .into();
        assert_eq!(provisioning.exit_code(), 3);

        let synthesis: ProvisionError =
            SynthesisError::InvalidSequence("no handoff".into()).into();
        assert_eq!(synthesis.exit_code(), 4);

        let rewrite: ProvisionError = RewriteError::ListEntries {
            path: PathBuf::from("mnt/loader/entries"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        }
        .into();
        assert_eq!(rewrite.exit_code(), 5);
    }

    #[test]
    fn test_display_is_stage_labeled() {
        let err: ProvisionError = ProvisioningError::MissingField {
            label: "Root hash:",
            report: "VERITY header information".into(),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.starts_with("provision:"));
        assert!(msg.contains("Root hash:"));

        let err: ProvisionError = ResolutionError::NoDeviceNode {
            path: PathBuf::from("disk.img"),
            output: "losetup: warning".into(),
        }
        .into();
        assert!(err.to_string().starts_with("resolve:"));
    }
}
