//! Verified-init synthesis: generate and install the boot-time init script.

mod script;

pub use script::{InitAction, InitSequence, script_path};

use std::path::PathBuf;

use crate::device::TargetPartitions;
use crate::errors::SynthesisError;
use crate::options::ProvisionOptions;
use crate::runner::CommandRunner;
use crate::verity::HashTreeRecord;

/// Build the initramfs staging tree and write the verified-boot init
/// script into it.
///
/// The external generator runs first (it creates the staging tree the
/// script lands in); the init sequence is validated before anything is
/// written, so a bad sequence never leaves a partial script behind.
/// Returns the path of the installed script.
pub async fn synthesize(
    runner: &dyn CommandRunner,
    record: &HashTreeRecord,
    target: &TargetPartitions,
    options: &ProvisionOptions,
) -> Result<PathBuf, SynthesisError> {
    let generator = options.initramfs_script.to_string_lossy();
    runner
        .run_checked("sh", &[&generator])
        .await
        .map_err(SynthesisError::Generator)?;

    let sequence = InitSequence::verified_boot(record, target, &options.mapping_name);
    sequence.validate(&record.root_hash)?;
    let script = sequence.render();

    std::fs::create_dir_all(&options.staging_dir).map_err(|e| SynthesisError::Staging {
        path: options.staging_dir.clone(),
        source: e,
    })?;

    let path = script_path(&options.staging_dir);
    std::fs::write(&path, &script).map_err(|e| SynthesisError::WriteScript {
        path: path.clone(),
        source: e,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
            SynthesisError::Permissions {
                path: path.clone(),
                source: e,
            }
        })?;
    }

    tracing::info!(script = %path.display(), "Init script written");
    Ok(path)
}
