//! End-to-end pipeline tests against a scripted command runner.
//!
//! No real devices are involved: the runner plays back canned tool output
//! and simulates the boot partition appearing at the mountpoint, which is
//! exactly the seam the pipeline's injectable runner exists for.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;

use sealroot::errors::ProvisionError;
use sealroot::options::ProvisionOptions;
use sealroot::pipeline::Provisioner;
use sealroot::runner::{CommandError, CommandOutput, CommandRunner, render_command};

const SALT: &str = "e48da609a1f4d30c6e78a55ba16e4ccbf4ea9654a04c1afc14b4bf5f6b9a8d7c";
const ROOT: &str = "9e7a1d71c3df4e75871e53bd9e5d14c07e40f06ffed1d26ba1a1c6ca100eb35a";

const ENTRY_CONTENT: &str = "title Foo\noptions root=/dev/sda3 rw quiet\n";

fn format_report() -> String {
    format!(
        "VERITY header information for /dev/loop7p4\n\
         UUID:            \t6d2f0a58-0f5c-4a7e-a387-0e6b16a2b78c\n\
         Hash type:       \t1\n\
         Data blocks:     \t262144\n\
         Data block size: \t1024\n\
         Hash block size: \t1024\n\
         Hash algorithm:  \tsha256\n\
         Salt:            \t{SALT}\n\
         Root hash:      \t{ROOT}\n\
         Command successful.\n"
    )
}

/// Plays back canned tool behavior and records every invocation.
struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    /// Program whose invocation exits non-zero.
    fail_program: Option<&'static str>,
    /// Entry file content "mounted" into the boot partition; `None`
    /// simulates a boot partition without an entries directory.
    boot_entry: Option<String>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_program: None,
            boot_entry: Some(ENTRY_CONTENT.to_string()),
        }
    }

    fn failing(program: &'static str) -> Self {
        Self {
            fail_program: Some(program),
            ..Self::new()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn call_index(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        self.calls
            .lock()
            .unwrap()
            .push(render_command(program, args));

        if Some(program) == self.fail_program {
            return Ok(CommandOutput {
                status: ExitStatus::from_raw(256),
                stdout: String::new(),
                stderr: format!("{program}: simulated failure"),
            });
        }

        let stdout = match program {
            "losetup" => "/dev/loop7\n".to_string(),
            "veritysetup" if args.contains(&"format") => format_report(),
            "mount" => {
                // The boot partition's contents appear at the mountpoint.
                if let Some(content) = &self.boot_entry {
                    let mountpoint = Path::new(args[args.len() - 1]);
                    let entries = mountpoint.join("loader/entries");
                    std::fs::create_dir_all(&entries).unwrap();
                    std::fs::write(entries.join("Clear-linux.conf"), content).unwrap();
                    std::fs::write(entries.join("loader.conf"), "default Clear-linux\n").unwrap();
                }
                String::new()
            }
            _ => String::new(),
        };

        Ok(CommandOutput {
            status: ExitStatus::from_raw(0),
            stdout,
            stderr: String::new(),
        })
    }
}

struct Fixture {
    _dir: TempDir,
    image: PathBuf,
    options: ProvisionOptions,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();

        let options = ProvisionOptions {
            staging_dir: dir.path().join("initramfs"),
            mount_dir: dir.path().join("mnt"),
            ..Default::default()
        };
        Self {
            _dir: dir,
            image,
            options,
        }
    }

    fn entry_path(&self) -> PathBuf {
        self.options.mount_dir.join("loader/entries/Clear-linux.conf")
    }
}

#[tokio::test]
async fn test_happy_path_produces_consistent_artifacts() {
    let fixture = Fixture::new();
    let provisioner = Provisioner::with_runner(fixture.options.clone(), ScriptedRunner::new());

    let report = provisioner.run(&fixture.image).await.unwrap();

    // Record extracted verbatim from the report.
    assert_eq!(report.record.salt, SALT);
    assert_eq!(report.record.root_hash, ROOT);
    assert_eq!(report.loop_device, PathBuf::from("/dev/loop7"));
    assert_eq!(report.partitions.boot, PathBuf::from("/dev/loop7p1"));
    assert_eq!(report.partitions.data, PathBuf::from("/dev/loop7p3"));
    assert_eq!(report.partitions.hash, PathBuf::from("/dev/loop7p4"));

    // Init script carries the exact root hash over target-disk paths.
    let script = std::fs::read_to_string(&report.init_script).unwrap();
    assert!(script.contains(ROOT));
    assert!(script.contains("create vroot1 /dev/sda3 /dev/sda4"));
    assert!(!script.contains("loop7"));

    // The matching entry lost root=/rw and gained the initrd directive.
    let entry = std::fs::read_to_string(fixture.entry_path()).unwrap();
    assert!(!entry.contains("root=/dev/sda3"));
    assert!(!entry.split_whitespace().any(|t| t == "rw"));
    assert!(entry.contains("options quiet"));
    assert!(entry.contains("initrd EFI/custom_initramfs.cpio.gz"));

    // The non-matching file is untouched.
    let other = std::fs::read_to_string(
        fixture.options.mount_dir.join("loader/entries/loader.conf"),
    )
    .unwrap();
    assert_eq!(other, "default Clear-linux\n");

    assert_eq!(report.rewrite.rewritten.len(), 1);
    assert_eq!(report.rewrite.skipped.len(), 1);
    assert!(report.rewrite.failures.is_empty());
}

#[tokio::test]
async fn test_stages_run_in_order() {
    let fixture = Fixture::new();
    let runner = ScriptedRunner::new();
    let provisioner = Provisioner::with_runner(fixture.options.clone(), runner);

    provisioner.run(&fixture.image).await.unwrap();

    let runner = provisioner.runner();
    let attach = runner.call_index("losetup -f -P --show").unwrap();
    let format = runner.call_index("veritysetup --verbose").unwrap();
    let generator = runner.call_index("sh initramfs.sh").unwrap();
    let mount = runner.call_index("mount /dev/loop7p1").unwrap();
    let unmount = runner.call_index("umount").unwrap();
    let boot_update = runner.call_index("sh boot.sh /dev/loop7p1").unwrap();

    assert!(attach < format);
    assert!(format < generator);
    assert!(generator < mount);
    assert!(mount < unmount);
    assert!(unmount < boot_update);
}

#[tokio::test]
async fn test_format_failure_aborts_before_synthesis() {
    let fixture = Fixture::new();
    let provisioner =
        Provisioner::with_runner(fixture.options.clone(), ScriptedRunner::failing("veritysetup"));

    let err = provisioner.run(&fixture.image).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Provisioning(_)));
    assert_eq!(err.exit_code(), 3);

    let runner = provisioner.runner();
    assert!(runner.call_index("sh initramfs.sh").is_none());
    assert!(runner.call_index("mount").is_none());
    assert!(!fixture.options.staging_dir.join("init").exists());
}

#[tokio::test]
async fn test_missing_report_fields_abort() {
    let fixture = Fixture::new();

    /// Simulates a tool version whose report dropped the labeled lines.
    struct DriftedRunner(ScriptedRunner);

    #[async_trait]
    impl CommandRunner for DriftedRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
            let mut output = self.0.run(program, args).await?;
            if program == "veritysetup" {
                output.stdout = "VERITY header information for /dev/loop7p4\nCommand successful.\n"
                    .to_string();
            }
            Ok(output)
        }
    }

    let provisioner = Provisioner::with_runner(
        fixture.options.clone(),
        DriftedRunner(ScriptedRunner::new()),
    );
    let err = provisioner.run(&fixture.image).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Provisioning(_)));
}

#[tokio::test]
async fn test_mount_failure_skips_rewrite() {
    let fixture = Fixture::new();
    let provisioner =
        Provisioner::with_runner(fixture.options.clone(), ScriptedRunner::failing("mount"));

    let err = provisioner.run(&fixture.image).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Resolution(_)));
    assert_eq!(err.exit_code(), 2);

    // Nothing was unmounted and no boot files were updated.
    let runner = provisioner.runner();
    assert!(runner.call_index("umount").is_none());
    assert!(runner.call_index("sh boot.sh").is_none());
    assert!(!fixture.entry_path().exists());
}

#[tokio::test]
async fn test_missing_entries_dir_is_rewrite_failure() {
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::new();
    runner.boot_entry = None;
    let provisioner = Provisioner::with_runner(fixture.options.clone(), runner);

    let err = provisioner.run(&fixture.image).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Rewrite(_)));
    assert_eq!(err.exit_code(), 5);
}

#[tokio::test]
async fn test_salt_is_randomized_by_default() {
    let fixture = Fixture::new();
    let provisioner = Provisioner::with_runner(fixture.options.clone(), ScriptedRunner::new());

    provisioner.run(&fixture.image).await.unwrap();

    // No pinned salt: the tool randomizes it, so two runs over copies of
    // the same image yield different root hashes.
    let format_call = provisioner
        .runner()
        .calls()
        .into_iter()
        .find(|c| c.contains(" format "))
        .unwrap();
    assert!(!format_call.contains("--salt"));
}

#[tokio::test]
async fn test_pinned_salt_is_forwarded() {
    let fixture = Fixture::new();
    let options = ProvisionOptions {
        salt: Some(SALT.to_string()),
        ..fixture.options.clone()
    };
    let provisioner = Provisioner::with_runner(options, ScriptedRunner::new());

    provisioner.run(&fixture.image).await.unwrap();

    let format_call = provisioner
        .runner()
        .calls()
        .into_iter()
        .find(|c| c.contains(" format "))
        .unwrap();
    assert!(format_call.contains(&format!("--salt={SALT}")));
}

#[tokio::test]
async fn test_verify_after_format_runs_verify() {
    let fixture = Fixture::new();
    let options = ProvisionOptions {
        verify_after_format: true,
        ..fixture.options.clone()
    };
    let provisioner = Provisioner::with_runner(options, ScriptedRunner::new());

    provisioner.run(&fixture.image).await.unwrap();

    let verify_call = provisioner
        .runner()
        .calls()
        .into_iter()
        .find(|c| c.contains(" verify "))
        .unwrap();
    assert!(verify_call.contains(ROOT));
}

#[tokio::test]
async fn test_rerun_on_rewritten_entry_is_idempotent() {
    let fixture = Fixture::new();
    let mut runner = ScriptedRunner::new();
    // The boot partition already went through a rewrite.
    runner.boot_entry = Some(
        "title Foo\noptions quiet\ninitrd EFI/custom_initramfs.cpio.gz\n".to_string(),
    );
    let provisioner = Provisioner::with_runner(fixture.options.clone(), runner);

    let report = provisioner.run(&fixture.image).await.unwrap();
    assert_eq!(report.rewrite.rewritten.len(), 1);

    let entry = std::fs::read_to_string(fixture.entry_path()).unwrap();
    assert_eq!(entry.matches("initrd ").count(), 1);
    assert_eq!(
        entry,
        "title Foo\noptions quiet\ninitrd EFI/custom_initramfs.cpio.gz\n"
    );
}

#[tokio::test]
async fn test_nonexistent_image_is_resolution_error() {
    let fixture = Fixture::new();
    let provisioner = Provisioner::with_runner(fixture.options.clone(), ScriptedRunner::new());

    let err = provisioner
        .run(Path::new("/nonexistent/disk.img"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Resolution(_)));
    assert_eq!(err.exit_code(), 2);
    assert!(provisioner.runner().calls().is_empty());
}

#[tokio::test]
async fn test_report_serializes() {
    let fixture = Fixture::new();
    let provisioner = Provisioner::with_runner(fixture.options.clone(), ScriptedRunner::new());

    let report = provisioner.run(&fixture.image).await.unwrap();
    let json = serde_json::to_string_pretty(&report).unwrap();
    assert!(json.contains(ROOT));
    assert!(json.contains("loop_device"));
}
