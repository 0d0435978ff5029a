//! Boot-time init sequence model.
//!
//! The init script is modeled as an ordered list of [`InitAction`]s rather
//! than free-form text so the ordering invariants can be checked before
//! anything is written: every early mount must be unmounted in strict
//! reverse order before the handoff, and the activation must reference the
//! run's exact root hash.

use std::path::Path;

use crate::device::TargetPartitions;
use crate::errors::SynthesisError;
use crate::verity::{self, HashTreeRecord};

/// Early-boot scaffolding mounts, in mount order.
const PSEUDO_MOUNTS: &[(&str, &str)] = &[
    ("proc", "/proc"),
    ("sysfs", "/sys"),
    ("sbin", "/sbin"),
    ("bin", "/bin"),
    ("lib64", "/lib64"),
    ("devtmpfs", "/dev"),
];

/// Path of the real init the script hands off to.
const REAL_INIT: &str = "/sbin/init";

/// One boot-time action in the generated init script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitAction {
    /// Mount an early-boot pseudo filesystem.
    MountPseudo { fstype: String, target: String },
    /// Activate the verity mapping, parameterized by the run's root hash.
    ActivateMapping { command: String },
    /// Mount the mapped device as the new root.
    MountRoot { mapping_name: String },
    /// Unmount an early-boot pseudo filesystem.
    Unmount { target: String },
    /// Hand off to the real init.
    SwitchRoot { init: String },
}

impl InitAction {
    fn render(&self) -> String {
        match self {
            Self::MountPseudo { fstype, target } => {
                format!("mount -t {fstype} none {target}")
            }
            Self::ActivateMapping { command } => command.clone(),
            Self::MountRoot { mapping_name } => {
                format!("mount /dev/mapper/{mapping_name} /")
            }
            Self::Unmount { target } => format!("umount {target}"),
            Self::SwitchRoot { init } => format!("exec switch_root / {init}"),
        }
    }
}

/// Ordered boot-time actions; renders to the init script.
#[derive(Clone, Debug)]
pub struct InitSequence {
    actions: Vec<InitAction>,
}

impl InitSequence {
    /// Build the canonical verified-boot sequence: scaffolding mounts,
    /// mapping activation over target-machine device paths, root mount,
    /// reverse unmounts, handoff.
    pub fn verified_boot(
        record: &HashTreeRecord,
        target: &TargetPartitions,
        mapping_name: &str,
    ) -> Self {
        let mut actions = Vec::with_capacity(PSEUDO_MOUNTS.len() * 2 + 3);

        for (fstype, target_dir) in PSEUDO_MOUNTS {
            actions.push(InitAction::MountPseudo {
                fstype: (*fstype).to_string(),
                target: (*target_dir).to_string(),
            });
        }

        actions.push(InitAction::ActivateMapping {
            command: verity::activation_command(mapping_name, &target.data, &target.hash, record),
        });
        actions.push(InitAction::MountRoot {
            mapping_name: mapping_name.to_string(),
        });

        for (_, target_dir) in PSEUDO_MOUNTS.iter().rev() {
            actions.push(InitAction::Unmount {
                target: (*target_dir).to_string(),
            });
        }

        actions.push(InitAction::SwitchRoot {
            init: REAL_INIT.to_string(),
        });

        Self { actions }
    }

    pub fn actions(&self) -> &[InitAction] {
        &self.actions
    }

    /// Check the sequence invariants: unmounts mirror the mounts in
    /// reverse, exactly one activation carrying `root_hash` precedes the
    /// root mount, and the handoff comes last.
    pub fn validate(&self, root_hash: &str) -> Result<(), SynthesisError> {
        let mounts: Vec<&str> = self
            .actions
            .iter()
            .filter_map(|a| match a {
                InitAction::MountPseudo { target, .. } => Some(target.as_str()),
                _ => None,
            })
            .collect();
        let unmounts: Vec<&str> = self
            .actions
            .iter()
            .filter_map(|a| match a {
                InitAction::Unmount { target } => Some(target.as_str()),
                _ => None,
            })
            .collect();

        let mut mirrored = mounts.clone();
        mirrored.reverse();
        if unmounts != mirrored {
            return Err(SynthesisError::InvalidSequence(format!(
                "unmounts {unmounts:?} are not the reverse of mounts {mounts:?}"
            )));
        }

        let activations: Vec<&InitAction> = self
            .actions
            .iter()
            .filter(|a| matches!(a, InitAction::ActivateMapping { .. }))
            .collect();
        match activations.as_slice() {
            [InitAction::ActivateMapping { command }] => {
                if root_hash.is_empty() || !command.contains(root_hash) {
                    return Err(SynthesisError::InvalidSequence(
                        "activation does not carry the run's root hash".into(),
                    ));
                }
            }
            _ => {
                return Err(SynthesisError::InvalidSequence(format!(
                    "expected exactly one activation, found {}",
                    activations.len()
                )));
            }
        }

        let activate_pos = self
            .actions
            .iter()
            .position(|a| matches!(a, InitAction::ActivateMapping { .. }));
        let root_pos = self
            .actions
            .iter()
            .position(|a| matches!(a, InitAction::MountRoot { .. }));
        match (activate_pos, root_pos) {
            (Some(a), Some(r)) if a < r => {}
            _ => {
                return Err(SynthesisError::InvalidSequence(
                    "root mount must follow the activation".into(),
                ));
            }
        }

        match self.actions.last() {
            Some(InitAction::SwitchRoot { .. }) => Ok(()),
            _ => Err(SynthesisError::InvalidSequence(
                "sequence must end with the handoff".into(),
            )),
        }
    }

    /// Render the sequence as the init script text.
    pub fn render(&self) -> String {
        let mut script = String::new();
        for action in &self.actions {
            script.push_str(&action.render());
            script.push('\n');
        }
        script
    }
}

/// Init script path inside the staging tree.
pub fn script_path(staging_dir: &Path) -> std::path::PathBuf {
    staging_dir.join("init")
}
