// Copyright 2022 Elemental contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bootloader adapter.  GRUB is never parsed; this module only installs the
//! GRUB images and writes environment files at well-known paths for the
//! shipped grub.cfg to consume.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::config::{Config, Runner};
use crate::partitioner::{Firmware, STATE_LABEL};
use crate::snapshotter::SnapshotterKind;

/// Environment file read by the shipped grub.cfg to pick menu entries.
pub const GRUB_OEM_ENV: &str = "grub_oem_env";
/// Environment file driving the boot-assessment logic.
pub const BOOT_ASSESSMENT_ENV: &str = "boot_assessment";
const GRUB_CUSTOM: &str = "grubcustom";
const BOOT_ASSESSMENT_CFG: &str = "grub_boot_assessment";

/// Kernel command line forced while a boot is being assessed, so a failing
/// early userspace reboots into the fallback instead of hanging in a shell.
const ASSESSMENT_CMDLINE: &str = "rd.emergency=reboot rd.shell=0 panic=5";

/// Install the GRUB images for the target firmware.
pub fn install_grub(
    cfg: &Config,
    firmware: Firmware,
    device: &str,
    state_mount: &Path,
    efi_dir: Option<&Path>,
) -> Result<()> {
    log::info!("Installing GRUB..");
    let boot_dir = state_mount.join("grub2");
    let boot_arg = format!("--boot-directory={}", state_mount.display());
    match firmware {
        Firmware::Bios => {
            cfg.runner
                .run("grub2-install", &["--target=i386-pc", &boot_arg, device])
                .context("installing GRUB for BIOS")?;
        }
        Firmware::Efi => {
            let efi_dir = efi_dir.context("EFI installation without an ESP")?;
            let efi_arg = format!("--efi-directory={}", efi_dir.display());
            cfg.runner
                .run(
                    "grub2-install",
                    &[
                        &format!("--target={}-efi", cfg.platform.arch),
                        &efi_arg,
                        &boot_arg,
                        "--removable",
                        device,
                    ],
                )
                .context("installing GRUB for EFI")?;
        }
    }
    fs::create_dir_all(&boot_dir)
        .with_context(|| format!("creating {}", boot_dir.display()))?;
    Ok(())
}

/// Publish the boot entries: active default, passive snapshot list newest
/// first, and the fallback chain ending in recovery.
pub fn set_boot_entries(
    cfg: &Config,
    efi_dir: &Path,
    default_entry: &str,
    passive_snapshots: &[u32],
    kind: SnapshotterKind,
) -> Result<()> {
    let env_file = efi_dir.join(GRUB_OEM_ENV);
    let passive = passive_snapshots
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<String>>()
        .join(" ");
    let fallback = (0..=passive_snapshots.len())
        .map(|n| n.to_string())
        .chain(std::iter::once("recovery".to_string()))
        .collect::<Vec<String>>()
        .join(" ");
    let default_arg = format!("default_menu_entry={}", default_entry);
    let passive_arg = format!("passive_snapshots={}", passive);
    let fallback_arg = format!("fallback={}", fallback);
    let kind_arg = format!("snapshotter={}", kind);
    cfg.runner
        .run(
            "grub2-editenv",
            &[
                &env_file.to_string_lossy(),
                "set",
                &default_arg,
                &passive_arg,
                &fallback_arg,
                &kind_arg,
            ],
        )
        .context("writing GRUB environment")?;
    Ok(())
}

/// Install the boot-assessment hooks on the state partition.  The initramfs
/// owns the assessment at boot time; this only provides the configuration it
/// sources.
pub fn enable_boot_assessment(state_mount: &Path) -> Result<()> {
    let custom = state_mount.join(GRUB_CUSTOM);
    let custom_body = format!(
        "set bootfile=\"{}\"\nsearch --no-floppy --label {} --set bootfile_loc\nif [ -f \"($bootfile_loc)/$bootfile\" ]; then\n  bootfile_loc=\"($bootfile_loc)/$bootfile\"\n  source \"$bootfile_loc\"\nfi\n",
        BOOT_ASSESSMENT_CFG, STATE_LABEL
    );
    fs::write(&custom, custom_body)
        .with_context(|| format!("writing {}", custom.display()))?;

    let assessment = state_mount.join(BOOT_ASSESSMENT_CFG);
    let assessment_body = format!(
        "set boot_assessment_blk=\"{}\"\nif [ \"${{enable_boot_assessment}}\" = \"yes\" -o \"${{enable_boot_assessment_always}}\" = \"yes\" ]; then\n  set extra_cmdline=\"${{extra_cmdline}} ${{boot_assessment_blk}}\"\nfi\n",
        ASSESSMENT_CMDLINE
    );
    fs::write(&assessment, assessment_body)
        .with_context(|| format!("writing {}", assessment.display()))?;
    Ok(())
}

/// Arm a single-shot assessment of the next boot.  The initramfs clears the
/// flag once the new deployment comes up healthy; administrators may set
/// `enable_boot_assessment_always` instead for permanent assessment.
pub fn arm_boot_assessment(cfg: &Config, state_mount: &Path) -> Result<()> {
    let env_file = state_mount.join(BOOT_ASSESSMENT_ENV);
    cfg.runner
        .run(
            "grub2-editenv",
            &[
                &env_file.to_string_lossy(),
                "set",
                "enable_boot_assessment=yes",
            ],
        )
        .context("arming boot assessment")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    #[test]
    fn test_set_boot_entries() {
        let (cfg, runner, _, _, _) = test_config();
        let efi = tempfile::tempdir().unwrap();
        set_boot_entries(&cfg, efi.path(), "Elemental", &[3, 2], SnapshotterKind::Btrfs)
            .unwrap();
        assert!(runner.ran(&format!(
            "grub2-editenv {} set default_menu_entry=Elemental passive_snapshots=3 2 fallback=0 1 2 recovery snapshotter=btrfs",
            efi.path().join(GRUB_OEM_ENV).display()
        )));
    }

    #[test]
    fn test_set_boot_entries_without_passives() {
        let (cfg, runner, _, _, _) = test_config();
        let efi = tempfile::tempdir().unwrap();
        set_boot_entries(&cfg, efi.path(), "Elemental", &[], SnapshotterKind::LoopDevice)
            .unwrap();
        assert!(runner.ran(&format!(
            "grub2-editenv {} set default_menu_entry=Elemental passive_snapshots= fallback=0 recovery snapshotter=loop-device",
            efi.path().join(GRUB_OEM_ENV).display()
        )));
    }

    #[test]
    fn test_install_grub_bios() {
        let (cfg, runner, _, _, _) = test_config();
        let state = tempfile::tempdir().unwrap();
        install_grub(&cfg, Firmware::Bios, "/dev/sda", state.path(), None).unwrap();
        assert!(runner.ran(&format!(
            "grub2-install --target=i386-pc --boot-directory={} /dev/sda",
            state.path().display()
        )));
    }

    #[test]
    fn test_install_grub_efi_requires_esp() {
        let (cfg, _, _, _, _) = test_config();
        let state = tempfile::tempdir().unwrap();
        assert!(install_grub(&cfg, Firmware::Efi, "/dev/sda", state.path(), None).is_err());

        let efi = tempfile::tempdir().unwrap();
        install_grub(&cfg, Firmware::Efi, "/dev/sda", state.path(), Some(efi.path())).unwrap();
    }

    #[test]
    fn test_boot_assessment_files() {
        let state = tempfile::tempdir().unwrap();
        enable_boot_assessment(state.path()).unwrap();

        let custom = fs::read_to_string(state.path().join("grubcustom")).unwrap();
        assert!(custom.contains("bootfile_loc"));
        assert!(custom.contains("COS_STATE"));

        let assessment =
            fs::read_to_string(state.path().join("grub_boot_assessment")).unwrap();
        assert!(assessment.contains("boot_assessment_blk"));
        assert!(assessment.contains("rd.emergency=reboot rd.shell=0 panic=5"));
        assert!(assessment.contains("enable_boot_assessment_always"));
    }

    #[test]
    fn test_arm_boot_assessment() {
        let (cfg, runner, _, _, _) = test_config();
        let state = tempfile::tempdir().unwrap();
        arm_boot_assessment(&cfg, state.path()).unwrap();
        assert!(runner.ran(&format!(
            "grub2-editenv {} set enable_boot_assessment=yes",
            state.path().join(BOOT_ASSESSMENT_ENV).display()
        )));
    }
}
