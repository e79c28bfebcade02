// Copyright 2023 Elemental contributors
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

use anyhow::{bail, Context, Result};
use std::path::Path;

use super::{finalize, run_hook, unpack_opts, MountGuard, RUN_DIR};
use crate::blockdev::{filesystem_mountpoint, find_device_by_label, parent_disk, DeviceInfo};
use crate::bootloader::{install_grub, set_boot_entries};
use crate::bootmode::{boot_mode, BootMode};
use crate::cmdline::ResetConfig;
use crate::config::{Config, Mounter, RunConfig};
use crate::partitioner::{
    format_partition, Firmware, ACTIVE_LABEL, EFI_LABEL, OEM_LABEL, PERSISTENT_LABEL,
    RECOVERY_LABEL, STATE_LABEL,
};
use crate::snapshotter::new_snapshotter;
use crate::source::{unpack_source, ImageSource};
use crate::state::{
    load_install_state, now, write_install_state, InstallState, PartitionState, SystemState,
};

pub fn reset(cfg: &Config, run: &RunConfig, action: &ResetConfig) -> Result<()> {
    reset_at(cfg, run, action, Path::new(RUN_DIR), Path::new("/"))
}

pub(crate) fn reset_at(
    cfg: &Config,
    run: &RunConfig,
    action: &ResetConfig,
    run_dir: &Path,
    host_root: &Path,
) -> Result<()> {
    if boot_mode(host_root) != BootMode::Recovery {
        bail!("reset must run from the recovery system");
    }

    let state_dev = find_device_by_label(cfg.runner.as_ref(), STATE_LABEL)
        .context("reset: locating state partition")?;
    reformat(cfg, &state_dev, STATE_LABEL).context("reset: formatting state partition")?;
    if action.reset_persistent {
        let dev = find_device_by_label(cfg.runner.as_ref(), PERSISTENT_LABEL)
            .context("reset: locating persistent partition")?;
        reformat(cfg, &dev, PERSISTENT_LABEL)
            .context("reset: formatting persistent partition")?;
    }
    if action.reset_oem {
        let dev = find_device_by_label(cfg.runner.as_ref(), OEM_LABEL)
            .context("reset: locating oem partition")?;
        reformat(cfg, &dev, OEM_LABEL).context("reset: formatting oem partition")?;
    }

    let state_fs = state_dev.fstype.clone().unwrap_or_else(|| "ext4".to_string());
    let state_guard = MountGuard::mount_rw(cfg, &state_dev.path, &state_fs, &run_dir.join("state"))
        .context("reset: mounting state partition")?;
    let recovery_dev = find_device_by_label(cfg.runner.as_ref(), RECOVERY_LABEL)
        .context("reset: locating recovery partition")?;
    let recovery_fs = recovery_dev
        .fstype
        .clone()
        .unwrap_or_else(|| "ext4".to_string());
    let recovery_guard = MountGuard::mount_rw(
        cfg,
        &recovery_dev.path,
        &recovery_fs,
        &run_dir.join("recovery"),
    )
    .context("reset: mounting recovery partition")?;

    // the previous state file survives on the recovery partition only
    let previous = load_install_state(recovery_guard.path())
        .context("reset: reading state file")?
        .unwrap_or_default();

    let (source, _image_guard) = match &action.system_uri {
        Some(source) if !source.is_empty() => (source.clone(), None),
        _ => recovery_image_source(cfg, recovery_guard.path(), run_dir)
            .context("reset: locating recovery image")?,
    };

    run_hook(cfg, run, "before-reset", None)?;

    let mut snapshotter = new_snapshotter(cfg, run.snapshotter.clone());
    let efi_guard = match find_device_by_label(cfg.runner.as_ref(), EFI_LABEL) {
        Ok(efi_dev) => Some(
            MountGuard::mount_rw(cfg, &efi_dev.path, "vfat", &run_dir.join("efi"))
                .context("reset: mounting ESP")?,
        ),
        Err(_) => None,
    };
    let env_dir = efi_guard
        .as_ref()
        .map(|g| g.path().to_path_buf())
        .unwrap_or_else(|| state_guard.path().join("grub2"));
    snapshotter
        .init(state_guard.path(), &env_dir)
        .context("reset: initializing snapshotter")?;
    let mut snapshot = snapshotter
        .start_transaction()
        .context("reset: starting transaction")?;

    log::info!("Copying {} image...", ACTIVE_LABEL);
    let digest = match unpack_source(
        cfg,
        &source,
        &snapshot.work_dir,
        &unpack_opts(cfg, run, false),
    )
    .context("reset: extracting image")
    .and_then(|digest| {
        run_hook(cfg, run, "after-reset-chroot", Some(&snapshot.work_dir))?;
        Ok(digest)
    }) {
        Ok(digest) => digest,
        Err(e) => {
            let _ = snapshotter.close_transaction_on_error(&snapshot);
            return Err(e);
        }
    };
    if let Err(e) = snapshotter.close_transaction(&mut snapshot) {
        let _ = snapshotter.close_transaction_on_error(&snapshot);
        return Err(e).context("reset: committing snapshot");
    }

    let mut state_partition_state = PartitionState {
        fs_label: STATE_LABEL.to_string(),
        ..Default::default()
    };
    state_partition_state.commit_snapshot(
        snapshot.id,
        SystemState {
            source: source.clone(),
            digest,
            label: Some(ACTIVE_LABEL.to_string()),
            fs: Some(run.snapshotter.fs.clone()),
            date: Some(now()),
            from_action: Some("reset".to_string()),
            ..Default::default()
        },
    );
    let state = InstallState {
        date: now(),
        snapshotter: snapshotter.kind().to_string(),
        state: Some(state_partition_state),
        recovery: previous.recovery.clone(),
        oem: previous.oem.clone(),
        persistent: previous.persistent.clone(),
    };
    write_install_state(&state, &[state_guard.path(), recovery_guard.path()])
        .context("reset: writing state file")?;

    // reformatting the state partition wiped the GRUB modules with it
    let firmware = if efi_guard.is_some() {
        Firmware::Efi
    } else {
        Firmware::Bios
    };
    install_grub(
        cfg,
        firmware,
        &parent_disk(&state_dev.path),
        state_guard.path(),
        efi_guard.as_ref().map(|g| g.path()),
    )
    .context("reset: bootloader")?;
    std::fs::create_dir_all(&env_dir)
        .with_context(|| format!("creating {}", env_dir.display()))?;
    set_boot_entries(cfg, &env_dir, "Elemental", &[], snapshotter.kind())
        .context("reset: bootloader")?;

    run_hook(cfg, run, "after-reset", None)?;
    log::info!("Reset complete.");
    finalize(cfg, action.reboot, action.poweroff, false)
}

/// Unmount if needed and make a fresh filesystem, keeping kind and label.
fn reformat(cfg: &Config, dev: &DeviceInfo, label: &str) -> Result<()> {
    if let Some(mountpoint) = filesystem_mountpoint(cfg.runner.as_ref(), &dev.path)? {
        cfg.mounter
            .unmount(Path::new(&mountpoint))
            .with_context(|| format!("unmounting {}", dev.path))?;
    }
    let fs = dev.fstype.as_deref().unwrap_or("ext4");
    log::info!("Formatting {} as {}", dev.path, fs);
    format_partition(cfg, &dev.path, fs, label)
}

/// Use the recovery image of the running system as the reset source: the
/// loop image or the squashfs, attached and mounted read-only.
fn recovery_image_source<'a>(
    cfg: &'a Config,
    recovery_mount: &Path,
    run_dir: &Path,
) -> Result<(ImageSource, Option<MountGuard<'a>>)> {
    let candidates = [
        (recovery_mount.join("cOS/recovery.img"), "ext4"),
        (recovery_mount.join("cOS/recovery.squashfs"), "squashfs"),
    ];
    for (image, fstype) in candidates {
        if !image.exists() {
            continue;
        }
        let target = run_dir.join("recovery-image");
        let guard = MountGuard::mount_image(cfg, &image, fstype, &target)
            .with_context(|| format!("mounting {}", image.display()))?;
        return Ok((ImageSource::Dir(target), Some(guard)));
    }
    bail!("no recovery image found under {}", recovery_mount.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;
    use std::fs;

    const LSBLK_OUTPUT: &str = r#"NAME="/dev/sda" TYPE="disk"
NAME="/dev/sda2" LABEL="COS_STATE" FSTYPE="ext4" TYPE="part"
NAME="/dev/sda3" LABEL="COS_RECOVERY" FSTYPE="ext2" TYPE="part"
NAME="/dev/sda4" LABEL="COS_OEM" FSTYPE="ext4" TYPE="part"
NAME="/dev/sda5" LABEL="COS_PERSISTENT" FSTYPE="ext2" TYPE="part"
"#;

    fn recovery_host() -> tempfile::TempDir {
        let host_root = tempfile::tempdir().unwrap();
        fs::create_dir_all(host_root.path().join("run/cos")).unwrap();
        fs::write(host_root.path().join("run/cos/recovery_mode"), b"").unwrap();
        host_root
    }

    fn seed_recovery_image(run_dir: &Path) {
        let dir = run_dir.join("recovery/cOS");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("recovery.img"), b"recovery rootfs").unwrap();
    }

    #[test]
    fn test_reset_requires_recovery_mode() {
        let (cfg, _, _, _, _) = test_config();
        let run_dir = tempfile::tempdir().unwrap();
        let host_root = tempfile::tempdir().unwrap();
        let err = reset_at(
            &cfg,
            &RunConfig::default(),
            &ResetConfig::default(),
            run_dir.path(),
            host_root.path(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("recovery"));
    }

    #[test]
    fn test_reset_reformats_state_and_reinstalls() {
        let (cfg, runner, _, _, cloud_init) = test_config();
        runner.on_output("lsblk", LSBLK_OUTPUT);
        runner.on_output("losetup --show -f", "/dev/loop0\n");
        let run_dir = tempfile::tempdir().unwrap();
        let host_root = recovery_host();
        seed_recovery_image(run_dir.path());

        reset_at(
            &cfg,
            &RunConfig::default(),
            &ResetConfig::default(),
            run_dir.path(),
            host_root.path(),
        )
        .unwrap();

        assert!(runner.ran("mkfs.ext4 -L COS_STATE /dev/sda2"));
        // persistent and oem untouched by default
        assert!(!runner.ran("mkfs.ext2 -L COS_PERSISTENT"));
        assert!(!runner.ran("mkfs.ext4 -L COS_OEM"));
        assert!(run_dir.path().join("state/cOS/active.img").exists());
        let state = load_install_state(&run_dir.path().join("state"))
            .unwrap()
            .unwrap();
        assert_eq!(
            state.active_snapshot().unwrap().1.from_action.as_deref(),
            Some("reset")
        );
        // GRUB reinstalled on the freshly formatted state partition
        assert!(runner.ran("grub2-install --target=i386-pc"));
        assert_eq!(
            cloud_init.stages(),
            vec!["before-reset", "after-reset-chroot", "after-reset"]
        );
    }

    #[test]
    fn test_reset_formats_optional_partitions() {
        let (cfg, runner, _, _, _) = test_config();
        runner.on_output("lsblk", LSBLK_OUTPUT);
        runner.on_output("losetup --show -f", "/dev/loop0\n");
        let run_dir = tempfile::tempdir().unwrap();
        let host_root = recovery_host();
        seed_recovery_image(run_dir.path());

        let action = ResetConfig {
            reset_persistent: true,
            reset_oem: true,
            ..Default::default()
        };
        reset_at(
            &cfg,
            &RunConfig::default(),
            &action,
            run_dir.path(),
            host_root.path(),
        )
        .unwrap();

        assert!(runner.ran("mkfs.ext2 -L COS_PERSISTENT /dev/sda5"));
        assert!(runner.ran("mkfs.ext4 -L COS_OEM /dev/sda4"));
    }

    #[test]
    fn test_reset_uses_recovery_squashfs_source() {
        let (cfg, runner, mounter, _, _) = test_config();
        runner.on_output("lsblk", LSBLK_OUTPUT);
        runner.on_output("losetup --show -f", "/dev/loop0\n");
        let run_dir = tempfile::tempdir().unwrap();
        let host_root = recovery_host();
        let dir = run_dir.path().join("recovery/cOS");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("recovery.squashfs"), b"squash").unwrap();

        reset_at(
            &cfg,
            &RunConfig::default(),
            &ResetConfig::default(),
            run_dir.path(),
            host_root.path(),
        )
        .unwrap();

        // the squashfs was loop-attached, mounted read-only and mirrored
        // into the snapshot
        assert!(runner.ran(&format!(
            "losetup --show -f {}",
            dir.join("recovery.squashfs").display()
        )));
        assert!(mounter
            .mounts()
            .iter()
            .any(|(source, _, fstype, opts)| source == "/dev/loop0"
                && fstype == "squashfs"
                && opts.contains(&"ro".to_string())));
        assert!(runner.ran("rsync"));
        assert!(runner.ran("losetup -d /dev/loop0"));
    }
}
