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

use super::{finalize, install_recovery, run_hook, unpack_opts, MountGuard, RUN_DIR};
use crate::blockdev::{find_device_by_label, parent_disk};
use crate::bootloader::{arm_boot_assessment, install_grub, set_boot_entries};
use crate::bootmode::upgrade_failure;
use crate::cmdline::UpgradeConfig;
use crate::config::{Config, RunConfig};
use crate::partitioner::{Firmware, ACTIVE_LABEL, EFI_LABEL, RECOVERY_LABEL, STATE_LABEL};
use crate::snapshotter::new_snapshotter;
use crate::source::{unpack_source, ImageSource};
use crate::state::{load_install_state, now, InstallState, PartitionState, SystemState};

pub fn upgrade(cfg: &Config, run: &RunConfig, action: &UpgradeConfig) -> Result<()> {
    upgrade_at(cfg, run, action, Path::new(RUN_DIR), Path::new("/"))
}

pub(crate) fn upgrade_at(
    cfg: &Config,
    run: &RunConfig,
    action: &UpgradeConfig,
    run_dir: &Path,
    host_root: &Path,
) -> Result<()> {
    if upgrade_failure(host_root) && !action.force {
        bail!("the last upgrade was assessed as failed; pass --force to upgrade anyway");
    }
    let source = action
        .system_uri
        .clone()
        .context("an image source must be specified")?;
    if source.is_empty() {
        bail!("the image source is empty");
    }

    let state_dev = find_device_by_label(cfg.runner.as_ref(), STATE_LABEL)
        .context("upgrade: locating state partition")?;
    let state_fs = state_dev.fstype.clone().unwrap_or_else(|| "ext4".to_string());
    let state_guard = MountGuard::mount_rw(cfg, &state_dev.path, &state_fs, &run_dir.join("state"))
        .context("upgrade: mounting state partition")?;
    let recovery_dev = find_device_by_label(cfg.runner.as_ref(), RECOVERY_LABEL)
        .context("upgrade: locating recovery partition")?;
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
    .context("upgrade: mounting recovery partition")?;

    let mut state = load_install_state(state_guard.path())
        .context("upgrade: reading state file")?
        .unwrap_or_default();

    if action.recovery {
        return upgrade_recovery_only(
            cfg,
            run,
            action,
            &source,
            &mut state,
            &state_guard,
            &recovery_guard,
        );
    }

    // honor the snapshotter the system was installed with; the merged
    // configuration only decides for pre-state-file systems
    let mut snapshotter_config = run.snapshotter.clone();
    if let Ok(kind) = state.snapshotter.parse() {
        snapshotter_config.kind = kind;
    }
    let mut snapshotter = new_snapshotter(cfg, snapshotter_config.clone());

    let efi_guard = match find_device_by_label(cfg.runner.as_ref(), EFI_LABEL) {
        Ok(efi_dev) => Some(
            MountGuard::mount_rw(cfg, &efi_dev.path, "vfat", &run_dir.join("efi"))
                .context("upgrade: mounting ESP")?,
        ),
        Err(_) => None,
    };
    let env_dir = efi_guard
        .as_ref()
        .map(|g| g.path().to_path_buf())
        .unwrap_or_else(|| state_guard.path().join("grub2"));

    snapshotter
        .init(state_guard.path(), &env_dir)
        .context("upgrade: initializing snapshotter")?;

    run_hook(cfg, run, "before-upgrade", None)?;
    let mut snapshot = snapshotter
        .start_transaction()
        .context("upgrade: starting transaction")?;

    log::info!("Copying {} image...", ACTIVE_LABEL);
    let digest = match unpack_source(
        cfg,
        &source,
        &snapshot.work_dir,
        &unpack_opts(cfg, run, action.no_verify),
    )
    .context("upgrade: extracting image")
    .and_then(|digest| {
        run_hook(cfg, run, "after-upgrade-chroot", Some(&snapshot.work_dir))?;
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
        return Err(e).context("upgrade: committing snapshot");
    }

    if action.bootloader {
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
        .context("upgrade: bootloader")?;
    }

    let state_partition_state = state.state.get_or_insert_with(|| PartitionState {
        fs_label: STATE_LABEL.to_string(),
        ..Default::default()
    });
    state_partition_state.commit_snapshot(
        snapshot.id,
        SystemState {
            source: source.clone(),
            digest,
            label: Some(ACTIVE_LABEL.to_string()),
            fs: Some(snapshotter_config.fs.clone()),
            date: Some(now()),
            from_action: Some("upgrade".to_string()),
            ..Default::default()
        },
    );
    let existing = snapshotter
        .get_snapshots()
        .context("upgrade: listing snapshots")?;
    state_partition_state.retain_snapshots(&existing);
    state.date = now();
    state.snapshotter = snapshotter.kind().to_string();
    // the snapshot is committed and the state file persisted before the
    // bootloader may point at it
    crate::state::write_install_state(&state, &[state_guard.path(), recovery_guard.path()])
        .context("upgrade: writing state file")?;

    std::fs::create_dir_all(&env_dir)
        .with_context(|| format!("creating {}", env_dir.display()))?;
    set_boot_entries(
        cfg,
        &env_dir,
        "Elemental",
        &state.passive_snapshots(),
        snapshotter.kind(),
    )
    .context("upgrade: bootloader")?;
    if run.boot_assessment {
        arm_boot_assessment(cfg, state_guard.path()).context("upgrade: bootloader")?;
    }

    run_hook(cfg, run, "after-upgrade", None)?;
    log::info!("Upgrade complete.");
    finalize(cfg, action.reboot, action.poweroff, false)
}

/// The --recovery path: only the recovery image is replaced, the deployment
/// snapshots are left alone.
fn upgrade_recovery_only(
    cfg: &Config,
    run: &RunConfig,
    action: &UpgradeConfig,
    source: &ImageSource,
    state: &mut InstallState,
    state_guard: &MountGuard,
    recovery_guard: &MountGuard,
) -> Result<()> {
    log::info!("Upgrading the recovery image only");
    let entry = match source {
        ImageSource::File(_) => install_recovery(cfg, source, recovery_guard.path())
            .context("upgrade: installing recovery image")?,
        _ => {
            let staging = tempfile::Builder::new()
                .prefix("elemental-upgrade.")
                .tempdir_in(recovery_guard.path())
                .context("creating recovery staging directory")?;
            unpack_source(
                cfg,
                source,
                staging.path(),
                &unpack_opts(cfg, run, action.no_verify),
            )
            .context("upgrade: extracting image")?;
            let mut entry = install_recovery(
                cfg,
                &ImageSource::Dir(staging.path().to_path_buf()),
                recovery_guard.path(),
            )
            .context("upgrade: installing recovery image")?;
            entry.source = source.clone();
            entry
        }
    };

    let recovery_state = state.recovery.get_or_insert_with(|| PartitionState {
        fs_label: RECOVERY_LABEL.to_string(),
        ..Default::default()
    });
    recovery_state.recovery_image = Some(entry);
    state.date = now();
    crate::state::write_install_state(state, &[state_guard.path(), recovery_guard.path()])
        .context("upgrade: writing state file")?;

    log::info!("Upgrade complete.");
    finalize(cfg, action.reboot, action.poweroff, false)
}
